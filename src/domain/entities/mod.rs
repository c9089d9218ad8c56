pub mod access;
pub mod plan;
pub mod source_type;
pub mod subscription_status;

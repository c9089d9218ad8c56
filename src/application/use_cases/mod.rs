pub mod access;
pub mod billing_reconciler;
pub mod subscription;
pub mod usage;

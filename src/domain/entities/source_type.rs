use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Where the transcribed media came from.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "usage_source_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceType {
    Youtube,
    #[default]
    Upload,
    Url,
}

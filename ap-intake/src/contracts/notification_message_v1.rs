//! NotificationMessage contract, published to the `notify` queue.

use serde::{Deserialize, Serialize};

use super::CURRENT_SCHEMA_VERSION;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Processed,
    UnknownVendor,
    DuplicateSkipped,
    Duplicate,
    Error,
}

impl NotificationStatus {
    pub fn as_human_readable(&self) -> &'static str {
        match self {
            NotificationStatus::Processed => "processed",
            NotificationStatus::UnknownVendor => "unknown_vendor",
            NotificationStatus::DuplicateSkipped => "duplicate_skipped",
            NotificationStatus::Duplicate => "duplicate",
            NotificationStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationMessageV1 {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    pub id: String,
    pub original_message_id: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    pub status: NotificationStatus,
    pub recipient_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

fn default_schema_version() -> String {
    CURRENT_SCHEMA_VERSION.to_string()
}

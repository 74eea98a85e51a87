//! RawMail contract, published to the `raw-mail` queue.
//!
//! Field names match the wire schema exactly (case-sensitive).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CURRENT_SCHEMA_VERSION;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMailV1 {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Sortable lexicographic event id minted by the producer.
    pub id: String,

    /// Stable upstream provider message id — the deduplication key.
    pub original_message_id: String,

    pub sender: String,
    pub subject: String,

    /// Attachment location, or a sentinel when no attachment was found.
    pub blob_url: String,

    pub received_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_terms: Option<String>,
}

fn default_schema_version() -> String {
    CURRENT_SCHEMA_VERSION.to_string()
}

/// Sentinel `blob_url` used when no attachment could be downloaded.
pub const NO_ATTACHMENT_SENTINEL: &str = "none";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_payload_with_defaulted_schema_version() {
        let json = r#"{
            "id": "01HPQW",
            "original_message_id": "M-001",
            "sender": "billing@acme.com",
            "subject": "Invoice #123",
            "blob_url": "2024/01/02/01HPQW.pdf",
            "received_at": "2024-01-02T03:04:05Z"
        }"#;
        let parsed: RawMailV1 = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.schema_version, "1.0");
        assert_eq!(parsed.original_message_id, "M-001");
        assert!(parsed.vendor_name.is_none());
    }

    #[test]
    fn ignores_unknown_fields() {
        let json = r#"{
            "schema_version": "1.3",
            "id": "01HPQW",
            "original_message_id": "M-002",
            "sender": "billing@acme.com",
            "subject": "Invoice",
            "blob_url": "none",
            "received_at": "2024-01-02T03:04:05Z",
            "future_field": "ignored"
        }"#;
        let parsed: RawMailV1 = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.schema_version, "1.3");
    }
}

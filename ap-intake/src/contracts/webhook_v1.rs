//! Wire shapes for the provider's push-notification webhook.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeNotificationEnvelope {
    pub value: Vec<ChangeNotification>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    pub resource: String,
    #[serde(rename = "changeType")]
    pub change_type: String,
    #[serde(rename = "clientState")]
    pub client_state: String,
    #[serde(rename = "tenantId", default)]
    pub tenant_id: Option<String>,
    #[serde(rename = "subscriptionExpirationDateTime", default)]
    pub subscription_expiration_date_time: Option<String>,
}

/// Envelope enqueued onto `notifications` for each validated change
/// notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsQueueMessageV1 {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub subscription_id: String,
    pub resource: String,
    pub change_type: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

fn default_schema_version() -> String {
    super::CURRENT_SCHEMA_VERSION.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_notification_envelope_parses_graph_shape() {
        let json = r#"{
            "value": [ {
                "subscriptionId": "sub-1",
                "resource": "me/mailFolders('Inbox')/messages",
                "changeType": "created",
                "clientState": "secret-123",
                "tenantId": "tenant-a"
            } ]
        }"#;
        let parsed: ChangeNotificationEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.value.len(), 1);
        assert_eq!(parsed.value[0].client_state, "secret-123");
    }
}

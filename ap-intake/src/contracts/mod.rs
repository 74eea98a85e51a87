pub mod chat_card_v1;
pub mod enriched_invoice_v1;
pub mod notification_message_v1;
pub mod raw_mail_v1;
pub mod webhook_v1;

/// Current major.minor schema version stamped on every queue payload.
/// Consumers accept any `1.x`; see [`accepts_schema_version`].
pub const CURRENT_SCHEMA_VERSION: &str = "1.0";

/// True if `version` is a `1.x` schema the consumers in this crate
/// understand. Unknown fields within an accepted version are ignored
/// by serde's default deserialize behavior (no `deny_unknown_fields`).
pub fn accepts_schema_version(version: &str) -> bool {
    version
        .split('.')
        .next()
        .map(|major| major == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_any_1_x() {
        assert!(accepts_schema_version("1.0"));
        assert!(accepts_schema_version("1.7"));
        assert!(!accepts_schema_version("2.0"));
        assert!(!accepts_schema_version("garbage"));
    }
}

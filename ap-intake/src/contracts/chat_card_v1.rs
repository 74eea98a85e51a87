//! Chat notification envelope. The external shape is fixed by the chat
//! webhook's card schema — field names, nullability, and card version
//! are not negotiable.

use serde::Serialize;
use serde_json::Value;

pub const MAX_PAYLOAD_BYTES: usize = 28 * 1024;
pub const ADAPTIVE_CARD_VERSION: &str = "1.4";
pub const ADAPTIVE_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.adaptive";

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub attachments: Vec<ChatAttachment>,
}

#[derive(Debug, Serialize)]
pub struct ChatAttachment {
    #[serde(rename = "contentType")]
    pub content_type: &'static str,
    #[serde(rename = "contentUrl")]
    pub content_url: Option<()>,
    pub content: AdaptiveCard,
}

#[derive(Debug, Serialize)]
pub struct AdaptiveCard {
    #[serde(rename = "type")]
    pub card_type: &'static str,
    pub version: &'static str,
    pub body: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Value>>,
}

/// A `TextBlock` body element with `wrap: true` set, so long vendor or
/// subject text doesn't get clipped in the card body.
pub fn text_block(text: impl Into<String>) -> Value {
    serde_json::json!({
        "type": "TextBlock",
        "text": text.into(),
        "wrap": true,
    })
}

pub fn build_card(body: Vec<Value>) -> ChatMessage {
    ChatMessage {
        message_type: "message",
        attachments: vec![ChatAttachment {
            content_type: ADAPTIVE_CARD_CONTENT_TYPE,
            content_url: None,
            content: AdaptiveCard {
                card_type: "AdaptiveCard",
                version: ADAPTIVE_CARD_VERSION,
                body,
                actions: None,
            },
        }],
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CardError {
    #[error("serialized card payload is {0} bytes, exceeds the {1}-byte limit")]
    TooLarge(usize, usize),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialize and enforce the < 28 KB payload ceiling before a caller
/// POSTs the card.
pub fn serialize_card(card: &ChatMessage) -> Result<Vec<u8>, CardError> {
    let bytes = serde_json::to_vec(card)?;
    if bytes.len() >= MAX_PAYLOAD_BYTES {
        return Err(CardError::TooLarge(bytes.len(), MAX_PAYLOAD_BYTES));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_required_envelope_fields() {
        let card = build_card(vec![text_block("Invoice processed")]);
        let value: Value = serde_json::to_value(&card).unwrap();
        assert_eq!(value["type"], "message");
        let attachment = &value["attachments"][0];
        assert_eq!(attachment["contentType"], ADAPTIVE_CARD_CONTENT_TYPE);
        assert!(attachment["contentUrl"].is_null());
        assert_eq!(attachment["content"]["version"], "1.4");
        assert_eq!(attachment["content"]["body"][0]["wrap"], true);
    }

    #[test]
    fn rejects_oversized_payload() {
        let huge_text = "x".repeat(MAX_PAYLOAD_BYTES);
        let card = build_card(vec![text_block(huge_text)]);
        let result = serialize_card(&card);
        assert!(matches!(result, Err(CardError::TooLarge(_, _))));
    }
}

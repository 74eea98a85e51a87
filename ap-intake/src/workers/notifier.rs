//! Notifier: consumes `notify` and posts an adaptive card to the chat
//! webhook.

use std::sync::Arc;

use event_bus::EventBus;
use sqlx::PgPool;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::Config;
use crate::contracts::chat_card_v1::{build_card, text_block};
use crate::contracts::notification_message_v1::NotificationMessageV1;
use crate::contracts::{self};
use crate::queue::{self, Outcome};
use crate::repos::queue_repo::{QueueMessage, QueueName};
use crate::retry::{Retriable, RetryConfig};
use crate::services::chat_notifier::ChatNotifier;

pub async fn spawn(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: Arc<Config>,
    chat_notifier: Arc<ChatNotifier>,
    breaker: &'static CircuitBreakerRegistry,
) {
    queue::run_consumer(
        pool,
        bus,
        QueueName::Notify,
        config.dead_letter_threshold,
        config.visibility_timeout.as_secs() as i64,
        move |pool, message| {
            let chat_notifier = Arc::clone(&chat_notifier);
            let config = Arc::clone(&config);
            async move { handle_one(pool, chat_notifier, config, breaker, message).await }
        },
    )
    .await;
}

async fn handle_one(
    _pool: PgPool,
    chat_notifier: Arc<ChatNotifier>,
    config: Arc<Config>,
    breaker: &'static CircuitBreakerRegistry,
    message: QueueMessage,
) -> Outcome {
    let notification: NotificationMessageV1 = match serde_json::from_value(message.payload.clone()) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, message_id = %message.message_id, "malformed notification payload, dropping");
            return Outcome::ForceDeadLetter;
        }
    };

    if !contracts::accepts_schema_version(&notification.schema_version) {
        tracing::warn!(schema_version = %notification.schema_version, "unsupported notification schema version, dropping");
        return Outcome::ForceDeadLetter;
    }

    let card = build_card(vec![
        text_block(format!(
            "Invoice from {} — {}",
            notification.vendor_name,
            notification.status.as_human_readable()
        )),
        text_block(summary_line(&notification)),
    ]);

    let retry_config = RetryConfig::from_config(&config);
    match chat_notifier.send_with_retry(breaker, &retry_config, &card).await {
        Ok(()) => Outcome::Ack,
        Err(e) if e.is_retriable() => {
            tracing::warn!(error = %e, "transient chat webhook failure, will retry");
            Outcome::Retry
        }
        Err(e) => {
            // A permanent notification failure has no further action
            // the dead-letter queue would help with; log and move on
            // rather than letting it pile up there.
            tracing::error!(error = %e, "non-retriable chat webhook failure, dropping");
            Outcome::Ack
        }
    }
}

fn summary_line(notification: &NotificationMessageV1) -> String {
    let amount = notification
        .amount
        .map(|a| format!("{a:.2}"))
        .unwrap_or_else(|| "unknown".to_string());
    match &notification.transaction_id {
        Some(id) => format!("Amount {amount}, recipient {}, transaction {id}", notification.recipient_email),
        None => format!("Amount {amount}, recipient {}", notification.recipient_email),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::notification_message_v1::NotificationStatus;

    fn sample() -> NotificationMessageV1 {
        NotificationMessageV1 {
            schema_version: "1.0".to_string(),
            id: "evt-1".to_string(),
            original_message_id: "M-001".to_string(),
            vendor_name: "Acme Inc".to_string(),
            amount: Some(1234.0),
            status: NotificationStatus::Processed,
            recipient_email: "ap@acme.com".to_string(),
            transaction_id: Some("txn-1".to_string()),
        }
    }

    #[test]
    fn summary_line_includes_transaction_id_when_present() {
        let line = summary_line(&sample());
        assert!(line.contains("txn-1"));
        assert!(line.contains("ap@acme.com"));
    }

    #[test]
    fn summary_line_omits_transaction_id_when_absent() {
        let mut notification = sample();
        notification.transaction_id = None;
        let line = summary_line(&notification);
        assert!(!line.contains("transaction"));
    }
}

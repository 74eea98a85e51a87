//! Notification Worker: consumes `notifications`, fetches the
//! referenced mail item from the provider, and feeds it through the
//! shared ingest pipeline.

use event_bus::EventBus;
use sqlx::PgPool;
use std::sync::Arc;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::Config;
use crate::contracts::webhook_v1::NotificationsQueueMessageV1;
use crate::queue::{self, Outcome};
use crate::repos::queue_repo::{QueueMessage, QueueName};
use crate::retry::{Retriable, RetryConfig};
use crate::services::blob_store::BlobStore;
use crate::services::llm_client::LlmClient;
use crate::services::mail_provider::{self, MailProvider};
use crate::workers::ingest::{self, IngestDeps};

pub async fn spawn(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: Arc<Config>,
    provider: Arc<dyn MailProvider>,
    blob_store: Arc<dyn BlobStore>,
    breaker: &'static CircuitBreakerRegistry,
    llm: Option<Arc<LlmClient>>,
) {
    let handler_bus = Arc::clone(&bus);
    queue::run_consumer(
        pool,
        bus,
        QueueName::Notifications,
        config.dead_letter_threshold,
        config.visibility_timeout.as_secs() as i64,
        move |pool, message| {
            let bus = Arc::clone(&handler_bus);
            let config = Arc::clone(&config);
            let provider = Arc::clone(&provider);
            let blob_store = Arc::clone(&blob_store);
            let llm = llm.clone();
            async move {
                handle_one(pool, bus, config, provider, blob_store, breaker, llm, message).await
            }
        },
    )
    .await;
}

async fn handle_one(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: Arc<Config>,
    provider: Arc<dyn MailProvider>,
    blob_store: Arc<dyn BlobStore>,
    breaker: &'static CircuitBreakerRegistry,
    llm: Option<Arc<LlmClient>>,
    message: QueueMessage,
) -> Outcome {
    let notification: NotificationsQueueMessageV1 =
        match serde_json::from_value(message.payload.clone()) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    message_id = %message.message_id,
                    "malformed notifications payload, dropping"
                );
                return Outcome::ForceDeadLetter;
            }
        };

    let Some(upstream_message_id) = extract_message_id_from_resource(&notification.resource)
    else {
        tracing::warn!(
            resource = %notification.resource,
            "could not parse message id from resource, dropping"
        );
        return Outcome::ForceDeadLetter;
    };

    let retry_config = RetryConfig::from_config(&config);
    let item = match mail_provider::call_with_retry(
        breaker,
        &retry_config,
        "mail_provider.get_item",
        || provider.get_item(&config.ingest_mailbox, &upstream_message_id),
    )
    .await
    {
        Ok(item) => item,
        Err(e) if !e.is_retriable() => {
            tracing::warn!(error = %e, "non-retriable provider error fetching mail item, dropping");
            return Outcome::Ack;
        }
        Err(e) => {
            tracing::warn!(error = %e, "transient provider error fetching mail item, will retry");
            return Outcome::Retry;
        }
    };

    let deps = IngestDeps {
        pool: &pool,
        bus: &bus,
        config: &config,
        provider: provider.as_ref(),
        blob_store: blob_store.as_ref(),
        breaker,
        llm: llm.as_deref(),
    };

    match ingest::ingest_mail_item(&deps, &config.ingest_mailbox, &item).await {
        Ok(outcome) => {
            tracing::debug!(original_message_id = %item.original_message_id, outcome = ?outcome, "notification worker processed item");
            Outcome::Ack
        }
        Err(e) if !e.is_retriable() => {
            tracing::error!(error = %e, "non-retriable ingest failure, dropping");
            Outcome::Ack
        }
        Err(e) => {
            tracing::warn!(error = %e, "transient ingest failure, will retry");
            Outcome::Retry
        }
    }
}

/// Graph-shaped `resource` strings end in `.../messages('<id>')`; pull
/// the id out of the final single-quoted segment.
fn extract_message_id_from_resource(resource: &str) -> Option<String> {
    let start = resource.rfind("('")? + 2;
    let rest = &resource[start..];
    let end = rest.find("')")?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_id_from_graph_resource_shape() {
        let resource = "me/mailFolders('Inbox')/messages('AAMkAGI123')";
        assert_eq!(
            extract_message_id_from_resource(resource).as_deref(),
            Some("AAMkAGI123")
        );
    }

    #[test]
    fn returns_none_for_resource_without_message_segment() {
        assert_eq!(extract_message_id_from_resource("me/mailFolders"), None);
    }
}

//! Timer Poller: the pull-mode fallback to the webhook Notification
//! Worker. Pages through unread mail on a fixed interval
//! and feeds each item through the shared ingest pipeline — the same
//! dedup and loop-prevention guards apply regardless of which path
//! observed the mail first.

use std::sync::Arc;

use event_bus::EventBus;
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::Config;
use crate::services::blob_store::BlobStore;
use crate::services::llm_client::LlmClient;
use crate::retry::RetryConfig;
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
    if !config.mail_ingest_enabled {
        tracing::info!("mail ingest disabled, timer poller not started");
        return;
    }

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        poll_once(&pool, &bus, &config, provider.as_ref(), blob_store.as_ref(), breaker, llm.as_deref()).await;
    }
}

async fn poll_once(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    config: &Config,
    provider: &dyn MailProvider,
    blob_store: &dyn BlobStore,
    breaker: &'static CircuitBreakerRegistry,
    llm: Option<&LlmClient>,
) {
    let deps = IngestDeps {
        pool,
        bus,
        config,
        provider,
        blob_store,
        breaker,
        llm,
    };

    let retry_config = RetryConfig::from_config(config);
    let mut page_token: Option<String> = None;
    let mut processed = 0u32;

    loop {
        let page = mail_provider::call_with_retry(
            breaker,
            &retry_config,
            "mail_provider.list_unread",
            || provider.list_unread(&config.ingest_mailbox, page_token.as_deref()),
        )
        .await;

        let (items, next_page) = match page {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list unread mail, will try again next tick");
                return;
            }
        };

        for item in items.iter().take((config.poll_page_size.saturating_sub(processed)) as usize) {
            match ingest::ingest_mail_item(&deps, &config.ingest_mailbox, item).await {
                Ok(outcome) => {
                    tracing::debug!(original_message_id = %item.original_message_id, outcome = ?outcome, "timer poller processed item");
                }
                Err(e) => {
                    tracing::warn!(error = %e, original_message_id = %item.original_message_id, "timer poller failed to ingest item, will retry next tick");
                }
            }
            processed += 1;
        }

        if processed >= config.poll_page_size || next_page.is_none() {
            break;
        }
        page_token = next_page;
    }
}

//! End-to-end coverage of the shared ingest pipeline's loop-prevention
//! and dedup guards — the two layers that must hold before a mail item
//! is ever downloaded or enqueued.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ap_intake::circuit_breaker::CircuitBreakerRegistry;
use ap_intake::ids::new_event_id;
use ap_intake::repos::transaction_repo::{self, NewTransactionRow, TransactionStatus};
use ap_intake::services::blob_store::FilesystemBlobStore;
use ap_intake::services::mail_provider::{
    CreateSubscriptionRequest, MailItem, MailProvider, ProviderError, SendMailRequest,
    SubscriptionReceipt,
};
use ap_intake::workers::ingest::{self, IngestDeps, IngestOutcome};
use async_trait::async_trait;
use chrono::Utc;
use event_bus::{EventBus, InMemoryBus};
use serial_test::serial;
use sqlx::PgPool;

/// A `MailProvider` that only tracks how many times `mark_read` was
/// called; every other method panics, since the loop-prevention and
/// dedup paths return before ever calling them.
struct RecordingProvider {
    mark_read_calls: AtomicUsize,
}

impl RecordingProvider {
    fn new() -> Self {
        Self {
            mark_read_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MailProvider for RecordingProvider {
    async fn list_unread(
        &self,
        _mailbox: &str,
        _page_token: Option<&str>,
    ) -> Result<(Vec<MailItem>, Option<String>), ProviderError> {
        unreachable!("not exercised by this test")
    }

    async fn get_item(&self, _mailbox: &str, _message_id: &str) -> Result<MailItem, ProviderError> {
        unreachable!("not exercised by this test")
    }

    async fn find_invoice_attachment_id(
        &self,
        _mailbox: &str,
        _message_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        unreachable!("loop/dedup paths must return before this is called")
    }

    async fn download_attachment(
        &self,
        _mailbox: &str,
        _message_id: &str,
        _attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        unreachable!("loop/dedup paths must return before this is called")
    }

    async fn mark_read(&self, _mailbox: &str, _message_id: &str) -> Result<(), ProviderError> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_mail(&self, _request: &SendMailRequest<'_>) -> Result<(), ProviderError> {
        unreachable!("not exercised by this test")
    }

    async fn create_subscription(
        &self,
        _request: &CreateSubscriptionRequest<'_>,
    ) -> Result<SubscriptionReceipt, ProviderError> {
        unreachable!("not exercised by this test")
    }

    async fn renew_subscription(
        &self,
        _subscription_id: &str,
        _new_expiration_utc: chrono::DateTime<Utc>,
    ) -> Result<(), ProviderError> {
        unreachable!("not exercised by this test")
    }
}

fn sample_item(sender: &str, original_message_id: &str) -> MailItem {
    MailItem {
        original_message_id: original_message_id.to_string(),
        sender: sender.to_string(),
        subject: "Invoice #123".to_string(),
        received_at: Utc::now(),
        has_invoice_attachment: true,
        attachment_id: None,
    }
}

async fn cleanup(pool: &PgPool, original_message_id: &str) {
    sqlx::query("DELETE FROM invoice_transactions WHERE original_message_id = $1")
        .bind(original_message_id)
        .execute(pool)
        .await
        .ok();
}

#[tokio::test]
#[serial]
async fn sender_matching_the_mailbox_is_dropped_as_looped() {
    let pool = common::get_test_pool().await;
    let mut config = common::test_config();
    let blob_dir = tempfile::tempdir().expect("tempdir");
    config.blob_store_root = blob_dir.path().to_string_lossy().to_string();

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let provider = RecordingProvider::new();
    let blob_store = FilesystemBlobStore::new(blob_dir.path());
    let breaker = CircuitBreakerRegistry::new(
        config.breaker_failure_threshold,
        config.breaker_open_duration,
    );

    let deps = IngestDeps {
        pool: &pool,
        bus: &bus,
        config: &config,
        provider: &provider,
        blob_store: &blob_store,
        breaker: &breaker,
        llm: None,
    };

    let message_id = format!("loop-test-{}", new_event_id());
    let item = sample_item(&config.ingest_mailbox, &message_id);

    let outcome = ingest::ingest_mail_item(&deps, &config.ingest_mailbox, &item)
        .await
        .expect("ingest should not error on a looped item");

    assert_eq!(outcome, IngestOutcome::SkippedLooped);
    assert_eq!(
        provider.mark_read_calls.load(Ordering::SeqCst),
        1,
        "a looped item must still be marked read so it isn't reprocessed forever"
    );

    let seen = transaction_repo::was_processed(&pool, &message_id, 30)
        .await
        .expect("was_processed should succeed");
    assert!(
        !seen,
        "a looped item is logged as `looped`, not `processed`, so it must not satisfy the dedup oracle"
    );

    cleanup(&pool, &message_id).await;
}

#[tokio::test]
#[serial]
async fn an_already_processed_message_id_is_skipped_as_duplicate() {
    let pool = common::get_test_pool().await;
    let mut config = common::test_config();
    let blob_dir = tempfile::tempdir().expect("tempdir");
    config.blob_store_root = blob_dir.path().to_string_lossy().to_string();

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let provider = RecordingProvider::new();
    let blob_store = FilesystemBlobStore::new(blob_dir.path());
    let breaker = CircuitBreakerRegistry::new(
        config.breaker_failure_threshold,
        config.breaker_open_duration,
    );

    let deps = IngestDeps {
        pool: &pool,
        bus: &bus,
        config: &config,
        provider: &provider,
        blob_store: &blob_store,
        breaker: &breaker,
        llm: None,
    };

    let message_id = format!("dup-test-{}", new_event_id());

    transaction_repo::append(
        &pool,
        &NewTransactionRow {
            event_id: new_event_id(),
            yyyymm: ap_intake::ids::yyyymm(Utc::now()),
            original_message_id: message_id.clone(),
            vendor_name: Some("Acme Inc".to_string()),
            sender: "ap@acme.com".to_string(),
            subject: "Invoice #123".to_string(),
            status: TransactionStatus::Processed,
            recipient_email: Some("ap@example.com".to_string()),
            amount: Some(1000.0),
            currency: Some("USD".to_string()),
            match_method: Some("exact".to_string()),
            duplicate_of_transaction_id: None,
            vendor_key: None,
            invoice_date: None,
        },
    )
    .await
    .expect("seeding the processed row should succeed");

    let item = sample_item("ap@acme.com", &message_id);

    let outcome = ingest::ingest_mail_item(&deps, &config.ingest_mailbox, &item)
        .await
        .expect("ingest should not error on a duplicate item");

    assert_eq!(outcome, IngestOutcome::SkippedDuplicate);
    assert_eq!(
        provider.mark_read_calls.load(Ordering::SeqCst),
        1,
        "a duplicate item must still be marked read"
    );

    cleanup(&pool, &message_id).await;
}

#[tokio::test]
#[serial]
async fn an_item_without_an_invoice_attachment_is_skipped_before_any_provider_call() {
    let pool = common::get_test_pool().await;
    let mut config = common::test_config();
    let blob_dir = tempfile::tempdir().expect("tempdir");
    config.blob_store_root = blob_dir.path().to_string_lossy().to_string();

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let provider = RecordingProvider::new();
    let blob_store = FilesystemBlobStore::new(blob_dir.path());
    let breaker = CircuitBreakerRegistry::new(
        config.breaker_failure_threshold,
        config.breaker_open_duration,
    );

    let deps = IngestDeps {
        pool: &pool,
        bus: &bus,
        config: &config,
        provider: &provider,
        blob_store: &blob_store,
        breaker: &breaker,
        llm: None,
    };

    let message_id = format!("no-attachment-test-{}", new_event_id());
    let mut item = sample_item("ap@acme.com", &message_id);
    item.has_invoice_attachment = false;

    let outcome = ingest::ingest_mail_item(&deps, &config.ingest_mailbox, &item)
        .await
        .expect("ingest should not error on an attachment-less item");

    assert_eq!(outcome, IngestOutcome::SkippedNoAttachment);
    assert_eq!(
        provider.mark_read_calls.load(Ordering::SeqCst),
        0,
        "an attachment-less item is left unread, not mark_read, and never reaches the provider"
    );
}

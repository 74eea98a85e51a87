//! Shared feeder logic.
//!
//! The Notification Worker (push) and the Timer Poller (pull) converge
//! on the same sender-validation → dedup → download → enqueue →
//! mark-read sequence so neither path can double-process an upstream
//! mail the other has already handled — both consult the same
//! deduplication oracle before touching the blob store or `raw-mail`.

use chrono::Utc;
use event_bus::EventBus;
use sqlx::PgPool;
use std::sync::Arc;

use crate::circuit_breaker::{BreakerError, CircuitBreakerRegistry};
use crate::config::Config;
use crate::contracts::raw_mail_v1::{RawMailV1, NO_ATTACHMENT_SENTINEL};
use crate::ids::{new_event_id, yyyymm};
use crate::queue;
use crate::redact::domain_of;
use crate::repos::queue_repo::{QueueError, QueueName};
use crate::repos::transaction_repo::{
    self, NewTransactionRow, TransactionLogError, TransactionStatus,
};
use crate::retry::{retry_with_backoff, Retriable, RetryConfig};
use crate::services::blob_store::{BlobError, BlobStore};
use crate::services::llm_client::LlmClient;
use crate::services::mail_provider::{self, MailItem, MailProvider, ProviderError};
use crate::services::pdf_extractor::{self, ExtractedFields};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("provider error: {0}")]
    Provider(#[from] BreakerError<ProviderError>),
    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),
    #[error("transaction log error: {0}")]
    TransactionLog(#[from] TransactionLogError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to serialize raw mail envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Retriable for IngestError {
    fn is_retriable(&self) -> bool {
        match self {
            IngestError::Provider(e) => e.is_retriable(),
            IngestError::Blob(_) => true,
            IngestError::TransactionLog(_) => true,
            IngestError::Queue(_) => true,
            IngestError::Serialize(_) => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Enqueued,
    SkippedLooped,
    SkippedDuplicate,
    SkippedNoAttachment,
}

/// Collaborators the ingest pipeline needs, borrowed for the duration
/// of a single `ingest_mail_item` call.
pub struct IngestDeps<'a> {
    pub pool: &'a PgPool,
    pub bus: &'a Arc<dyn EventBus>,
    pub config: &'a Config,
    pub provider: &'a dyn MailProvider,
    pub blob_store: &'a dyn BlobStore,
    pub breaker: &'a CircuitBreakerRegistry,
    pub llm: Option<&'a LlmClient>,
}

/// Run the shared ingest pipeline for one observed `item`. `mailbox` is
/// the mailbox the item was read from — always `config.ingest_mailbox`
/// in production, threaded explicitly so the function stays testable
/// without a live `Config`.
pub async fn ingest_mail_item(
    deps: &IngestDeps<'_>,
    mailbox: &str,
    item: &MailItem,
) -> Result<IngestOutcome, IngestError> {
    // Layer 1 of loop prevention.
    if item.sender.eq_ignore_ascii_case(mailbox) {
        tracing::warn!(
            sender_domain = domain_of(&item.sender),
            original_message_id = %item.original_message_id,
            "sender matches ingest mailbox, dropping as looped"
        );
        append_terminal(deps, item, TransactionStatus::Looped).await;
        mark_read_best_effort(deps, mailbox, item).await;
        return Ok(IngestOutcome::SkippedLooped);
    }

    if !item.has_invoice_attachment {
        return Ok(IngestOutcome::SkippedNoAttachment);
    }

    if transaction_repo::was_processed(
        deps.pool,
        &item.original_message_id,
        deps.config.dedup_window_days,
    )
    .await?
    {
        tracing::info!(
            original_message_id = %item.original_message_id,
            "already processed within dedup window, skipping"
        );
        append_terminal(deps, item, TransactionStatus::DuplicateSkipped).await;
        mark_read_best_effort(deps, mailbox, item).await;
        return Ok(IngestOutcome::SkippedDuplicate);
    }

    let retry_config = RetryConfig::from_config(deps.config);

    let attachment_id = mail_provider::call_with_retry(
        deps.breaker,
        &retry_config,
        "mail_provider.find_invoice_attachment_id",
        || {
            deps.provider
                .find_invoice_attachment_id(mailbox, &item.original_message_id)
        },
    )
    .await?;

    let (blob_url, extracted) = match attachment_id {
        None => (NO_ATTACHMENT_SENTINEL.to_string(), ExtractedFields::default()),
        Some(attachment_id) => {
            let bytes = mail_provider::call_with_retry(
                deps.breaker,
                &retry_config,
                "mail_provider.download_attachment",
                || {
                    deps.provider.download_attachment(
                        mailbox,
                        &item.original_message_id,
                        &attachment_id,
                    )
                },
            )
            .await?;

            let event_id = new_event_id();
            let blob_url = retry_with_backoff(
                || deps.blob_store.put(item.received_at, &event_id, &bytes),
                &retry_config,
                "blob_store.put",
            )
            .await?;

            let extracted = if deps.config.pdf_pre_extraction_enabled {
                pdf_extractor::extract(&bytes, deps.llm).await
            } else {
                ExtractedFields::default()
            };

            (blob_url, extracted)
        }
    };

    let raw_mail = RawMailV1 {
        schema_version: crate::contracts::CURRENT_SCHEMA_VERSION.to_string(),
        id: new_event_id(),
        original_message_id: item.original_message_id.clone(),
        sender: item.sender.clone(),
        subject: item.subject.clone(),
        blob_url,
        received_at: item.received_at,
        vendor_name: extracted.vendor_name_candidate,
        invoice_amount: extracted.amount,
        currency: extracted.currency,
        due_date: extracted.due_date,
        payment_terms: extracted.payment_terms,
    };

    let payload = serde_json::to_value(&raw_mail)?;
    queue::enqueue_and_notify(deps.pool, deps.bus, QueueName::RawMail, &payload).await?;

    // The blob and the raw-mail queue entry must both exist before the
    // mail is marked read, so a crash between download and enqueue
    // leaves the item unread and eligible for a retry on the next pass.
    mail_provider::call_with_retry(deps.breaker, &retry_config, "mail_provider.mark_read", || {
        deps.provider.mark_read(mailbox, &item.original_message_id)
    })
    .await?;

    Ok(IngestOutcome::Enqueued)
}

async fn mark_read_best_effort(deps: &IngestDeps<'_>, mailbox: &str, item: &MailItem) {
    let retry_config = RetryConfig::from_config(deps.config);
    if let Err(e) = mail_provider::call_with_retry(
        deps.breaker,
        &retry_config,
        "mail_provider.mark_read",
        || deps.provider.mark_read(mailbox, &item.original_message_id),
    )
    .await
    {
        tracing::warn!(
            error = %e,
            original_message_id = %item.original_message_id,
            "failed to mark looped/duplicate mail read"
        );
    }
}

async fn append_terminal(deps: &IngestDeps<'_>, item: &MailItem, status: TransactionStatus) {
    let row = NewTransactionRow {
        event_id: new_event_id(),
        yyyymm: yyyymm(Utc::now()),
        original_message_id: item.original_message_id.clone(),
        vendor_name: None,
        sender: item.sender.clone(),
        subject: item.subject.clone(),
        status,
        recipient_email: None,
        amount: None,
        currency: None,
        match_method: None,
        duplicate_of_transaction_id: None,
        vendor_key: None,
        invoice_date: None,
    };
    if let Err(e) = transaction_repo::append(deps.pool, &row).await {
        tracing::error!(
            error = %e,
            original_message_id = %item.original_message_id,
            "failed to append transaction row"
        );
    }
}

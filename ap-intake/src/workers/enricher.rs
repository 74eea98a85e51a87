//! Enricher: consumes `raw-mail`, matches a vendor, and publishes an
//! `EnrichedInvoiceV1` onto `to-post`.

use std::sync::Arc;

use chrono::Utc;
use event_bus::EventBus;
use sqlx::PgPool;

use crate::cache::VendorCache;
use crate::config::Config;
use crate::contracts::enriched_invoice_v1::{EnrichedInvoiceV1, InvoiceStatus, MatchMethod};
use crate::contracts::notification_message_v1::{NotificationMessageV1, NotificationStatus};
use crate::contracts::raw_mail_v1::RawMailV1;
use crate::contracts::{self, CURRENT_SCHEMA_VERSION};
use crate::ids::{new_event_id, yyyymm};
use crate::metrics;
use crate::queue::{self, Outcome};
use crate::repos::queue_repo::{QueueMessage, QueueName};
use crate::repos::transaction_repo::{
    self, NewTransactionRow, TransactionLogError, TransactionStatus,
};
use crate::retry::Retriable;
use crate::services::llm_client::LlmClient;
use crate::services::vendor_matcher::{MatchInput, VendorMatcher};

pub async fn spawn(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: Arc<Config>,
    vendor_cache: Arc<VendorCache>,
    llm: Option<Arc<LlmClient>>,
) {
    let handler_bus = Arc::clone(&bus);
    queue::run_consumer(
        pool,
        bus,
        QueueName::RawMail,
        config.dead_letter_threshold,
        config.visibility_timeout.as_secs() as i64,
        move |pool, message| {
            let bus = Arc::clone(&handler_bus);
            let config = Arc::clone(&config);
            let vendor_cache = Arc::clone(&vendor_cache);
            let llm = llm.clone();
            async move { handle_one(pool, bus, config, vendor_cache, llm, message).await }
        },
    )
    .await;
}

async fn handle_one(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: Arc<Config>,
    vendor_cache: Arc<VendorCache>,
    llm: Option<Arc<LlmClient>>,
    message: QueueMessage,
) -> Outcome {
    let raw: RawMailV1 = match serde_json::from_value(message.payload.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, message_id = %message.message_id, "malformed raw-mail payload, dropping");
            return Outcome::ForceDeadLetter;
        }
    };

    if !contracts::accepts_schema_version(&raw.schema_version) {
        tracing::warn!(schema_version = %raw.schema_version, "unsupported raw-mail schema version, dropping");
        return Outcome::ForceDeadLetter;
    }

    if match transaction_repo::was_processed(&pool, &raw.original_message_id, config.dedup_window_days).await {
        Ok(was) => was,
        Err(e) => return retry_or_ack(e),
    } {
        tracing::info!(original_message_id = %raw.original_message_id, "already processed, dropping at enricher");
        append_row(&pool, &raw, TransactionStatus::DuplicateSkipped, None, None, None).await;
        metrics::record_outcome(TransactionStatus::DuplicateSkipped.as_str());
        emit_notification(
            &pool,
            &bus,
            &raw,
            NotificationStatus::DuplicateSkipped,
            &config.ap_email_address,
            None,
        )
        .await;
        return Outcome::Ack;
    }

    let matcher = VendorMatcher::new(&pool, &vendor_cache, llm.as_deref(), config.vendor_fuzzy_threshold);
    let match_input = MatchInput {
        vendor_name_candidate: raw.vendor_name.as_deref(),
        sender_email: &raw.sender,
        subject: &raw.subject,
    };
    let matched = match matcher.match_vendor(&match_input).await {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, original_message_id = %raw.original_message_id, "vendor lookup failed");
            return Outcome::Retry;
        }
    };

    let (status, vendor_name, recipient_email) = match &matched.vendor {
        None => (
            InvoiceStatus::Unknown,
            raw.vendor_name.clone().unwrap_or_else(|| "Unknown".to_string()),
            config.vendor_registration_mailbox.clone(),
        ),
        Some(vendor) if vendor.product_category.as_deref().map(|c| c.eq_ignore_ascii_case("reseller")).unwrap_or(false) => {
            (InvoiceStatus::Reseller, vendor.vendor_name.clone(), config.reseller_mailbox.clone())
        }
        Some(vendor) => {
            let recipient = vendor
                .billing_party
                .as_deref()
                .filter(|party| config.is_allowed_recipient(party))
                .map(str::to_string)
                .unwrap_or_else(|| config.ap_email_address.clone());
            (InvoiceStatus::Enriched, vendor.vendor_name.clone(), recipient)
        }
    };

    let mut enriched = EnrichedInvoiceV1::from_raw_mail(
        &raw,
        vendor_name,
        status.clone(),
        recipient_email,
        matched.confidence,
        matched.method.clone(),
    );

    if status == InvoiceStatus::Unknown {
        enriched.subject = format!("[Unknown vendor] {}", raw.subject);
    }

    if let Some(vendor) = &matched.vendor {
        enriched.expense_dept = vendor.expense_dept.clone();
        enriched.gl_code = vendor.gl_code.clone();
        enriched.allocation_schedule = vendor.allocation_schedule.clone();
        enriched.billing_party = vendor.billing_party.clone();
    }

    if status == InvoiceStatus::Enriched {
        if let Some(candidate_transaction_id) = find_candidate_duplicate(&pool, &enriched, &raw).await {
            if config.candidate_dup_blocks {
                tracing::info!(
                    original_message_id = %raw.original_message_id,
                    candidate_of = %candidate_transaction_id,
                    "candidate duplicate blocked by configuration"
                );
                append_row(
                    &pool,
                    &raw,
                    TransactionStatus::DuplicateSkipped,
                    Some(&enriched.vendor_name),
                    Some(&enriched.recipient_email),
                    Some(candidate_transaction_id.clone()),
                )
                .await;
                metrics::record_outcome(TransactionStatus::DuplicateSkipped.as_str());
                emit_notification(
                    &pool,
                    &bus,
                    &raw,
                    NotificationStatus::Duplicate,
                    &enriched.recipient_email,
                    Some(candidate_transaction_id),
                )
                .await;
                return Outcome::Ack;
            }
            enriched.candidate_duplicate_of = Some(candidate_transaction_id);
        }
    }

    let payload = match serde_json::to_value(&enriched) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize enriched invoice");
            return Outcome::ForceDeadLetter;
        }
    };

    match queue::enqueue_and_notify(&pool, &bus, QueueName::ToPost, &payload).await {
        Ok(_) => Outcome::Ack,
        Err(e) => {
            tracing::warn!(error = %e, "failed to enqueue to-post, will retry");
            Outcome::Retry
        }
    }
}

async fn find_candidate_duplicate(pool: &PgPool, enriched: &EnrichedInvoiceV1, raw: &RawMailV1) -> Option<String> {
    let Some(due_date) = raw
        .due_date
        .as_deref()
        .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    else {
        return None;
    };

    let vendor_key = crate::normalize::normalize_vendor_key(&enriched.vendor_name);
    match transaction_repo::find_candidate_duplicate(pool, &vendor_key, &raw.sender, due_date, 90).await {
        Ok(hit) => hit,
        Err(e) => {
            tracing::warn!(error = %e, "candidate-duplicate lookup failed, continuing without annotation");
            None
        }
    }
}

async fn append_row(
    pool: &PgPool,
    raw: &RawMailV1,
    status: TransactionStatus,
    vendor_name: Option<&str>,
    recipient_email: Option<&str>,
    duplicate_of_transaction_id: Option<String>,
) {
    let row = NewTransactionRow {
        event_id: new_event_id(),
        yyyymm: yyyymm(Utc::now()),
        original_message_id: raw.original_message_id.clone(),
        vendor_name: vendor_name.map(str::to_string),
        sender: raw.sender.clone(),
        subject: raw.subject.clone(),
        status,
        recipient_email: recipient_email.map(str::to_string),
        amount: raw.invoice_amount,
        currency: raw.currency.clone(),
        match_method: None,
        duplicate_of_transaction_id,
        vendor_key: vendor_name.map(crate::normalize::normalize_vendor_key),
        invoice_date: raw
            .due_date
            .as_deref()
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
    };
    if let Err(e) = transaction_repo::append(pool, &row).await {
        tracing::error!(error = %e, original_message_id = %raw.original_message_id, "failed to append transaction row");
    }
}

async fn emit_notification(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    raw: &RawMailV1,
    status: NotificationStatus,
    recipient_email: &str,
    transaction_id: Option<String>,
) {
    let notification = NotificationMessageV1 {
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        id: new_event_id(),
        original_message_id: raw.original_message_id.clone(),
        vendor_name: raw.vendor_name.clone().unwrap_or_else(|| "Unknown".to_string()),
        amount: raw.invoice_amount,
        status,
        recipient_email: recipient_email.to_string(),
        transaction_id,
    };
    let payload = match serde_json::to_value(&notification) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize duplicate notification");
            return;
        }
    };
    if let Err(e) = queue::enqueue_and_notify(pool, bus, QueueName::Notify, &payload).await {
        tracing::warn!(error = %e, "failed to enqueue duplicate notification");
    }
}

fn retry_or_ack(e: TransactionLogError) -> Outcome {
    tracing::error!(error = %e, "dedup check failed");
    if e.is_retriable() {
        Outcome::Retry
    } else {
        Outcome::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw() -> RawMailV1 {
        RawMailV1 {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            id: "evt-1".to_string(),
            original_message_id: "M-001".to_string(),
            sender: "billing@acme.com".to_string(),
            subject: "Invoice #123".to_string(),
            blob_url: "2024/01/02/evt-1.pdf".to_string(),
            received_at: Utc::now(),
            vendor_name: None,
            invoice_amount: Some(1234.0),
            currency: Some("USD".to_string()),
            due_date: None,
            payment_terms: None,
        }
    }

    #[test]
    fn unknown_vendor_status_prefixes_subject() {
        let raw = sample_raw();
        let mut enriched = EnrichedInvoiceV1::from_raw_mail(
            &raw,
            "Unknown".to_string(),
            InvoiceStatus::Unknown,
            "ap@acme.com".to_string(),
            0,
            MatchMethod::None,
        );
        enriched.subject = format!("[Unknown vendor] {}", raw.subject);
        assert_eq!(enriched.subject, "[Unknown vendor] Invoice #123");
    }
}

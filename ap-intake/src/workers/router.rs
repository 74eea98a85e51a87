//! Router: consumes `to-post`, sends the outbound invoice mail,
//! appends the terminal transaction row, and emits a `notify` message
//! for the chat card.

use std::sync::Arc;

use chrono::Utc;
use event_bus::EventBus;
use sqlx::PgPool;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::Config;
use crate::contracts::enriched_invoice_v1::{EnrichedInvoiceV1, InvoiceStatus};
use crate::contracts::notification_message_v1::{NotificationMessageV1, NotificationStatus};
use crate::contracts::raw_mail_v1::NO_ATTACHMENT_SENTINEL;
use crate::contracts::{self, CURRENT_SCHEMA_VERSION};
use crate::ids::{new_event_id, yyyymm};
use crate::metrics;
use crate::queue::{self, Outcome};
use crate::repos::queue_repo::{QueueMessage, QueueName};
use crate::repos::transaction_repo::{self, NewTransactionRow, TransactionStatus};
use crate::retry::{retry_with_backoff, Retriable, RetryConfig};
use crate::services::blob_store::BlobStore;
use crate::services::mail_provider::{self, MailProvider, SendMailRequest};

pub async fn spawn(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: Arc<Config>,
    provider: Arc<dyn MailProvider>,
    blob_store: Arc<dyn BlobStore>,
    breaker: &'static CircuitBreakerRegistry,
) {
    let handler_bus = Arc::clone(&bus);
    queue::run_consumer(
        pool,
        bus,
        QueueName::ToPost,
        config.dead_letter_threshold,
        config.visibility_timeout.as_secs() as i64,
        move |pool, message| {
            let bus = Arc::clone(&handler_bus);
            let config = Arc::clone(&config);
            let provider = Arc::clone(&provider);
            let blob_store = Arc::clone(&blob_store);
            async move { handle_one(pool, bus, config, provider, blob_store, breaker, message).await }
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
    message: QueueMessage,
) -> Outcome {
    let invoice: EnrichedInvoiceV1 = match serde_json::from_value(message.payload.clone()) {
        Ok(invoice) => invoice,
        Err(e) => {
            tracing::warn!(error = %e, message_id = %message.message_id, "malformed enriched invoice payload, dropping");
            return Outcome::ForceDeadLetter;
        }
    };

    if !contracts::accepts_schema_version(&invoice.schema_version) {
        tracing::warn!(schema_version = %invoice.schema_version, "unsupported enriched invoice schema version, dropping");
        return Outcome::ForceDeadLetter;
    }

    // Layer 3 of loop prevention: never deliver to the ingest mailbox,
    // however an upstream stage computed the recipient.
    if !config.is_safe_recipient(&invoice.recipient_email) {
        tracing::error!(
            original_message_id = %invoice.original_message_id,
            "recipient resolved to the ingest mailbox, refusing to send"
        );
        if let Err(e) = append_row(&pool, &invoice, TransactionStatus::Looped, None).await {
            tracing::error!(error = %e, original_message_id = %invoice.original_message_id, "failed to append looped transaction row");
        }
        metrics::record_outcome("looped");
        emit_notification(&pool, &bus, &invoice, NotificationStatus::Error, None).await;
        return Outcome::Ack;
    }

    // Layer 2 of loop prevention: re-check the dedup oracle immediately
    // before sending, in case a concurrent delivery raced ahead of us.
    match transaction_repo::was_processed(&pool, &invoice.original_message_id, config.dedup_window_days).await {
        Ok(true) => {
            tracing::info!(original_message_id = %invoice.original_message_id, "already processed, dropping at router");
            metrics::record_outcome("duplicate_skipped");
            emit_notification(&pool, &bus, &invoice, NotificationStatus::DuplicateSkipped, None).await;
            return Outcome::Ack;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(error = %e, "dedup re-check failed");
            return if e.is_retriable() { Outcome::Retry } else { Outcome::Ack };
        }
    }

    let retry_config = RetryConfig::from_config(&config);

    let attachment = if invoice.blob_url == NO_ATTACHMENT_SENTINEL {
        None
    } else {
        match retry_with_backoff(
            || blob_store.get(&invoice.blob_url),
            &retry_config,
            "blob_store.get",
        )
        .await
        {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(error = %e, blob_url = %invoice.blob_url, "failed to fetch attachment, will retry");
                return Outcome::Retry;
            }
        }
    };

    let subject = format!("Invoice — {} — {}", invoice.vendor_name, format_amount(invoice.invoice_amount, invoice.currency.as_deref()));
    let body = build_body(&invoice, &config);
    let attachment_filename = attachment.as_ref().map(|_| "invoice.pdf");

    let send_result = mail_provider::call_with_retry(
        breaker,
        &retry_config,
        "mail_provider.send_mail",
        || {
            provider.send_mail(&SendMailRequest {
                to: &invoice.recipient_email,
                subject: &subject,
                body_text: &body,
                attachment_bytes: attachment.as_deref(),
                attachment_filename,
            })
        },
    )
    .await;

    if let Err(e) = send_result {
        if e.is_retriable() {
            tracing::warn!(error = %e, "transient send failure, will retry");
            return Outcome::Retry;
        }
        tracing::error!(error = %e, "non-retriable send failure");
        if let Err(e) = append_row(&pool, &invoice, TransactionStatus::Error, None).await {
            tracing::error!(error = %e, original_message_id = %invoice.original_message_id, "failed to append error transaction row");
        }
        metrics::record_outcome("error");
        return Outcome::ForceDeadLetter;
    }

    let transaction_id = new_event_id();
    let final_status = transaction_status_for(&invoice.status);
    if let Err(e) = append_row(&pool, &invoice, final_status, Some(transaction_id.clone())).await {
        // The mail already went out; redelivering this message would
        // send it again. Dead-letter rather than retry.
        tracing::error!(error = %e, original_message_id = %invoice.original_message_id, "failed to append transaction row after successful send");
        metrics::record_outcome("error");
        return Outcome::ForceDeadLetter;
    }
    metrics::record_outcome(final_status.as_str());

    emit_notification(
        &pool,
        &bus,
        &invoice,
        notification_status_for(&invoice.status),
        Some(transaction_id),
    )
    .await;

    Outcome::Ack
}

fn transaction_status_for(status: &InvoiceStatus) -> TransactionStatus {
    match status {
        InvoiceStatus::Enriched | InvoiceStatus::Reseller => TransactionStatus::Processed,
        InvoiceStatus::Unknown => TransactionStatus::Unknown,
    }
}

fn notification_status_for(status: &InvoiceStatus) -> NotificationStatus {
    match status {
        InvoiceStatus::Enriched | InvoiceStatus::Reseller => NotificationStatus::Processed,
        InvoiceStatus::Unknown => NotificationStatus::UnknownVendor,
    }
}

async fn append_row(
    pool: &PgPool,
    invoice: &EnrichedInvoiceV1,
    status: TransactionStatus,
    transaction_id: Option<String>,
) -> Result<(), transaction_repo::TransactionLogError> {
    let row = NewTransactionRow {
        event_id: transaction_id.unwrap_or_else(new_event_id),
        yyyymm: yyyymm(Utc::now()),
        original_message_id: invoice.original_message_id.clone(),
        vendor_name: Some(invoice.vendor_name.clone()),
        sender: invoice.sender.clone(),
        subject: invoice.subject.clone(),
        status,
        recipient_email: Some(invoice.recipient_email.clone()),
        amount: invoice.invoice_amount,
        currency: invoice.currency.clone(),
        match_method: Some(invoice.match_method.to_string()),
        duplicate_of_transaction_id: invoice.candidate_duplicate_of.clone(),
        vendor_key: Some(crate::normalize::normalize_vendor_key(&invoice.vendor_name)),
        invoice_date: invoice
            .due_date
            .as_deref()
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
    };
    transaction_repo::append(pool, &row).await
}

async fn emit_notification(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    invoice: &EnrichedInvoiceV1,
    status: NotificationStatus,
    transaction_id: Option<String>,
) {
    let notification = NotificationMessageV1 {
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        id: new_event_id(),
        original_message_id: invoice.original_message_id.clone(),
        vendor_name: invoice.vendor_name.clone(),
        amount: invoice.invoice_amount,
        status,
        recipient_email: invoice.recipient_email.clone(),
        transaction_id,
    };
    let payload = match serde_json::to_value(&notification) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize notification");
            return;
        }
    };
    if let Err(e) = queue::enqueue_and_notify(pool, bus, QueueName::Notify, &payload).await {
        tracing::warn!(error = %e, "failed to enqueue notification");
    }
}

fn build_body(invoice: &EnrichedInvoiceV1, config: &Config) -> String {
    let mut lines = vec![format!("Vendor: {}", invoice.vendor_name)];
    if let Some(dept) = &invoice.expense_dept {
        lines.push(format!("Expense department: {dept}"));
    }
    if let Some(gl_code) = &invoice.gl_code {
        lines.push(format!("GL code: {gl_code}"));
    }
    if let Some(schedule) = &invoice.allocation_schedule {
        lines.push(format!("Allocation schedule: {schedule}"));
    }
    if let Some(billing_party) = &invoice.billing_party {
        lines.push(format!("Billing party: {billing_party}"));
    }
    lines.push(format!(
        "Amount: {}",
        format_amount(invoice.invoice_amount, invoice.currency.as_deref())
    ));
    if let Some(due_date) = &invoice.due_date {
        lines.push(format!("Due date: {due_date}"));
    }
    if !config.function_app_url.is_empty() {
        lines.push(format!(
            "Source attachment: {}/attachments/{}",
            config.function_app_url, invoice.id
        ));
    }
    lines.join("\n")
}

/// Renders an amount as `"$1,234.56"`-style text; missing amounts and
/// unrecognized currencies fall back to a plain placeholder.
fn format_amount(amount: Option<f64>, currency: Option<&str>) -> String {
    let Some(amount) = amount else {
        return "unknown amount".to_string();
    };
    let symbol = match currency {
        Some("USD") | None => "$",
        Some("EUR") => "€",
        Some("CAD") => "CA$",
        Some(other) => return format!("{other} {}", grouped_decimal(amount)),
    };
    format!("{symbol}{}", grouped_decimal(amount))
}

/// Formats `amount` with two decimal places and thousands separators,
/// e.g. `1234.5` -> `"1,234.50"`.
fn grouped_decimal(amount: f64) -> String {
    let cents = (amount * 100.0).round() as i64;
    let negative = cents < 0;
    let cents = cents.unsigned_abs();
    let whole = cents / 100;
    let frac = cents % 100;

    let whole_str = whole.to_string();
    let mut grouped = String::with_capacity(whole_str.len() + whole_str.len() / 3);
    for (i, c) in whole_str.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let grouped: String = grouped.chars().rev().collect();

    format!("{}{grouped}.{frac:02}", if negative { "-" } else { "" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_amount_with_thousands_separator() {
        assert_eq!(format_amount(Some(1234.0), Some("USD")), "$1,234.00");
    }

    #[test]
    fn formats_amount_with_cents() {
        assert_eq!(format_amount(Some(1234.5), Some("USD")), "$1,234.50");
    }

    #[test]
    fn missing_amount_renders_placeholder() {
        assert_eq!(format_amount(None, Some("USD")), "unknown amount");
    }

    #[test]
    fn formats_small_amount_without_separator() {
        assert_eq!(format_amount(Some(42.0), None), "$42.00");
    }

    #[test]
    fn unrecognized_currency_falls_back_to_code_prefix() {
        assert_eq!(format_amount(Some(10.0), Some("GBP")), "GBP 10.00");
    }

    #[test]
    fn transaction_status_maps_unknown_to_unknown() {
        assert_eq!(transaction_status_for(&InvoiceStatus::Unknown), TransactionStatus::Unknown);
        assert_eq!(transaction_status_for(&InvoiceStatus::Enriched), TransactionStatus::Processed);
        assert_eq!(transaction_status_for(&InvoiceStatus::Reseller), TransactionStatus::Processed);
    }

    #[test]
    fn notification_status_maps_unknown_to_unknown_vendor() {
        assert_eq!(notification_status_for(&InvoiceStatus::Unknown), NotificationStatus::UnknownVendor);
        assert_eq!(notification_status_for(&InvoiceStatus::Enriched), NotificationStatus::Processed);
    }
}

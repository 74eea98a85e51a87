//! Transaction Log repository — the deduplication oracle.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use sqlx::{FromRow, PgPool};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Processed,
    Unknown,
    DuplicateSkipped,
    Error,
    Looped,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Processed => "processed",
            TransactionStatus::Unknown => "unknown",
            TransactionStatus::DuplicateSkipped => "duplicate_skipped",
            TransactionStatus::Error => "error",
            TransactionStatus::Looped => "looped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTransactionRow {
    pub event_id: String,
    pub yyyymm: String,
    pub original_message_id: String,
    pub vendor_name: Option<String>,
    pub sender: String,
    pub subject: String,
    pub status: TransactionStatus,
    pub recipient_email: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub match_method: Option<String>,
    pub duplicate_of_transaction_id: Option<String>,
    /// Normalized vendor key and invoice date, when known. Hashed
    /// together with `sender` into `candidate_duplicate_hash` so
    /// `find_candidate_duplicate` has something to compare against.
    pub vendor_key: Option<String>,
    pub invoice_date: Option<chrono::NaiveDate>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub event_id: String,
    pub yyyymm: String,
    pub original_message_id: String,
    pub vendor_name: Option<String>,
    pub sender: String,
    pub subject: String,
    pub status: String,
    pub processed_at: DateTime<Utc>,
    pub recipient_email: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub match_method: Option<String>,
    pub duplicate_of_transaction_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransactionLogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::retry::Retriable for TransactionLogError {
    fn is_retriable(&self) -> bool {
        true
    }
}

/// Append-only; never overwrites a prior row for the same event id.
pub async fn append(pool: &PgPool, row: &NewTransactionRow) -> Result<(), TransactionLogError> {
    let candidate_duplicate_hash = match (&row.vendor_key, row.invoice_date) {
        (Some(vendor_key), Some(date)) => Some(candidate_hash(vendor_key, &row.sender, date)),
        _ => None,
    };

    sqlx::query(
        r#"
        INSERT INTO invoice_transactions
            (event_id, yyyymm, original_message_id, vendor_name, sender, subject,
             status, processed_at, recipient_email, amount, currency, match_method,
             duplicate_of_transaction_id, candidate_duplicate_hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(&row.event_id)
    .bind(&row.yyyymm)
    .bind(&row.original_message_id)
    .bind(&row.vendor_name)
    .bind(&row.sender)
    .bind(&row.subject)
    .bind(row.status.as_str())
    .bind(&row.recipient_email)
    .bind(row.amount)
    .bind(&row.currency)
    .bind(&row.match_method)
    .bind(&row.duplicate_of_transaction_id)
    .bind(&candidate_duplicate_hash)
    .execute(pool)
    .await?;

    Ok(())
}

/// The deduplication oracle. Returns true iff a `processed` row
/// exists for `original_message_id` within the last `within_days` days.
pub async fn was_processed(
    pool: &PgPool,
    original_message_id: &str,
    within_days: i64,
) -> Result<bool, TransactionLogError> {
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM invoice_transactions
            WHERE original_message_id = $1
              AND status = 'processed'
              AND processed_at >= NOW() - ($2 || ' days')::interval
        )
        "#,
    )
    .bind(original_message_id)
    .bind(within_days.to_string())
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Optional same-invoice-different-message-id check. A hash of
/// `(vendor_key, sender, date)` is compared within the window; the
/// caller decides whether a hit blocks or only annotates (see
/// DESIGN.md's Open Question decision).
pub async fn find_candidate_duplicate(
    pool: &PgPool,
    vendor_key: &str,
    sender: &str,
    date: chrono::NaiveDate,
    within_days: i64,
) -> Result<Option<String>, TransactionLogError> {
    let candidate_hash = candidate_hash(vendor_key, sender, date);

    let transaction_id = sqlx::query_scalar::<_, String>(
        r#"
        SELECT event_id FROM invoice_transactions
        WHERE candidate_duplicate_hash = $1
          AND status = 'processed'
          AND processed_at >= NOW() - ($2 || ' days')::interval
        ORDER BY processed_at DESC
        LIMIT 1
        "#,
    )
    .bind(&candidate_hash)
    .bind(within_days.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(transaction_id)
}

pub fn candidate_hash(vendor_key: &str, sender: &str, date: chrono::NaiveDate) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(vendor_key.as_bytes());
    hasher.update(b"|");
    hasher.update(sender.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(date.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Finite, not restartable across calls: callers get a fresh stream
/// each time they call this function.
pub fn stream_for_month<'a>(
    pool: &'a PgPool,
    yyyymm: &'a str,
) -> BoxStream<'a, Result<TransactionRow, TransactionLogError>> {
    let stream = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT event_id, yyyymm, original_message_id, vendor_name, sender, subject,
               status, processed_at, recipient_email, amount, currency, match_method,
               duplicate_of_transaction_id
        FROM invoice_transactions
        WHERE yyyymm = $1
        ORDER BY event_id ASC
        "#,
    )
    .bind(yyyymm)
    .fetch(pool)
    .map_err(TransactionLogError::from);

    Box::pin(stream)
}

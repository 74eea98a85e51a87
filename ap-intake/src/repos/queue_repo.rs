//! Queue Fabric repository.
//!
//! Generalizes the outbox/processed/failed-event table trio used
//! elsewhere in this codebase into real queue semantics: dequeue-count
//! tracking, visibility timeout, and pop receipts, backed by a single
//! durable table per queue plus a `-poison` dead-letter sibling. The
//! platform event bus (see `queue::notify_new_message`) is layered on
//! top purely as a wake-up signal — this table is the system of record
//! for dequeue accounting.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Notifications,
    RawMail,
    ToPost,
    Notify,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Notifications => "notifications",
            QueueName::RawMail => "raw-mail",
            QueueName::ToPost => "to-post",
            QueueName::Notify => "notify",
        }
    }

    /// The event-bus wake-up subject paired with this queue.
    pub fn bus_subject(&self) -> &'static str {
        match self {
            QueueName::Notifications => "intake.events.notifications.enqueued",
            QueueName::RawMail => "intake.events.raw_mail.enqueued",
            QueueName::ToPost => "intake.events.to_post.enqueued",
            QueueName::Notify => "intake.events.notify.enqueued",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub queue_name: String,
    pub payload: JsonValue,
    pub dequeue_count: i32,
    pub pop_receipt: Uuid,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::retry::Retriable for QueueError {
    fn is_retriable(&self) -> bool {
        true
    }
}

/// Place a message on `queue`. Returns the minted message id.
pub async fn enqueue(
    pool: &PgPool,
    queue: QueueName,
    payload: &JsonValue,
) -> Result<Uuid, QueueError> {
    let message_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO queue_messages (message_id, queue_name, payload, dequeue_count, visible_at, inserted_at)
        VALUES ($1, $2, $3, 0, NOW(), NOW())
        "#,
    )
    .bind(message_id)
    .bind(queue.as_str())
    .bind(payload)
    .execute(pool)
    .await?;

    Ok(message_id)
}

/// Claim the next visible message on `queue`, advancing its dequeue
/// count and setting a fresh pop receipt and visibility deadline.
/// Messages whose dequeue count would exceed `dead_letter_threshold`
/// are moved to the `-poison` sibling instead of being returned, and
/// this function tries the next candidate.
pub async fn dequeue(
    pool: &PgPool,
    queue: QueueName,
    visibility_timeout_secs: i64,
    dead_letter_threshold: i32,
) -> Result<Option<QueueMessage>, QueueError> {
    loop {
        let mut tx = pool.begin().await?;

        let candidate = sqlx::query_as::<_, QueueMessage>(
            r#"
            SELECT message_id, queue_name, payload, dequeue_count, pop_receipt, inserted_at
            FROM queue_messages
            WHERE queue_name = $1 AND visible_at <= NOW()
            ORDER BY inserted_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(queue.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(candidate) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let next_count = candidate.dequeue_count + 1;

        if next_count > dead_letter_threshold {
            move_to_dead_letter_tx(&mut tx, &candidate).await?;
            tx.commit().await?;
            tracing::warn!(
                queue = queue.as_str(),
                message_id = %candidate.message_id,
                dequeue_count = next_count,
                "dequeue count exceeded threshold, moved to dead letter"
            );
            continue;
        }

        let pop_receipt = Uuid::new_v4();
        sqlx::query(
            r#"
            UPDATE queue_messages
            SET dequeue_count = $1,
                pop_receipt = $2,
                visible_at = NOW() + ($3 || ' seconds')::interval
            WHERE message_id = $4
            "#,
        )
        .bind(next_count)
        .bind(pop_receipt)
        .bind(visibility_timeout_secs.to_string())
        .bind(candidate.message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        return Ok(Some(QueueMessage {
            dequeue_count: next_count,
            pop_receipt,
            ..candidate
        }));
    }
}

/// Acknowledge successful processing: delete the row, provided the pop
/// receipt still matches (it won't if the visibility timeout expired
/// and another worker already redelivered the message).
pub async fn ack(
    pool: &PgPool,
    queue: QueueName,
    message_id: Uuid,
    pop_receipt: Uuid,
) -> Result<bool, QueueError> {
    let result = sqlx::query(
        "DELETE FROM queue_messages WHERE queue_name = $1 AND message_id = $2 AND pop_receipt = $3",
    )
    .bind(queue.as_str())
    .bind(message_id)
    .bind(pop_receipt)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Force a message straight to dead-letter (used for data-integrity
/// failures that must not be retried, e.g. a processed-row append
/// failing after a successful send).
pub async fn force_dead_letter(
    pool: &PgPool,
    queue: QueueName,
    message_id: Uuid,
    pop_receipt: Uuid,
) -> Result<(), QueueError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, QueueMessage>(
        r#"
        SELECT message_id, queue_name, payload, dequeue_count, pop_receipt, inserted_at
        FROM queue_messages
        WHERE queue_name = $1 AND message_id = $2 AND pop_receipt = $3
        "#,
    )
    .bind(queue.as_str())
    .bind(message_id)
    .bind(pop_receipt)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(row) = row {
        move_to_dead_letter_tx(&mut tx, &row).await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn move_to_dead_letter_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    message: &QueueMessage,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO queue_dead_letters
            (message_id, queue_name, payload, dequeue_count, inserted_at, dead_lettered_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        "#,
    )
    .bind(message.message_id)
    .bind(&message.queue_name)
    .bind(&message.payload)
    .bind(message.dequeue_count)
    .bind(message.inserted_at)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM queue_messages WHERE message_id = $1")
        .bind(message.message_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Approximate depth of a queue's dead-letter sibling, surfaced via
/// the metrics endpoint.
pub async fn dead_letter_depth(pool: &PgPool, queue: QueueName) -> Result<i64, QueueError> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_dead_letters WHERE queue_name = $1")
            .bind(queue.as_str())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

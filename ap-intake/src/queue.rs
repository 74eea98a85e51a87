//! Consumer harness layered over the Queue Fabric.
//!
//! `repos::queue_repo` is the system of record for dequeue-count and
//! visibility-timeout accounting; this module adds the event-bus
//! wake-up signal on top (publish on enqueue, subscribe in the
//! consumer loop) purely as a latency optimization — a missed or
//! dropped bus message costs nothing but the poll interval, since the
//! loop always falls back to polling the table directly.

use std::sync::Arc;
use std::time::Duration;

use event_bus::EventBus;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::Instrument;

use crate::repos::queue_repo::{self, QueueMessage, QueueName};

/// Default interval the consumer loop polls on even without a wake-up,
/// so a dropped or never-arriving bus message can't stall a queue
/// forever.
const POLL_FALLBACK: Duration = Duration::from_secs(5);

/// Enqueue `payload` onto `queue` and publish a wake-up notification on
/// the bus. The bus publish is best-effort: a failure here is logged
/// and does not roll back the enqueue, since the fallback poll will
/// still pick the message up.
pub async fn enqueue_and_notify(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    queue: QueueName,
    payload: &JsonValue,
) -> Result<uuid::Uuid, queue_repo::QueueError> {
    let message_id = queue_repo::enqueue(pool, queue, payload).await?;
    if let Err(e) = bus.publish(queue.bus_subject(), Vec::new()).await {
        tracing::warn!(
            queue = queue.as_str(),
            error = %e,
            "failed to publish queue wake-up, relying on fallback poll"
        );
    }
    Ok(message_id)
}

/// What a handler tells the consumer loop to do with a dequeued
/// message once it returns.
pub enum Outcome {
    /// Processing succeeded (or the outcome is a non-retriable logical
    /// one, e.g. `duplicate_skipped`) — acknowledge and remove it.
    Ack,
    /// A data-integrity hazard (e.g. a `processed` row failed to
    /// append after the outbound send succeeded) — skip straight to
    /// dead-letter rather than letting the message redeliver and risk
    /// a second send.
    ForceDeadLetter,
    /// A transient or input-invalid failure — leave the message in
    /// place; it becomes visible again after the visibility timeout
    /// and is redelivered (with its dequeue count already advanced by
    /// `dequeue`).
    Retry,
}

/// Run `handler` against every message on `queue` forever. Drains the
/// queue fully on each wake-up (polling `dequeue` until it returns
/// `None`) before going back to waiting on the bus or the fallback
/// poll interval, whichever comes first.
pub async fn run_consumer<F, Fut>(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    queue: QueueName,
    dead_letter_threshold: i32,
    visibility_timeout_secs: i64,
    handler: F,
) where
    F: Fn(PgPool, QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Outcome> + Send,
{
    let mut wake = match bus.subscribe(queue.bus_subject()).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(queue = queue.as_str(), error = %e, "failed to subscribe to wake-up subject, consumer not started");
            return;
        }
    };

    tracing::info!(queue = queue.as_str(), "consumer started");

    loop {
        loop {
            let dequeued = queue_repo::dequeue(
                &pool,
                queue,
                visibility_timeout_secs,
                dead_letter_threshold,
            )
            .await;

            let message = match dequeued {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(queue = queue.as_str(), error = %e, "dequeue failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    break;
                }
            };

            let span = tracing::info_span!(
                "process_queue_message",
                queue = queue.as_str(),
                message_id = %message.message_id,
                dequeue_count = message.dequeue_count,
            );

            let pop_receipt = message.pop_receipt;
            let message_id = message.message_id;
            let outcome = handler(pool.clone(), message).instrument(span).await;

            match outcome {
                Outcome::Ack => {
                    if let Err(e) = queue_repo::ack(&pool, queue, message_id, pop_receipt).await {
                        tracing::error!(queue = queue.as_str(), message_id = %message_id, error = %e, "failed to ack processed message");
                    }
                }
                Outcome::ForceDeadLetter => {
                    if let Err(e) =
                        queue_repo::force_dead_letter(&pool, queue, message_id, pop_receipt).await
                    {
                        tracing::error!(queue = queue.as_str(), message_id = %message_id, error = %e, "failed to force message to dead letter");
                    }
                }
                Outcome::Retry => {
                    // Leave it be; visibility timeout expiry redelivers.
                }
            }
        }

        tokio::select! {
            _ = wake.next() => {}
            _ = tokio::time::sleep(POLL_FALLBACK) => {}
        }
    }
}

//! The queue fabric must move a message to its dead-letter sibling once
//! its dequeue count would exceed `dead_letter_threshold`, and that
//! message must stop being returned by `dequeue` from that point on.

mod common;

use ap_intake::repos::queue_repo::{self, QueueName};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use uuid::Uuid;

const THRESHOLD: i32 = 3;
const VISIBILITY_TIMEOUT_SECS: i64 = 0;

async fn cleanup(pool: &PgPool, message_id: Uuid) {
    sqlx::query("DELETE FROM queue_messages WHERE message_id = $1")
        .bind(message_id)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM queue_dead_letters WHERE message_id = $1")
        .bind(message_id)
        .execute(pool)
        .await
        .ok();
}

#[tokio::test]
#[serial]
async fn redelivery_past_the_threshold_moves_the_message_to_dead_letter() {
    let pool = common::get_test_pool().await;
    let payload = json!({"kind": "dead-letter-test"});

    let message_id = queue_repo::enqueue(&pool, QueueName::RawMail, &payload)
        .await
        .expect("enqueue should succeed");

    // A zero-second visibility timeout means the message is immediately
    // visible again, simulating repeated redelivery without waiting.
    for attempt in 1..=THRESHOLD {
        let claimed = queue_repo::dequeue(&pool, QueueName::RawMail, VISIBILITY_TIMEOUT_SECS, THRESHOLD)
            .await
            .expect("dequeue should succeed")
            .expect("message should still be claimable below the threshold");
        assert_eq!(claimed.message_id, message_id);
        assert_eq!(claimed.dequeue_count, attempt);
    }

    // One more dequeue would push dequeue_count to THRESHOLD + 1, which
    // exceeds the threshold: the message is dead-lettered instead of
    // returned.
    let after_threshold = queue_repo::dequeue(&pool, QueueName::RawMail, VISIBILITY_TIMEOUT_SECS, THRESHOLD)
        .await
        .expect("dequeue should succeed");
    assert!(
        after_threshold.is_none(),
        "a message that exceeded the dead-letter threshold must not be returned"
    );

    let depth = queue_repo::dead_letter_depth(&pool, QueueName::RawMail)
        .await
        .expect("dead_letter_depth should succeed");
    assert!(depth >= 1, "the dead-lettered message must be counted");

    let still_live = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM queue_messages WHERE message_id = $1",
    )
    .bind(message_id)
    .fetch_one(&pool)
    .await
    .expect("query should succeed");
    assert_eq!(still_live, 0, "the live queue row must be gone once dead-lettered");

    cleanup(&pool, message_id).await;
}

#[tokio::test]
#[serial]
async fn ack_removes_a_message_only_with_a_matching_pop_receipt() {
    let pool = common::get_test_pool().await;
    let payload = json!({"kind": "ack-test"});

    let message_id = queue_repo::enqueue(&pool, QueueName::ToPost, &payload)
        .await
        .expect("enqueue should succeed");

    let claimed = queue_repo::dequeue(&pool, QueueName::ToPost, 30, THRESHOLD)
        .await
        .expect("dequeue should succeed")
        .expect("message should be claimable");

    let stale_ack = queue_repo::ack(&pool, QueueName::ToPost, message_id, Uuid::new_v4())
        .await
        .expect("ack should succeed");
    assert!(!stale_ack, "a pop receipt mismatch must not remove the message");

    let real_ack = queue_repo::ack(&pool, QueueName::ToPost, message_id, claimed.pop_receipt)
        .await
        .expect("ack should succeed");
    assert!(real_ack, "the matching pop receipt must remove the message");

    cleanup(&pool, message_id).await;
}

//! The transaction log is the deduplication oracle: once a message id
//! has a `processed` row within the dedup window, `was_processed` must
//! say so, and must stop saying so once the window has elapsed or for
//! a message id it never saw.

mod common;

use ap_intake::ids::{new_event_id, yyyymm};
use ap_intake::repos::transaction_repo::{self, NewTransactionRow, TransactionStatus};
use chrono::Utc;
use serial_test::serial;
use sqlx::PgPool;

fn sample_row(original_message_id: &str, status: TransactionStatus) -> NewTransactionRow {
    NewTransactionRow {
        event_id: new_event_id(),
        yyyymm: yyyymm(Utc::now()),
        original_message_id: original_message_id.to_string(),
        vendor_name: Some("Acme Inc".to_string()),
        sender: "ap@acme.com".to_string(),
        subject: "Invoice #123".to_string(),
        status,
        recipient_email: Some("ap@example.com".to_string()),
        amount: Some(1000.0),
        currency: Some("USD".to_string()),
        match_method: Some("exact".to_string()),
        duplicate_of_transaction_id: None,
        vendor_key: None,
        invoice_date: None,
    }
}

async fn cleanup(pool: &PgPool, original_message_id: &str) {
    sqlx::query("DELETE FROM invoice_transactions WHERE original_message_id = $1")
        .bind(original_message_id)
        .execute(pool)
        .await
        .expect("failed to clean up transaction row");
}

#[tokio::test]
#[serial]
async fn was_processed_true_for_a_processed_row_within_the_window() {
    let pool = common::get_test_pool().await;
    let message_id = format!("dedup-test-{}", new_event_id());

    transaction_repo::append(&pool, &sample_row(&message_id, TransactionStatus::Processed))
        .await
        .expect("append should succeed");

    let seen = transaction_repo::was_processed(&pool, &message_id, 30)
        .await
        .expect("was_processed should succeed");
    assert!(seen, "a processed row within the window must be found");

    cleanup(&pool, &message_id).await;
}

#[tokio::test]
#[serial]
async fn was_processed_false_outside_the_window() {
    let pool = common::get_test_pool().await;
    let message_id = format!("dedup-test-{}", new_event_id());

    transaction_repo::append(&pool, &sample_row(&message_id, TransactionStatus::Processed))
        .await
        .expect("append should succeed");

    // A zero-day window excludes even a row processed moments ago.
    let seen = transaction_repo::was_processed(&pool, &message_id, 0)
        .await
        .expect("was_processed should succeed");
    assert!(!seen, "a zero-day window must not match a just-processed row");

    cleanup(&pool, &message_id).await;
}

#[tokio::test]
#[serial]
async fn was_processed_false_for_an_unseen_message_id() {
    let pool = common::get_test_pool().await;
    let message_id = format!("dedup-test-never-seen-{}", new_event_id());

    let seen = transaction_repo::was_processed(&pool, &message_id, 30)
        .await
        .expect("was_processed should succeed");
    assert!(!seen, "an id with no rows at all must never be treated as a duplicate");
}

#[tokio::test]
#[serial]
async fn was_processed_false_for_a_non_processed_status() {
    let pool = common::get_test_pool().await;
    let message_id = format!("dedup-test-{}", new_event_id());

    transaction_repo::append(
        &pool,
        &sample_row(&message_id, TransactionStatus::DuplicateSkipped),
    )
    .await
    .expect("append should succeed");

    let seen = transaction_repo::was_processed(&pool, &message_id, 30)
        .await
        .expect("was_processed should succeed");
    assert!(
        !seen,
        "only a `processed` row should satisfy the dedup oracle, not a duplicate_skipped one"
    );

    cleanup(&pool, &message_id).await;
}

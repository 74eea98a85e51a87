//! Subscription Registry repository.
//!
//! The single-active-row invariant is enforced by the Subscription
//! Manager, not by this store; the store exposes the primitives the
//! manager composes into an atomic swap.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub subscription_id: String,
    pub resource: String,
    pub expiration_utc: DateTime<Utc>,
    pub client_state_secret: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_renewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::retry::Retriable for SubscriptionError {
    fn is_retriable(&self) -> bool {
        true
    }
}

pub async fn get_active(pool: &PgPool) -> Result<Option<SubscriptionRow>, SubscriptionError> {
    let row = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        SELECT subscription_id, resource, expiration_utc, client_state_secret,
               is_active, created_at, last_renewed_at
        FROM graph_subscriptions
        WHERE is_active = true
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn upsert(
    pool: &PgPool,
    subscription_id: &str,
    resource: &str,
    expiration_utc: DateTime<Utc>,
    client_state_secret: &str,
) -> Result<(), SubscriptionError> {
    sqlx::query(
        r#"
        INSERT INTO graph_subscriptions
            (subscription_id, resource, expiration_utc, client_state_secret, is_active, created_at)
        VALUES ($1, $2, $3, $4, true, NOW())
        ON CONFLICT (subscription_id) DO UPDATE SET
            expiration_utc = EXCLUDED.expiration_utc,
            last_renewed_at = NOW()
        "#,
    )
    .bind(subscription_id)
    .bind(resource)
    .bind(expiration_utc)
    .bind(client_state_secret)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn deactivate(pool: &PgPool, subscription_id: &str) -> Result<(), SubscriptionError> {
    sqlx::query("UPDATE graph_subscriptions SET is_active = false WHERE subscription_id = $1")
        .bind(subscription_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Atomically replace the active subscription: deactivate the old row
/// and insert the new one in a single transaction, so the single-
/// active-row invariant is never briefly violated (two actives) or
/// briefly empty in a way that would be externally observable by a
/// concurrent reader — the old row remains until the new one commits.
pub async fn replace_active(
    pool: &PgPool,
    old_subscription_id: Option<&str>,
    new_subscription_id: &str,
    resource: &str,
    expiration_utc: DateTime<Utc>,
    client_state_secret: &str,
) -> Result<(), SubscriptionError> {
    let mut tx = pool.begin().await?;

    if let Some(old_id) = old_subscription_id {
        sqlx::query("UPDATE graph_subscriptions SET is_active = false WHERE subscription_id = $1")
            .bind(old_id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO graph_subscriptions
            (subscription_id, resource, expiration_utc, client_state_secret, is_active, created_at)
        VALUES ($1, $2, $3, $4, true, NOW())
        "#,
    )
    .bind(new_subscription_id)
    .bind(resource)
    .bind(expiration_utc)
    .bind(client_state_secret)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub fn new_subscription_id() -> String {
    Uuid::new_v4().to_string()
}

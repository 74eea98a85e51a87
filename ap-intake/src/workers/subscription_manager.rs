//! Subscription Manager: keeps exactly one active Graph subscription
//! alive, creating one if none exists and renewing it before it
//! expires.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::Config;
use crate::repos::subscription_repo::{self, SubscriptionRow};
use crate::retry::RetryConfig;
use crate::services::mail_provider::{self, CreateSubscriptionRequest, MailProvider};

/// Graph subscriptions cap expiration at roughly three days out; renew
/// well inside that ceiling rather than push against it.
const PROVIDER_MAX_LIFETIME_HOURS: i64 = 70;

pub async fn spawn(
    pool: sqlx::PgPool,
    config: Arc<Config>,
    provider: Arc<dyn MailProvider>,
    breaker: &'static CircuitBreakerRegistry,
) {
    let mut ticker = tokio::time::interval(config.subscription_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        check_once(&pool, &config, provider.as_ref(), breaker).await;
    }
}

async fn check_once(
    pool: &sqlx::PgPool,
    config: &Config,
    provider: &dyn MailProvider,
    breaker: &'static CircuitBreakerRegistry,
) {
    let current = match subscription_repo::get_active(pool).await {
        Ok(current) => current,
        Err(e) => {
            tracing::error!(error = %e, "failed to read active subscription, will retry next tick");
            return;
        }
    };

    match current {
        None => create_subscription(pool, config, provider, breaker).await,
        Some(current) => maybe_renew(pool, config, provider, breaker, &current).await,
    }
}

async fn create_subscription(
    pool: &sqlx::PgPool,
    config: &Config,
    provider: &dyn MailProvider,
    breaker: &'static CircuitBreakerRegistry,
) {
    let resource = format!("users/{}/mailFolders('Inbox')/messages", config.ingest_mailbox);
    let expiration = Utc::now() + ChronoDuration::hours(PROVIDER_MAX_LIFETIME_HOURS);

    let retry_config = RetryConfig::from_config(config);
    let receipt = mail_provider::call_with_retry(
        breaker,
        &retry_config,
        "mail_provider.create_subscription",
        || {
            provider.create_subscription(&CreateSubscriptionRequest {
                webhook_url: &config.mail_webhook_url,
                client_state: &config.graph_client_state,
                resource: &resource,
                change_types: &["created"],
                expiration_utc: expiration,
            })
        },
    )
    .await;

    let receipt = match receipt {
        Ok(receipt) => receipt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create subscription, will retry next tick");
            return;
        }
    };

    if let Err(e) = subscription_repo::replace_active(
        pool,
        None,
        &receipt.subscription_id,
        &resource,
        receipt.expiration_utc,
        &config.graph_client_state,
    )
    .await
    {
        tracing::error!(error = %e, "failed to record new subscription");
    } else {
        tracing::info!(subscription_id = %receipt.subscription_id, "created subscription");
    }
}

async fn maybe_renew(
    pool: &sqlx::PgPool,
    config: &Config,
    provider: &dyn MailProvider,
    breaker: &'static CircuitBreakerRegistry,
    current: &SubscriptionRow,
) {
    let renew_window = ChronoDuration::from_std(config.subscription_renew_window)
        .unwrap_or_else(|_| ChronoDuration::hours(48));

    if current.expiration_utc - Utc::now() > renew_window {
        return;
    }

    let new_expiration = Utc::now() + ChronoDuration::hours(PROVIDER_MAX_LIFETIME_HOURS);

    let retry_config = RetryConfig::from_config(config);
    let renewed = mail_provider::call_with_retry(
        breaker,
        &retry_config,
        "mail_provider.renew_subscription",
        || provider.renew_subscription(&current.subscription_id, new_expiration),
    )
    .await;

    if let Err(e) = renewed {
        tracing::error!(error = %e, subscription_id = %current.subscription_id, "failed to renew subscription, will retry next tick");
        return;
    }

    if let Err(e) = subscription_repo::upsert(
        pool,
        &current.subscription_id,
        &current.resource,
        new_expiration,
        &config.graph_client_state,
    )
    .await
    {
        tracing::error!(error = %e, "failed to record renewed subscription expiration");
    } else {
        tracing::info!(subscription_id = %current.subscription_id, "renewed subscription");
    }
}

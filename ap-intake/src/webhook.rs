//! Webhook Receiver.
//!
//! Two modes keyed by request shape: validation (echo the token,
//! <3s) and notification (enqueue onto `notifications` after a
//! constant-time `clientState` check and a per-source rate limit).
//! Authenticating the endpoint itself (a token in the URL/header) is
//! handled upstream of this handler — this handler only enforces the
//! `clientState` check.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::body::Bytes;
use chrono::Utc;
use event_bus::EventBus;
use sqlx::PgPool;
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::contracts::webhook_v1::{ChangeNotificationEnvelope, NotificationsQueueMessageV1};
use crate::contracts::CURRENT_SCHEMA_VERSION;
use crate::queue;
use crate::repos::queue_repo::QueueName;
use crate::services::rate_limiter::RateLimiter;

pub struct WebhookState {
    pub pool: PgPool,
    pub bus: Arc<dyn EventBus>,
    pub config: Config,
    pub rate_limiter: RateLimiter,
}

/// `POST /webhook`. Validation mode if `validationToken` is present in
/// the query string or an `application/x-www-form-urlencoded` body;
/// notification mode otherwise.
pub async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(token) = query.get("validationToken") {
        return validation_response(token);
    }

    if is_form_urlencoded(&headers) {
        if let Ok(form) = serde_urlencoded::from_bytes::<HashMap<String, String>>(&body) {
            if let Some(token) = form.get("validationToken") {
                return validation_response(token);
            }
        }
    }

    handle_notification(&state, remote_addr, &body).await
}

/// Echo `token` verbatim as `text/plain`, within the 3-second budget
/// the validation handshake requires.
fn validation_response(token: &str) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        token.to_string(),
    )
        .into_response()
}

fn is_form_urlencoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

async fn handle_notification(state: &WebhookState, remote_addr: SocketAddr, body: &[u8]) -> Response {
    let source = remote_addr.ip().to_string();
    if !state.rate_limiter.allow(&source) {
        tracing::warn!(source = %source, "webhook notification rate limit exceeded");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let envelope: ChangeNotificationEnvelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "malformed notification body, dropping");
            // Still 202: the provider retries notification delivery on
            // non-2xx responses, and a malformed body will never parse
            // differently on redelivery.
            return StatusCode::ACCEPTED.into_response();
        }
    };

    for entry in envelope.value {
        if !client_state_matches(&entry.client_state, &state.config.graph_client_state) {
            tracing::warn!(
                subscription_id = %entry.subscription_id,
                "clientState mismatch, dropping notification"
            );
            continue;
        }

        let message = NotificationsQueueMessageV1 {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            subscription_id: entry.subscription_id,
            resource: entry.resource,
            change_type: entry.change_type,
            timestamp: Utc::now(),
        };

        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize notification envelope");
                continue;
            }
        };

        if let Err(e) =
            queue::enqueue_and_notify(&state.pool, &state.bus, QueueName::Notifications, &payload)
                .await
        {
            tracing::error!(error = %e, "failed to enqueue notification");
        }
    }

    StatusCode::ACCEPTED.into_response()
}

/// Constant-time comparison so `clientState` checks don't leak timing
/// information about the expected value.
fn client_state_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_state_matches_exact_secret() {
        assert!(client_state_matches("secret-123", "secret-123"));
    }

    #[test]
    fn client_state_rejects_mismatch() {
        assert!(!client_state_matches("wrong", "secret-123"));
    }

    #[test]
    fn client_state_rejects_different_length() {
        assert!(!client_state_matches("secret-1234", "secret-123"));
    }
}

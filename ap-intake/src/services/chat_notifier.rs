//! Chat webhook notifier.

use std::time::Duration;

use crate::circuit_breaker::{BreakerError, CircuitBreakerRegistry};
use crate::contracts::chat_card_v1::{serialize_card, CardError, ChatMessage};
use crate::retry::Retriable;

pub const CHAT_DEPENDENCY: &str = "chat_webhook";
const CHAT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("card serialization failed: {0}")]
    Card(#[from] CardError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
}

impl Retriable for ChatError {
    fn is_retriable(&self) -> bool {
        match self {
            ChatError::Card(_) => false,
            ChatError::Request(_) => true,
            ChatError::Status(code) => *code == 429 || *code >= 500,
        }
    }
}

impl Retriable for BreakerError<ChatError> {
    fn is_retriable(&self) -> bool {
        match self {
            BreakerError::Open => false,
            BreakerError::Inner(e) => e.is_retriable(),
        }
    }
}

pub struct ChatNotifier {
    http: reqwest::Client,
    webhook_url: String,
}

impl ChatNotifier {
    pub fn new(webhook_url: String) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(CHAT_TIMEOUT)
            .build()?;
        Ok(Self { http, webhook_url })
    }

    /// POST `card` through the circuit breaker; any 2xx is success, 4xx
    /// other than 429 is not retried, 429/5xx retry under the caller's
    /// generic transient policy (via `Retriable`).
    pub async fn send(
        &self,
        registry: &CircuitBreakerRegistry,
        card: &ChatMessage,
    ) -> Result<(), BreakerError<ChatError>> {
        let body = serialize_card(card).map_err(|e| BreakerError::Inner(ChatError::Card(e)))?;

        registry
            .call(CHAT_DEPENDENCY, || async {
                let response = self
                    .http
                    .post(&self.webhook_url)
                    .header("Content-Type", "application/json")
                    .body(body)
                    .send()
                    .await
                    .map_err(ChatError::Request)?;

                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(ChatError::Status(response.status().as_u16()))
                }
            })
            .await
    }

    /// `send`, retried with backoff so a transient webhook failure
    /// resolves within one queue dequeue rather than through redelivery.
    pub async fn send_with_retry(
        &self,
        registry: &CircuitBreakerRegistry,
        retry_config: &crate::retry::RetryConfig,
        card: &ChatMessage,
    ) -> Result<(), BreakerError<ChatError>> {
        crate::retry::retry_with_backoff(
            || self.send(registry, card),
            retry_config,
            "chat_webhook.send",
        )
        .await
    }
}

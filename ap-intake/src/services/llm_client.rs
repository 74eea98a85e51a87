//! LLM vendor-inference client.
//!
//! Used two ways: to pick a vendor name from a short-list given noisy
//! extracted text, and as the PDF extractor's fallback when regex
//! heuristics can't find a vendor-name candidate. Every call goes
//! through the circuit breaker registered under the `"llm"` dependency
//! name and the shared retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::circuit_breaker::{BreakerError, CircuitBreakerRegistry};
use crate::retry::{retry_with_backoff, Retriable, RetryConfig};

const LLM_TIMEOUT: Duration = Duration::from_secs(60);
const LLM_DEPENDENCY: &str = "llm";

#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct VendorPickRequest<'a> {
    extracted_text: &'a str,
    candidates: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct VendorPickResponse {
    vendor_name: Option<String>,
    certainty: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct VendorSuggestion {
    pub vendor_name: String,
    pub certainty: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("endpoint returned status {0}")]
    Status(u16),
}

impl Retriable for LlmError {
    fn is_retriable(&self) -> bool {
        match self {
            LlmError::Request(_) => true,
            LlmError::Status(code) => *code == 429 || *code >= 500,
        }
    }
}

impl LlmClient {
    pub fn new(endpoint: String, api_key: String) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(LLM_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    /// Ask the LLM to pick a vendor name from `candidates` given noisy
    /// `extracted_text`. `Ok(None)` means the LLM declined to pick one;
    /// circuit-open and exhausted-retry also degrade to `Ok(None)` so
    /// callers fall through to the domain fallback rather than failing
    /// the whole invocation.
    pub async fn pick_vendor(
        &self,
        extracted_text: &str,
        candidates: &[&str],
    ) -> Result<Option<VendorSuggestion>, LlmError> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let retry_config = RetryConfig::default();
        let breaker = crate::circuit_breaker::registry();

        let result = retry_with_backoff(
            || self.call_once(breaker, extracted_text, candidates),
            &retry_config,
            "llm.pick_vendor",
        )
        .await;

        match result {
            Ok(response) => Ok(response.vendor_name.map(|vendor_name| VendorSuggestion {
                vendor_name,
                certainty: response.certainty.unwrap_or(0),
            })),
            Err(BreakerError::Open) => {
                tracing::warn!("llm breaker open, degrading to no vendor suggestion");
                Ok(None)
            }
            Err(BreakerError::Inner(e)) => Err(e),
        }
    }

    async fn call_once(
        &self,
        breaker: &CircuitBreakerRegistry,
        extracted_text: &str,
        candidates: &[&str],
    ) -> Result<VendorPickResponse, BreakerError<LlmError>> {
        breaker
            .call(LLM_DEPENDENCY, || async {
                let response = self
                    .http
                    .post(&self.endpoint)
                    .bearer_auth(&self.api_key)
                    .json(&VendorPickRequest {
                        extracted_text,
                        candidates,
                    })
                    .send()
                    .await
                    .map_err(LlmError::Request)?;

                if !response.status().is_success() {
                    return Err(LlmError::Status(response.status().as_u16()));
                }

                response
                    .json::<VendorPickResponse>()
                    .await
                    .map_err(LlmError::Request)
            })
            .await
    }
}

impl Retriable for BreakerError<LlmError> {
    fn is_retriable(&self) -> bool {
        match self {
            BreakerError::Open => false,
            BreakerError::Inner(e) => e.is_retriable(),
        }
    }
}

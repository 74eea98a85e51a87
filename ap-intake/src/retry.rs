//! Generic exponential-backoff retry with jitter.
//!
//! Mirrors the shape of `event_bus::consumer_retry::retry_with_backoff`
//! but with the pipeline's own tuning (base 500 ms, factor 2, cap 30 s,
//! max 5 attempts) and full jitter, since every external call this
//! service makes (provider, LLM, blob store, chat webhook) needs the
//! same policy rather than the 3-attempt/no-jitter default used by the
//! platform event consumers.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            factor: 2,
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Build a `RetryConfig` from the tuning fields on `Config`, so every
    /// external call site shares one operator-controlled policy instead of
    /// each hardcoding its own defaults.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay,
            factor: config.retry_factor,
            cap: config.retry_cap,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.saturating_sub(1));
        let raw = self.base_delay.saturating_mul(exp);
        let capped = std::cmp::min(raw, self.cap);
        // Full jitter: uniform in [0, capped].
        let jittered_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
        Duration::from_millis(jittered_ms)
    }
}

/// Marks whether an error should be retried or sent straight to the
/// dead-letter path.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

/// Retry a fallible async operation with exponential backoff and jitter.
///
/// Stops immediately (without consuming an attempt budget) when the error
/// reports itself as non-retriable via [`Retriable`].
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retriable,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context, attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retriable() => {
                warn!(context, error = %e, "non-retriable error, not retrying");
                return Err(e);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(context, attempts = attempt, error = %e, "exhausted retry attempts");
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    context,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retriable error, backing off"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Err1(bool);
    impl std::fmt::Display for Err1 {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "err1")
        }
    }
    impl Retriable for Err1 {
        fn is_retriable(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_sleeping() {
        let config = RetryConfig::default();
        let result: Result<i32, Err1> =
            retry_with_backoff(|| async { Ok(7) }, &config, "test").await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn non_retriable_error_short_circuits() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            factor: 2,
            cap: Duration::from_millis(10),
        };
        let calls = AtomicU32::new(0);
        let result: Result<i32, Err1> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Err1(false)) }
            },
            &config,
            "test",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retriable_error_exhausts_max_attempts() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2,
            cap: Duration::from_millis(5),
        };
        let calls = AtomicU32::new(0);
        let result: Result<i32, Err1> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Err1(true)) }
            },
            &config,
            "test",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

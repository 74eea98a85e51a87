//! Circuit breaker middleware around external calls.
//!
//! An explicit state machine guarding a minimal `call()` entry point,
//! one instance per external dependency (mail/graph provider, LLM, blob
//! store, chat webhook), held in a process-wide registry.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// One breaker per dependency name. `consecutive_failures` and
/// `opened_at_epoch_ms` are atomics so concurrent callers on the same
/// dependency never need a mutex for the hot path.
struct Breaker {
    consecutive_failures: AtomicU32,
    opened_at_epoch_ms: AtomicU64,
    half_open_probe_in_flight: AtomicU32,
    failure_threshold: u32,
    open_duration: Duration,
}

impl Breaker {
    fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at_epoch_ms: AtomicU64::new(0),
            half_open_probe_in_flight: AtomicU32::new(0),
            failure_threshold,
            open_duration,
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn state(&self) -> BreakerState {
        let opened_at = self.opened_at_epoch_ms.load(Ordering::SeqCst);
        if opened_at == 0 {
            return BreakerState::Closed;
        }
        let elapsed = Self::now_ms().saturating_sub(opened_at);
        if elapsed >= self.open_duration.as_millis() as u64 {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    /// Attempt to acquire permission to call. Returns `false` if the
    /// breaker is open, or if it is half-open and a probe is already
    /// in flight (only one probe is allowed at a time).
    fn try_acquire(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => self
                .half_open_probe_in_flight
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
        }
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.opened_at_epoch_ms.store(0, Ordering::SeqCst);
        self.half_open_probe_in_flight.store(0, Ordering::SeqCst);
    }

    fn on_failure(&self) {
        self.half_open_probe_in_flight.store(0, Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.failure_threshold {
            self.opened_at_epoch_ms.store(Self::now_ms(), Ordering::SeqCst);
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BreakerError<E> {
    #[error("circuit open, call refused")]
    Open,
    #[error(transparent)]
    Inner(#[from] E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }
}

pub struct CircuitBreakerRegistry {
    breakers: DashMap<&'static str, Breaker>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            open_duration,
        }
    }

    /// Execute `call` through the breaker registered under `dependency`.
    /// Each dependency transitions independently — an open LLM breaker
    /// never affects the provider or chat breakers.
    pub async fn call<F, Fut, T, E>(
        &self,
        dependency: &'static str,
        call: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.breakers
            .entry(dependency)
            .or_insert_with(|| Breaker::new(self.failure_threshold, self.open_duration));
        let breaker = self.breakers.get(dependency).expect("just inserted");

        if !breaker.try_acquire() {
            tracing::warn!(dependency, "circuit open, refusing call");
            return Err(BreakerError::Open);
        }

        match call().await {
            Ok(value) => {
                breaker.on_success();
                Ok(value)
            }
            Err(e) => {
                breaker.on_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub fn state_of(&self, dependency: &'static str) -> BreakerState {
        self.breakers
            .get(dependency)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }
}

static REGISTRY: OnceLock<CircuitBreakerRegistry> = OnceLock::new();

pub fn init_registry(failure_threshold: u32, open_duration: Duration) {
    let _ = REGISTRY.set(CircuitBreakerRegistry::new(failure_threshold, open_duration));
}

pub fn registry() -> &'static CircuitBreakerRegistry {
    REGISTRY.get_or_init(|| CircuitBreakerRegistry::new(5, Duration::from_secs(60)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let reg = CircuitBreakerRegistry::new(3, Duration::from_secs(60));

        for _ in 0..2 {
            let res: Result<(), BreakerError<&str>> =
                reg.call("dep", || async { Err("boom") }).await;
            assert!(matches!(res, Err(BreakerError::Inner(_))));
        }
        assert_eq!(reg.state_of("dep"), BreakerState::Closed);

        let res: Result<(), BreakerError<&str>> = reg.call("dep", || async { Err("boom") }).await;
        assert!(matches!(res, Err(BreakerError::Inner(_))));
        assert_eq!(reg.state_of("dep"), BreakerState::Open);

        let res: Result<(), BreakerError<&str>> = reg.call("dep", || async { Ok(()) }).await;
        assert_eq!(res, Err(BreakerError::Open));
    }

    #[tokio::test]
    async fn independent_dependencies_do_not_affect_each_other() {
        let reg = CircuitBreakerRegistry::new(1, Duration::from_secs(60));
        let _: Result<(), BreakerError<&str>> = reg.call("llm", || async { Err("down") }).await;
        assert_eq!(reg.state_of("llm"), BreakerState::Open);
        assert_eq!(reg.state_of("chat"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let reg = CircuitBreakerRegistry::new(2, Duration::from_secs(60));
        let _: Result<(), BreakerError<&str>> = reg.call("dep", || async { Err("boom") }).await;
        let _: Result<i32, BreakerError<&str>> = reg.call("dep", || async { Ok(1) }).await;
        let _: Result<(), BreakerError<&str>> = reg.call("dep", || async { Err("boom") }).await;
        assert_eq!(reg.state_of("dep"), BreakerState::Closed);
    }
}

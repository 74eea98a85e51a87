//! Per-source rate limiter for the webhook receiver.
//!
//! A fixed-window counter keyed by source (the caller passes whatever
//! it considers a "source" — here, the remote address or subscription
//! id). Disableable for local development via configuration.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    count: AtomicU32,
    window_started_at_epoch_ms: AtomicU64,
}

pub struct RateLimiter {
    windows: DashMap<String, Window>,
    limit_per_window: u32,
    disabled: bool,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32, disabled: bool) -> Self {
        Self {
            windows: DashMap::new(),
            limit_per_window: limit_per_minute,
            disabled,
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Returns `true` if `source` may proceed, `false` if it should be
    /// rejected for exceeding the per-minute budget.
    pub fn allow(&self, source: &str) -> bool {
        if self.disabled {
            return true;
        }

        let now = Self::now_ms();
        let window_ms = WINDOW.as_millis() as u64;

        let entry = self
            .windows
            .entry(source.to_string())
            .or_insert_with(|| Window {
                count: AtomicU32::new(0),
                window_started_at_epoch_ms: AtomicU64::new(now),
            });

        let started = entry.window_started_at_epoch_ms.load(Ordering::SeqCst);
        if now.saturating_sub(started) >= window_ms {
            entry.window_started_at_epoch_ms.store(now, Ordering::SeqCst);
            entry.count.store(0, Ordering::SeqCst);
        }

        let count = entry.count.fetch_add(1, Ordering::SeqCst) + 1;
        count <= self.limit_per_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(3, false);
        assert!(limiter.allow("src-a"));
        assert!(limiter.allow("src-a"));
        assert!(limiter.allow("src-a"));
        assert!(!limiter.allow("src-a"));
    }

    #[test]
    fn sources_are_tracked_independently() {
        let limiter = RateLimiter::new(1, false);
        assert!(limiter.allow("src-a"));
        assert!(limiter.allow("src-b"));
        assert!(!limiter.allow("src-a"));
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(1, true);
        for _ in 0..10 {
            assert!(limiter.allow("src-a"));
        }
    }
}

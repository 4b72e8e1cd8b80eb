//! Fixed-window rate limiting keyed by caller identity.
//!
//! # Algorithm
//!
//! Each key owns one counter and the instant its window ends:
//!
//! 1. No entry, or the window has elapsed (`now > reset_at`): start a fresh
//!    window with `count = 1` and allow.
//! 2. `count < limit`: increment and allow.
//! 3. Otherwise deny, reporting `ceil((reset_at - now) / 1s)` as retry-after.
//!
//! Windows are fixed, not sliding: a burst that straddles a boundary can be
//! admitted up to `2 × limit` times. That is the accepted cost of keeping a
//! single counter per key.
//!
//! # Concurrency
//!
//! Entries live in a `DashMap`; the check-and-update for a key runs under
//! that key's shard lock, so the `count <= limit` invariant holds on a
//! multi-threaded runtime as well.
//!
//! # Memory
//!
//! Expired entries are only reclaimed by [`RateLimiter::sweep`], which the
//! application runs periodically through a [`Sweeper`]. Memory is therefore
//! bounded by the number of keys active within one sweep period.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::clock::{self, Sweeper};
use crate::error::AppError;
use crate::metrics;

/// Counter state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_at: Instant,
}

/// Outcome of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the window resets; only meaningful when denied.
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    /// Convert a denial into the pipeline's rate-limit fault.
    pub fn into_result(self) -> Result<Self, AppError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(AppError::RateLimited {
                retry_after_secs: self.retry_after_secs,
            })
        }
    }
}

/// Process-wide fixed-window limiter.
///
/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    entries: Arc<DashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one call for `key` against `limit` calls per `window`.
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        self.check_at(key, limit, window, clock::now())
    }

    /// [`RateLimiter::check`] evaluated at an explicit instant.
    pub fn check_at(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> RateLimitDecision {
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                reset_at: now + window,
            });

        if now > entry.reset_at {
            *entry = RateLimitEntry {
                count: 0,
                reset_at: now + window,
            };
        }

        if entry.count < limit {
            entry.count += 1;
            trace!(key, count = entry.count, limit, "Rate limit check passed");
            return RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit - entry.count,
                retry_after_secs: 0,
            };
        }

        let retry_after_secs = clock::ceil_secs(entry.reset_at, now).max(1);
        drop(entry);

        warn!(key, limit, retry_after_secs, "Rate limit exceeded");
        metrics::record_rate_limit_denied();

        RateLimitDecision {
            allowed: false,
            limit,
            remaining: 0,
            retry_after_secs,
        }
    }

    /// Current entry for `key`, if one is tracked.
    pub fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|e| *e)
    }

    /// Number of tracked keys (active or awaiting sweep).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry whose window has elapsed. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(clock::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.reset_at);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept expired rate-limit windows");
        }
        removed
    }

    /// Register the periodic sweep on `sweeper`.
    pub fn start_sweeper(&self, sweeper: &Sweeper, period: Duration) {
        let limiter = self.clone();
        sweeper.spawn_periodic("rate_limit_sweep", period, move || {
            let limiter = limiter.clone();
            async move {
                limiter.sweep();
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_limit_three_per_minute() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();

        for i in 0..3 {
            let decision = limiter.check_at("K", 3, WINDOW, t0 + Duration::from_secs(i));
            assert!(decision.allowed, "call {} should pass", i + 1);
        }

        let denied = limiter.check_at("K", 3, WINDOW, t0 + Duration::from_secs(10));
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs > 0 && denied.retry_after_secs <= 60);
        assert_eq!(denied.retry_after_secs, 50);
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert_eq!(limiter.check_at("K", 3, WINDOW, t0).remaining, 2);
        assert_eq!(limiter.check_at("K", 3, WINDOW, t0).remaining, 1);
        assert_eq!(limiter.check_at("K", 3, WINDOW, t0).remaining, 0);
        assert_eq!(limiter.check_at("K", 3, WINDOW, t0).remaining, 0);
    }

    #[test]
    fn test_excess_calls_always_denied_within_window() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        let allowed = (0..20)
            .filter(|i| {
                limiter
                    .check_at("K", 5, WINDOW, t0 + Duration::from_millis(i * 100))
                    .allowed
            })
            .count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.check_at("a", 1, WINDOW, t0).allowed);
        assert!(!limiter.check_at("a", 1, WINDOW, t0).allowed);
        assert!(limiter.check_at("b", 1, WINDOW, t0).allowed);
    }

    #[test]
    fn test_window_resets_only_after_reset_at() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.check_at("K", 1, WINDOW, t0).allowed);

        // Exactly at reset_at the old window still applies
        let at_boundary = limiter.check_at("K", 1, WINDOW, t0 + WINDOW);
        assert!(!at_boundary.allowed);
        assert_eq!(at_boundary.retry_after_secs, 1);

        let after = limiter.check_at("K", 1, WINDOW, t0 + WINDOW + Duration::from_millis(1));
        assert!(after.allowed);
        let entry = limiter.entry("K").unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.reset_at, t0 + WINDOW + Duration::from_millis(1) + WINDOW);
    }

    #[test]
    fn test_boundary_burst_admits_twice_the_limit() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        let late = t0 + WINDOW - Duration::from_millis(1);
        let early_next = t0 + WINDOW + Duration::from_millis(1);

        assert!(limiter.check_at("K", 2, WINDOW, t0).allowed);
        assert!(limiter.check_at("K", 2, WINDOW, late).allowed);
        assert!(limiter.check_at("K", 2, WINDOW, early_next).allowed);
        assert!(limiter.check_at("K", 2, WINDOW, early_next).allowed);
        assert!(!limiter.check_at("K", 2, WINDOW, early_next).allowed);
    }

    #[test]
    fn test_into_result() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.check_at("K", 1, WINDOW, t0).into_result().is_ok());
        let err = limiter
            .check_at("K", 1, WINDOW, t0)
            .into_result()
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(60));
    }

    #[test]
    fn test_sweep_removes_only_elapsed_windows() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        limiter.check_at("old", 1, Duration::from_secs(1), t0);
        limiter.check_at("new", 1, WINDOW, t0);

        assert_eq!(limiter.sweep_at(t0 + Duration::from_secs(1)), 0);
        assert_eq!(limiter.sweep_at(t0 + Duration::from_secs(2)), 1);
        assert!(limiter.entry("old").is_none());
        assert!(limiter.entry("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let limiter = RateLimiter::new();
        let sweeper = Sweeper::new();
        limiter.start_sweeper(&sweeper, Duration::from_secs(30));

        limiter.check("ip-1", 10, Duration::from_secs(5));
        assert_eq!(limiter.len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(limiter.is_empty());

        sweeper.stop().await;
    }
}

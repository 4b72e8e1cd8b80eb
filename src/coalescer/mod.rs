//! Request coalescing and short-lived response caching.
//!
//! For expensive, idempotent, externally metered operations:
//!
//! 1. A non-expired cached value for the key is returned immediately.
//! 2. Otherwise, if an execution for the key is already running, the caller
//!    waits for it and receives the identical outcome.
//! 3. Otherwise the caller becomes the sole executor: the operation runs
//!    once, a success is cached for the configured TTL, the outcome is
//!    broadcast to every waiter, and the in-flight registration is cleared
//!    on every path.
//!
//! Failures are never cached but are broadcast, so waiters do not each
//! rediscover the same fault.
//!
//! # Concurrency
//!
//! Cache and in-flight maps share one `parking_lot::Mutex`; the
//! check-cache, check-in-flight, register sequence is a single critical
//! section and the lock is never held across an `.await`. Outcomes travel
//! over a `tokio::sync::watch` channel per in-flight key.
//!
//! # Staleness
//!
//! [`RequestCoalescer::sweep`] drops expired cache entries and
//! force-resolves in-flight executions older than `max_in_flight_age` with a
//! timeout fault. Each registration carries a generation number so a late
//! executor never clears a newer registration for the same key.

mod key;
mod lru;

pub use key::{CoalesceKey, GenerationOptions, KeyOptions, canonicalize};
pub use lru::LruCache;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::clock::{self, Sweeper};
use crate::error::{AppError, AppResult};
use crate::metrics;

type Outcome<T> = Option<AppResult<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerConfig {
    /// How long successful outcomes stay servable.
    pub ttl: Duration,
    /// Maximum cached entries before LRU eviction.
    pub capacity: usize,
    /// In-flight executions older than this are force-resolved by the sweep.
    pub max_in_flight_age: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            capacity: 1000,
            max_in_flight_age: Duration::from_secs(120),
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoalescerStats {
    pub cache_entries: usize,
    pub cache_capacity: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub joins: u64,
    pub executions: u64,
    pub evictions: u64,
    pub stale_resolved: u64,
}

/// What a single sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub stale: usize,
}

#[derive(Debug)]
struct CachedResponse<T> {
    value: T,
    expires_at: Instant,
}

#[derive(Debug)]
struct InFlight<T> {
    generation: u64,
    sender: watch::Sender<Outcome<T>>,
    created_at: Instant,
    waiters: usize,
}

#[derive(Debug)]
struct Inner<T> {
    cache: LruCache<String, CachedResponse<T>>,
    in_flight: HashMap<String, InFlight<T>>,
    next_generation: u64,
    hits: u64,
    joins: u64,
    executions: u64,
    evictions: u64,
    stale_resolved: u64,
}

impl<T: Clone> Inner<T> {
    /// Fresh cached value for `key`; an expired entry is dropped on the spot.
    fn cached(&mut self, key: &str, now: Instant) -> Option<T> {
        let fresh = self.cache.get(key).map(|c| (now < c.expires_at, c.value.clone()))?;
        match fresh {
            (true, value) => Some(value),
            (false, _) => {
                self.cache.remove(key);
                None
            }
        }
    }

    fn store(&mut self, key: &str, value: T, expires_at: Instant) {
        let evicted = self
            .cache
            .insert(key.to_string(), CachedResponse { value, expires_at });
        if let Some((evicted_key, _)) = evicted {
            self.evictions += 1;
            metrics::record_eviction();
            trace!(key = %evicted_key, "Evicted least recently used cache entry");
        }
    }

    /// Remove the registration for `key` if it is still `generation`.
    fn release(&mut self, key: &str, generation: u64) -> Option<watch::Sender<Outcome<T>>> {
        match self.in_flight.get(key) {
            Some(entry) if entry.generation == generation => {
                self.in_flight.remove(key).map(|entry| entry.sender)
            }
            _ => None,
        }
    }

    fn publish_sizes(&self) {
        metrics::set_coalescer_sizes(self.cache.len(), self.in_flight.len());
    }
}

enum Claim<T> {
    Cached(T),
    Wait(watch::Receiver<Outcome<T>>),
    Execute(u64),
}

/// Deduplicates concurrent identical operations and caches their results.
///
/// Cheap to clone; clones share the same cache and in-flight registry.
pub struct RequestCoalescer<T> {
    inner: Arc<Mutex<Inner<T>>>,
    config: CoalescerConfig,
}

impl<T> Clone for RequestCoalescer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config,
        }
    }
}

impl<T> std::fmt::Debug for RequestCoalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cache: LruCache::new(config.capacity),
                in_flight: HashMap::new(),
                next_generation: 0,
                hits: 0,
                joins: 0,
                executions: 0,
                evictions: 0,
                stale_resolved: 0,
            })),
            config,
        }
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }

    /// Run `operation` for `key` unless a cached or in-flight result exists.
    ///
    /// `operation` is invoked at most once per call and only by the caller
    /// that becomes the executor.
    pub async fn execute<F, Fut>(&self, key: &str, operation: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        match self.claim(key) {
            Claim::Cached(value) => {
                debug!(key, "Coalescer cache hit");
                metrics::record_cache_hit();
                Ok(value)
            }
            Claim::Wait(receiver) => {
                debug!(key, "Joined in-flight execution");
                metrics::record_coalesced_join();
                wait_for_outcome(receiver).await
            }
            Claim::Execute(generation) => {
                debug!(key, generation, "Executing coalesced operation");
                metrics::record_execution();
                let guard = ExecutionGuard {
                    inner: Arc::clone(&self.inner),
                    key: key.to_string(),
                    generation,
                    ttl: self.config.ttl,
                    settled: false,
                };
                let outcome = operation().await;
                guard.settle(outcome.clone());
                outcome
            }
        }
    }

    fn claim(&self, key: &str) -> Claim<T> {
        let now = clock::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(value) = inner.cached(key, now) {
            inner.hits += 1;
            return Claim::Cached(value);
        }

        if let Some(entry) = inner.in_flight.get_mut(key) {
            entry.waiters += 1;
            inner.joins += 1;
            return Claim::Wait(entry.sender.subscribe());
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.executions += 1;
        let (sender, _) = watch::channel(None);
        inner.in_flight.insert(
            key.to_string(),
            InFlight {
                generation,
                sender,
                created_at: now,
                waiters: 0,
            },
        );
        inner.publish_sizes();
        Claim::Execute(generation)
    }

    pub fn stats(&self) -> CoalescerStats {
        let inner = self.inner.lock();
        CoalescerStats {
            cache_entries: inner.cache.len(),
            cache_capacity: inner.cache.capacity(),
            in_flight: inner.in_flight.len(),
            hits: inner.hits,
            joins: inner.joins,
            executions: inner.executions,
            evictions: inner.evictions,
            stale_resolved: inner.stale_resolved,
        }
    }

    /// Whether an execution for `key` is currently registered.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.lock().in_flight.contains_key(key)
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(clock::now())
    }

    /// Expire cache entries and force-resolve stale executions as of `now`.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let max_age = self.config.max_in_flight_age;
        let (expired, stale) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let expired = inner.cache.retain(|_, cached| now < cached.expires_at);

            let stale_keys: Vec<String> = inner
                .in_flight
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.created_at) >= max_age)
                .map(|(key, _)| key.clone())
                .collect();
            let stale: Vec<(String, InFlight<T>)> = stale_keys
                .into_iter()
                .filter_map(|key| inner.in_flight.remove(&key).map(|entry| (key, entry)))
                .collect();

            inner.stale_resolved += stale.len() as u64;
            inner.publish_sizes();
            (expired, stale)
        };

        let timeout_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        for (key, entry) in &stale {
            warn!(
                key = %key,
                waiters = entry.waiters,
                age_ms = now.saturating_duration_since(entry.created_at).as_millis() as u64,
                "Force-resolving stale in-flight execution"
            );
            entry
                .sender
                .send_replace(Some(Err(AppError::Timeout { timeout_ms })));
        }
        if !stale.is_empty() {
            metrics::record_stale_resolution(stale.len() as u64);
        }
        if expired > 0 {
            debug!(expired, "Swept expired cache entries");
        }

        SweepReport {
            expired,
            stale: stale.len(),
        }
    }

    /// Register the periodic sweep on `sweeper`.
    pub fn start_sweeper(&self, sweeper: &Sweeper, period: Duration) {
        let coalescer = self.clone();
        sweeper.spawn_periodic("coalescer_sweep", period, move || {
            let coalescer = coalescer.clone();
            async move {
                coalescer.sweep();
            }
        });
    }
}

async fn wait_for_outcome<T: Clone>(mut receiver: watch::Receiver<Outcome<T>>) -> AppResult<T> {
    loop {
        let current = receiver.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if receiver.changed().await.is_err() {
            let last = receiver.borrow().clone();
            return last.unwrap_or_else(|| {
                Err(AppError::Internal(
                    "Coalesced execution ended without an outcome".to_string(),
                ))
            });
        }
    }
}

/// Settles an execution exactly once, including when the executor is dropped.
struct ExecutionGuard<T: Clone> {
    inner: Arc<Mutex<Inner<T>>>,
    key: String,
    generation: u64,
    ttl: Duration,
    settled: bool,
}

impl<T: Clone> ExecutionGuard<T> {
    fn settle(mut self, outcome: AppResult<T>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: AppResult<T>) {
        self.settled = true;
        let now = clock::now();
        let sender = {
            let mut inner = self.inner.lock();
            if let Ok(value) = &outcome {
                inner.store(&self.key, value.clone(), now + self.ttl);
            }
            let sender = inner.release(&self.key, self.generation);
            inner.publish_sizes();
            sender
        };

        match sender {
            Some(sender) => {
                sender.send_replace(Some(outcome));
            }
            None => debug!(
                key = %self.key,
                generation = self.generation,
                "Execution settled after its registration was swept"
            ),
        }
    }
}

impl<T: Clone> Drop for ExecutionGuard<T> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(key = %self.key, "Coalesced executor dropped before completing");
            self.finish(Err(AppError::Internal(
                "Coalesced execution was cancelled".to_string(),
            )));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coalescer(ttl_secs: u64, capacity: usize) -> RequestCoalescer<String> {
        RequestCoalescer::new(CoalescerConfig {
            ttl: Duration::from_secs(ttl_secs),
            capacity,
            max_in_flight_age: Duration::from_secs(5),
        })
    }

    async fn slow_ok(calls: &AtomicUsize, value: &str) -> AppResult<String> {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(value.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_calls_execute_once() {
        let c = coalescer(30, 10);
        let calls = AtomicUsize::new(0);

        let (a, b, d, e, f) = tokio::join!(
            c.execute("k", || slow_ok(&calls, "result")),
            c.execute("k", || slow_ok(&calls, "other")),
            c.execute("k", || slow_ok(&calls, "other")),
            c.execute("k", || slow_ok(&calls, "other")),
            c.execute("k", || slow_ok(&calls, "other")),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for outcome in [a, b, d, e, f] {
            assert_eq!(outcome.unwrap(), "result");
        }
        let stats = c.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.joins, 4);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.cache_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_broadcast_but_not_cached() {
        let c = coalescer(30, 10);
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let failing = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<String, _>(AppError::Internal("provider unavailable".to_string()))
        };

        let (a, b, d) = tokio::join!(
            c.execute("k", failing),
            c.execute("k", failing),
            c.execute("k", failing)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let expected = AppError::Internal("provider unavailable".to_string());
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
        assert_eq!(d.unwrap_err(), expected);
        assert_eq!(c.stats().cache_entries, 0);
        assert!(!c.is_in_flight("k"));

        // Next caller retries fresh
        let retried = c.execute("k", || slow_ok(&calls, "recovered")).await;
        assert_eq!(retried.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_window() {
        let c = coalescer(30, 10);
        let calls = AtomicUsize::new(0);

        c.execute("k", || slow_ok(&calls, "v1")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        let hit = c.execute("k", || slow_ok(&calls, "v2")).await.unwrap();
        assert_eq!(hit, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        let miss = c.execute("k", || slow_ok(&calls, "v3")).await.unwrap();
        assert_eq!(miss, "v3");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_not_served_at_expiry() {
        let c = coalescer(30, 10);
        let calls = AtomicUsize::new(0);
        // Immediate operation so expiry is exactly now + 30s
        c.execute("k", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("v1".to_string())
        })
        .await
        .unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let value = c
            .execute("k", || async { Ok("v2".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_coalesce() {
        let c = coalescer(30, 10);
        let calls = AtomicUsize::new(0);
        let (a, b) = tokio::join!(
            c.execute("a", || slow_ok(&calls, "A")),
            c.execute("b", || slow_ok(&calls, "B")),
        );
        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let c = coalescer(300, 2);
        for key in ["a", "b", "c"] {
            c.execute(key, || async { Ok(key.to_string()) }).await.unwrap();
        }
        let stats = c.stats();
        assert_eq!(stats.cache_entries, 2);
        assert_eq!(stats.evictions, 1);

        // "a" was evicted, so it executes again
        let calls = AtomicUsize::new(0);
        c.execute("a", || slow_ok(&calls, "a2")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        c.execute("c", || slow_ok(&calls, "c2")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_executor_releases_waiters() {
        let c = coalescer(30, 10);

        let executor = {
            let c = c.clone();
            tokio::spawn(async move {
                c.execute("k", || async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("never".to_string())
                })
                .await
            })
        };
        while !c.is_in_flight("k") {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.execute("k", || async { Ok("dup".to_string()) }).await })
        };
        while c.stats().joins == 0 {
            tokio::task::yield_now().await;
        }

        executor.abort();
        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(AppError::Internal(_))));
        assert!(!c.is_in_flight("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_force_resolves_stale_in_flight() {
        let c = coalescer(30, 10);

        let executor = {
            let c = c.clone();
            tokio::spawn(async move {
                c.execute("k", || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("late".to_string())
                })
                .await
            })
        };
        while !c.is_in_flight("k") {
            tokio::task::yield_now().await;
        }
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.execute("k", || async { Ok("dup".to_string()) }).await })
        };
        while c.stats().joins == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(c.sweep().stale, 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(c.sweep().stale, 1);

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.unwrap_err(), AppError::Timeout { timeout_ms: 5_000 });

        // A new caller starts a fresh execution under a new generation
        let calls = AtomicUsize::new(0);
        let fresh = c.execute("k", || slow_ok(&calls, "fresh")).await.unwrap();
        assert_eq!(fresh, "fresh");

        // The original executor still finishes with its own result
        assert_eq!(executor.await.unwrap().unwrap(), "late");
        assert_eq!(c.stats().stale_resolved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_cache_entries() {
        let c = coalescer(30, 10);
        c.execute("k", || async { Ok("v".to_string()) }).await.unwrap();
        assert_eq!(c.sweep().expired, 0);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(c.sweep().expired, 1);
        assert_eq!(c.stats().cache_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_derived_keys_share_execution() {
        let c = coalescer(30, 10);
        let calls = AtomicUsize::new(0);
        let base = GenerationOptions {
            temperature: Some(0.2),
            ..Default::default()
        };
        let with_user = GenerationOptions {
            user_id: Some("u-1".to_string()),
            ..base.clone()
        };
        let k1 = CoalesceKey::derive("sim", "text", &base);
        let k2 = CoalesceKey::derive("sim", "text", &with_user);

        let (a, b) = tokio::join!(
            c.execute(k1.as_str(), || slow_ok(&calls, "shared")),
            c.execute(k2.as_str(), || slow_ok(&calls, "other")),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

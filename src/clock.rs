//! Clock and timer primitives.
//!
//! Monotonic reads go through [`tokio::time::Instant`] so that tests running
//! on a paused runtime (`#[tokio::test(start_paused = true)]`) control time
//! exactly with `tokio::time::advance`.
//!
//! [`Sweeper`] owns the periodic maintenance tasks of the shared services
//! (rate-limit and coalescer sweeps). Tasks are tracked with a
//! `TaskTracker` and stopped through a `CancellationToken`, so a graceful
//! shutdown never leaves a timer keeping the process alive.

use std::future::Future;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Current monotonic time.
#[inline]
pub fn now() -> Instant {
    Instant::now()
}

/// Current wall-clock time as ISO-8601 UTC with millisecond precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Whole seconds from `now` until `deadline`, rounded up.
pub fn ceil_secs(deadline: Instant, now: Instant) -> u64 {
    let remaining = deadline.saturating_duration_since(now);
    let millis = remaining.as_millis();
    u64::try_from(millis.div_ceil(1000)).unwrap_or(u64::MAX)
}

/// Owner of periodic background sweeps.
///
/// Cloning shares the same tracker and token; stopping any clone stops all.
#[derive(Debug, Clone, Default)]
pub struct Sweeper {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Sweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period` until [`Sweeper::stop`] is called.
    ///
    /// The first tick fires one full period after spawning.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!(task = name, "Sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        tick().await;
                    }
                }
            }

            debug!(task = name, "Sweep task shutting down");
        });
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every sweep and wait for them to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("All sweep tasks have completed");
    }
}

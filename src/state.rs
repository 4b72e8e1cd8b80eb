//! Shared application state for the HTTP surface.
//!
//! The state owns every long-lived collaborator:
//!
//! - **Pipeline**: rate limiter, authenticator and trusted proxy list shared
//!   by every endpoint
//! - **Analyzer**: the simulated metered provider and its request coalescer
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! Periodic sweeps (rate-limit windows, internal-secret blocks, coalescer
//! cache and stale executions) run on a [`Sweeper`]. Call `shutdown()` to
//! stop them before the application exits.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::clock::Sweeper;
use crate::coalescer::RequestCoalescer;
use crate::config::Config;
use crate::error::AppResult;
use crate::middleware::{Authenticator, IdentityResolver, RateLimiter, TrustedProxyConfig};
use crate::models::StatsResponse;
use crate::pipeline::Pipeline;
use crate::services::TextAnalyzer;

const PROVIDER_NAME: &str = "simulated";

/// Shared application state. Cheap to clone.
///
/// # Lifecycle
///
/// Sweep tasks are spawned when the state is created, so construction must
/// happen inside a Tokio runtime:
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Pipeline,
    pub analyzer: TextAnalyzer,
    /// Timestamp when the application started
    pub started_at: Instant,
    sweeper: Sweeper,
}

impl AppState {
    /// Build state with identities resolved from `API_TOKENS`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `API_TOKENS` is malformed.
    pub fn new(config: Config) -> AppResult<Self> {
        let resolver = config.token_resolver()?;
        info!(tokens = resolver.len(), "Static token resolver configured");
        Ok(Self::with_resolver(config, Arc::new(resolver)))
    }

    /// Build state around a caller-supplied identity resolver.
    pub fn with_resolver(config: Config, resolver: Arc<dyn IdentityResolver>) -> Self {
        let sweeper = Sweeper::new();

        let rate_limiter = RateLimiter::new();
        rate_limiter.start_sweeper(&sweeper, config.rate_limit_sweep_interval);

        let coalescer = RequestCoalescer::new(config.coalescer_config());
        coalescer.start_sweeper(&sweeper, config.coalescer_sweep_interval);

        if !config.internal_auth_enabled() {
            info!("INTERNAL_API_SECRET not set; internal routes reject every caller");
        }
        if config.proxy_validation_enabled() {
            info!(
                trusted_proxies = config.trusted_proxies.len(),
                "Trusted proxy validation enabled"
            );
        }

        let authenticator = Authenticator::new(resolver, config.internal_api_secret.clone());
        authenticator.start_sweeper(&sweeper, config.rate_limit_sweep_interval);
        let pipeline = Pipeline::new(rate_limiter, authenticator)
            .with_trusted_proxies(TrustedProxyConfig::new(&config.trusted_proxies))
            .with_max_body_size(config.max_request_body_size)
            .with_default_timeout(config.default_timeout);

        let analyzer = TextAnalyzer::new(PROVIDER_NAME, config.analyzer_latency, coalescer);

        Self {
            config: Arc::new(config),
            pipeline,
            analyzer,
            started_at: Instant::now(),
            sweeper,
        }
    }

    /// Operational snapshot for `/internal/stats`.
    pub fn stats(&self) -> StatsResponse {
        let coalescer = self.analyzer.coalescer().stats();
        StatsResponse {
            rate_limit_keys: self.pipeline.rate_limiter().len(),
            cache_entries: coalescer.cache_entries,
            cache_capacity: coalescer.cache_capacity,
            in_flight: coalescer.in_flight,
            cache_hits: coalescer.hits,
            coalesced_joins: coalescer.joins,
            executions: coalescer.executions,
            evictions: coalescer.evictions,
            uptime_seconds: self.uptime_seconds(),
        }
    }

    /// Stop every sweep task and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of sweep tasks");
        self.sweeper.stop().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.sweeper.is_stopped()
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[tokio::test]
    async fn test_new_rejects_malformed_tokens() {
        let config = Config {
            api_tokens: "missing-plan".to_string(),
            ..Config::default()
        };
        assert!(matches!(AppState::new(config), Err(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let state = AppState::new(Config::default()).unwrap();
        let stats = state.stats();
        assert_eq!(stats.rate_limit_keys, 0);
        assert_eq!(stats.cache_entries, 0);
        assert_eq!(stats.cache_capacity, 1000);
        assert_eq!(stats.executions, 0);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeps() {
        let state = AppState::new(Config::default()).unwrap();
        assert!(!state.is_shut_down());
        state.shutdown().await;
        assert!(state.is_shut_down());
    }
}

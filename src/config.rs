//! Application configuration loaded from environment variables.
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `API_TOKENS`: `token:user_id:plan` triples, comma-separated, resolved by
//!   the static identity resolver
//! - `INTERNAL_API_SECRET`: bearer secret for internal routes; unset disables them
//! - `TRUSTED_PROXIES`: CIDR ranges allowed to set forwarding headers
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated list of allowed origins (default: `*` for dev)
//!
//! # Coalescer Tuning
//!
//! - `CACHE_TTL_SECS`: How long successful results stay cached (default: 30)
//! - `CACHE_CAPACITY`: Maximum cached results before LRU eviction (default: 1000)
//! - `COALESCER_MAX_IN_FLIGHT_SECS`: Age after which a stuck execution is
//!   force-resolved (default: 120)

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::coalescer::CoalescerConfig;
use crate::error::{AppError, AppResult};
use crate::middleware::StaticTokenResolver;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected json or pretty)")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    /// Handler timeout for routes that do not set their own (default: 30s)
    pub default_timeout: Duration,

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    /// How often elapsed rate-limit windows are reclaimed (default: 60s)
    pub rate_limit_sweep_interval: Duration,

    // =========================================================================
    // Coalescer
    // =========================================================================
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub coalescer_sweep_interval: Duration,
    pub coalescer_max_in_flight: Duration,

    /// Simulated provider latency for the analyze endpoint (default: 250ms)
    pub analyzer_latency: Duration,

    // =========================================================================
    // Security
    // =========================================================================
    pub internal_api_secret: Option<String>,

    /// Raw `API_TOKENS` value; parsed by [`Config::token_resolver`].
    pub api_tokens: String,

    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges for X-Forwarded-For validation.
    ///
    /// Empty means every forwarding header is trusted, which allows IP
    /// spoofing. Set this to your reverse proxy's ranges in production.
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability
    // =========================================================================
    /// `RUST_LOG`-style filter directives
    pub log_level: String,
    pub log_format: LogFormat,

    /// Prometheus listener port; 0 disables metrics (default: 9090)
    pub metrics_port: u16,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_request_body_size", &self.max_request_body_size)
            .field("default_timeout", &self.default_timeout)
            .field("rate_limit_sweep_interval", &self.rate_limit_sweep_interval)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_capacity", &self.cache_capacity)
            .field("coalescer_sweep_interval", &self.coalescer_sweep_interval)
            .field("coalescer_max_in_flight", &self.coalescer_max_in_flight)
            .field("analyzer_latency", &self.analyzer_latency)
            .field(
                "internal_api_secret",
                &self.internal_api_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("api_tokens", &"<redacted>")
            .field("cors_allowed_origins", &self.cors_allowed_origins)
            .field("trusted_proxies", &self.trusted_proxies)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("metrics_port", &self.metrics_port)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or
    /// [`Config::validate`] rejects the combination.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,
            default_timeout: Duration::from_millis(Self::parse_env("DEFAULT_TIMEOUT_MS", 30_000)?),

            // Rate limiting
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Coalescer
            cache_ttl: Duration::from_secs(Self::parse_env("CACHE_TTL_SECS", 30)?),
            cache_capacity: Self::parse_env("CACHE_CAPACITY", 1000)?,
            coalescer_sweep_interval: Duration::from_secs(Self::parse_env(
                "COALESCER_SWEEP_INTERVAL_SECS",
                10,
            )?),
            coalescer_max_in_flight: Duration::from_secs(Self::parse_env(
                "COALESCER_MAX_IN_FLIGHT_SECS",
                120,
            )?),
            analyzer_latency: Duration::from_millis(Self::parse_env("ANALYZER_LATENCY_MS", 250)?),

            // Security
            internal_api_secret: env::var("INTERNAL_API_SECRET")
                .ok()
                .filter(|k| !k.is_empty()),
            api_tokens: env::var("API_TOKENS").unwrap_or_default(),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.default_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "DEFAULT_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_sweep_interval.is_zero() || self.coalescer_sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "Sweep intervals must be greater than 0".to_string(),
            ));
        }

        if self.cache_ttl.is_zero() {
            return Err(AppError::ConfigError(
                "CACHE_TTL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.cache_capacity == 0 {
            return Err(AppError::ConfigError(
                "CACHE_CAPACITY must be greater than 0".to_string(),
            ));
        }

        // Executions must be allowed to outlive one sweep period
        if self.coalescer_max_in_flight < self.coalescer_sweep_interval {
            return Err(AppError::ConfigError(format!(
                "COALESCER_MAX_IN_FLIGHT_SECS ({:?}) must be >= the sweep interval ({:?})",
                self.coalescer_max_in_flight, self.coalescer_sweep_interval
            )));
        }

        self.token_resolver()?;

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if internal routes can authenticate anyone.
    pub fn internal_auth_enabled(&self) -> bool {
        self.internal_api_secret.is_some()
    }

    /// Check if trusted proxy validation is enabled.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Tracing filter from `log_level`; unparseable directives fall back to
    /// `info`.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    pub fn coalescer_config(&self) -> CoalescerConfig {
        CoalescerConfig {
            ttl: self.cache_ttl,
            capacity: self.cache_capacity,
            max_in_flight_age: self.coalescer_max_in_flight,
        }
    }

    /// Build the identity resolver described by `API_TOKENS`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for malformed entries.
    pub fn token_resolver(&self) -> AppResult<StaticTokenResolver> {
        StaticTokenResolver::parse(&self.api_tokens)
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated list, dropping blank entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_request_body_size: 1024 * 1024,
            default_timeout: Duration::from_secs(30),
            rate_limit_sweep_interval: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 1000,
            coalescer_sweep_interval: Duration::from_secs(10),
            coalescer_max_in_flight: Duration::from_secs(120),
            analyzer_latency: Duration::from_millis(250),
            internal_api_secret: None,
            api_tokens: String::new(),
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: Vec::new(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.cache_capacity, 1000);
        assert!(config.internal_api_secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "localhost".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "localhost:8080");
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let zero_capacity = Config {
            cache_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(
            zero_capacity.validate(),
            Err(AppError::ConfigError(msg)) if msg.contains("CACHE_CAPACITY")
        ));

        let zero_timeout = Config {
            default_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(zero_timeout.validate().is_err());

        let zero_body = Config {
            max_request_body_size: 0,
            ..Config::default()
        };
        assert!(zero_body.validate().is_err());
    }

    #[test]
    fn test_validate_in_flight_age_vs_sweep() {
        let config = Config {
            coalescer_sweep_interval: Duration::from_secs(60),
            coalescer_max_in_flight: Duration::from_secs(30),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_tokens() {
        let config = Config {
            api_tokens: "tok-1:alice:platinum".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            api_tokens: "tok-1:alice:pro, tok-2:bob:free".to_string(),
            ..Config::default()
        };
        assert_eq!(config.token_resolver().unwrap().len(), 2);
    }

    #[test]
    fn test_coalescer_config_mapping() {
        let config = Config {
            cache_ttl: Duration::from_secs(5),
            cache_capacity: 10,
            ..Config::default()
        };
        let coalescer = config.coalescer_config();
        assert_eq!(coalescer.ttl, Duration::from_secs(5));
        assert_eq!(coalescer.capacity, 10);
        assert_eq!(coalescer.max_in_flight_age, Duration::from_secs(120));
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_env_filter_from_log_level() {
        let config = Config {
            log_level: "debug,hyper=warn".to_string(),
            ..Config::default()
        };
        let filter = config.env_filter().to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("hyper=warn"));

        let garbage = Config {
            log_level: "request_pipeline=loudest".to_string(),
            ..Config::default()
        };
        assert_eq!(garbage.env_filter().to_string(), "info");
    }

    #[test]
    fn test_metrics_addr() {
        let disabled = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(disabled.metrics_addr().is_none());
        assert_eq!(Config::default().metrics_addr().unwrap().port(), 9090);
    }
}

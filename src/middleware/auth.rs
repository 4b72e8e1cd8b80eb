//! Bearer credential extraction and identity resolution.
//!
//! # Modes
//!
//! - [`AuthMode::Bearer`]: `Authorization: Bearer <token>` is resolved to an
//!   [`Identity`] by the injected [`IdentityResolver`]. An absent header is
//!   not an error; the pipeline decides later whether identity is required.
//! - [`AuthMode::InternalSecret`]: the bearer token must equal the configured
//!   internal secret. Comparison is constant-time, and repeated failures from
//!   one IP are throttled.
//!
//! A header with any scheme other than `Bearer`, or an empty token, is a
//! validation fault (400), not an authentication fault.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::clock::{self, Sweeper};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Identity, Plan};

/// Boxed future returned by object-safe async collaborators.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// User id assigned to callers authenticated with the internal secret.
pub const INTERNAL_USER_ID: &str = "internal";

/// Maximum internal-secret failures per IP per minute before blocking.
const INTERNAL_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

/// Burst capacity for internal-secret failure throttling.
const INTERNAL_FAILURE_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

type FailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// How a route authenticates its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    Bearer,
    InternalSecret,
}

/// Resolves bearer tokens to identities.
///
/// Implementations may hit a database or identity provider; unknown tokens
/// resolve to `Ok(None)`.
pub trait IdentityResolver: Send + Sync {
    fn resolve<'a>(&'a self, token: &'a str) -> BoxFuture<'a, AppResult<Option<Identity>>>;
}

/// In-memory token table, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenResolver {
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    /// Parse `token:user_id:plan` triples separated by commas.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for malformed triples or unknown plans.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let mut tokens = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let (Some(token), Some(user), Some(plan)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(AppError::ConfigError(
                    "API_TOKENS entries must look like token:user_id:plan".to_string(),
                ));
            };
            let plan: Plan = plan.parse().map_err(AppError::ConfigError)?;
            tokens.insert(token.to_string(), Identity::new(user, plan));
        }
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityResolver for StaticTokenResolver {
    fn resolve<'a>(&'a self, token: &'a str) -> BoxFuture<'a, AppResult<Option<Identity>>> {
        Box::pin(async move { Ok(self.tokens.get(token).cloned()) })
    }
}

/// Extract the bearer token from `Authorization`.
///
/// Returns `Ok(None)` when the header is absent.
///
/// # Errors
///
/// `AppError::Validation` when the header is not valid text, uses another
/// scheme, or carries an empty token.
pub fn parse_bearer(headers: &HeaderMap) -> AppResult<Option<String>> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };

    let value = value
        .to_str()
        .map_err(|_| AppError::Validation("Malformed authorization header".to_string()))?;

    let (scheme, token) = value.trim().split_once(' ').unwrap_or((value.trim(), ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::Validation(
            "Authorization header must use the Bearer scheme".to_string(),
        ));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::Validation(
            "Authorization header is missing a token".to_string(),
        ));
    }

    Ok(Some(token.to_string()))
}

/// Identity extraction stage shared by every endpoint.
#[derive(Clone)]
pub struct Authenticator {
    resolver: Arc<dyn IdentityResolver>,
    internal_secret: Option<Arc<String>>,
    failure_limiter: Arc<FailureLimiter>,
    blocked: Arc<DashMap<String, Instant>>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("internal_secret", &self.internal_secret.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(resolver: Arc<dyn IdentityResolver>, internal_secret: Option<String>) -> Self {
        let quota = Quota::per_minute(INTERNAL_FAILURE_LIMIT).allow_burst(INTERNAL_FAILURE_BURST);
        Self {
            resolver,
            internal_secret: internal_secret.filter(|s| !s.is_empty()).map(Arc::new),
            failure_limiter: Arc::new(RateLimiter::keyed(quota)),
            blocked: Arc::new(DashMap::new()),
        }
    }

    /// Resolve the caller's identity for `mode`.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed `Authorization` header
    /// - `Unauthenticated` for a wrong internal secret
    /// - `RateLimited` when an IP has exhausted its internal-secret failures
    /// - whatever the resolver returns
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        mode: AuthMode,
        client_ip: &str,
    ) -> AppResult<Option<Identity>> {
        let token = parse_bearer(headers)?;

        match mode {
            AuthMode::Bearer => match token {
                Some(token) => {
                    let identity = self.resolver.resolve(&token).await?;
                    if identity.is_none() {
                        debug!("Bearer token did not resolve to an identity");
                    }
                    Ok(identity)
                }
                None => Ok(None),
            },
            AuthMode::InternalSecret => self.check_internal(token.as_deref(), client_ip),
        }
    }

    fn check_internal(&self, token: Option<&str>, client_ip: &str) -> AppResult<Option<Identity>> {
        let Some(expected) = &self.internal_secret else {
            warn!("Internal route called but no internal secret is configured");
            return Err(AppError::Unauthenticated(
                "Internal access is not configured".to_string(),
            ));
        };

        if let Some(retry_after_secs) = self.blocked_for(client_ip) {
            error!(
                client_ip,
                retry_after_secs, "IP blocked due to excessive internal-secret failures"
            );
            return Err(AppError::RateLimited { retry_after_secs });
        }

        match token {
            Some(provided) if constant_time_eq(provided, expected) => {
                Ok(Some(Identity::new(INTERNAL_USER_ID, Plan::Enterprise)))
            }
            Some(_) => {
                warn!(client_ip, "Invalid internal secret provided");
                metrics::record_auth_failure("invalid_secret");
                self.record_failure(client_ip)?;
                Err(AppError::Unauthenticated(
                    "Invalid internal credentials".to_string(),
                ))
            }
            None => {
                warn!(client_ip, "Missing internal secret");
                metrics::record_auth_failure("missing_secret");
                self.record_failure(client_ip)?;
                Err(AppError::Unauthenticated(
                    "Internal credentials required".to_string(),
                ))
            }
        }
    }

    /// Number of IPs currently tracked as blocked.
    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    /// Drop expired blocks and idle failure counters.
    pub fn sweep(&self) -> usize {
        self.sweep_at(clock::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.blocked.len();
        self.blocked.retain(|_, until| *until > now);
        let removed = before.saturating_sub(self.blocked.len());

        self.failure_limiter.retain_recent();
        self.failure_limiter.shrink_to_fit();

        if removed > 0 {
            debug!(
                removed,
                tracked = self.failure_limiter.len(),
                "Swept expired internal-secret blocks"
            );
        }
        removed
    }

    /// Register the periodic sweep on `sweeper`.
    pub fn start_sweeper(&self, sweeper: &Sweeper, period: Duration) {
        let authenticator = self.clone();
        sweeper.spawn_periodic("auth_failure_sweep", period, move || {
            let authenticator = authenticator.clone();
            async move {
                authenticator.sweep();
            }
        });
    }

    /// Seconds left on an active block for `client_ip`.
    fn blocked_for(&self, client_ip: &str) -> Option<u64> {
        let now = clock::now();
        let until = self.blocked.get(client_ip).map(|b| *b)?;
        if until > now {
            Some(until.duration_since(now).as_secs().max(1))
        } else {
            self.blocked.remove(client_ip);
            None
        }
    }

    /// Count a failure; once the quota is exhausted the IP is blocked.
    fn record_failure(&self, client_ip: &str) -> AppResult<()> {
        let key = client_ip.to_string();
        if let Err(not_until) = self.failure_limiter.check_key(&key) {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            self.blocked.insert(key, clock::now() + wait);
            let retry_after_secs = wait.as_secs().max(1);
            error!(
                client_ip,
                retry_after_secs, "Blocking IP after repeated internal-secret failures"
            );
            return Err(AppError::RateLimited { retry_after_secs });
        }
        Ok(())
    }
}

/// Constant-time string equality.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn auth_header(value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_static(value));
        h
    }

    fn authenticator(secret: Option<&str>) -> Authenticator {
        let resolver =
            StaticTokenResolver::default().with_token("tok-free", Identity::new("u1", Plan::Free));
        Authenticator::new(Arc::new(resolver), secret.map(str::to_string))
    }

    #[test]
    fn test_parse_bearer_absent() {
        assert_eq!(parse_bearer(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn test_parse_bearer_ok() {
        assert_eq!(
            parse_bearer(&auth_header("Bearer abc123")).unwrap(),
            Some("abc123".to_string())
        );
        assert_eq!(
            parse_bearer(&auth_header("bearer   abc123 ")).unwrap(),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn test_parse_bearer_wrong_scheme() {
        let err = parse_bearer(&auth_header("Basic dXNlcjpwYXNz")).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_parse_bearer_empty_token() {
        let err = parse_bearer(&auth_header("Bearer")).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_static_resolver_parse() {
        let resolver = StaticTokenResolver::parse("a:alice:pro, b:bob:free").unwrap();
        assert_eq!(resolver.len(), 2);
        assert!(StaticTokenResolver::parse("broken").is_err());
        assert!(StaticTokenResolver::parse("a:alice:gold").is_err());
    }

    #[tokio::test]
    async fn test_bearer_resolution() {
        let auth = authenticator(None);
        let identity = auth
            .authenticate(&auth_header("Bearer tok-free"), AuthMode::Bearer, "1.1.1.1")
            .await
            .unwrap();
        assert_eq!(identity, Some(Identity::new("u1", Plan::Free)));

        let unknown = auth
            .authenticate(&auth_header("Bearer nope"), AuthMode::Bearer, "1.1.1.1")
            .await
            .unwrap();
        assert_eq!(unknown, None);
    }

    #[tokio::test]
    async fn test_internal_secret() {
        let auth = authenticator(Some("s3cret"));
        let ok = auth
            .authenticate(&auth_header("Bearer s3cret"), AuthMode::InternalSecret, "1.1.1.1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok.user_id, INTERNAL_USER_ID);
        assert_eq!(ok.plan, Plan::Enterprise);

        let bad = auth
            .authenticate(&auth_header("Bearer wrong"), AuthMode::InternalSecret, "1.1.1.1")
            .await
            .unwrap_err();
        assert!(matches!(bad, AppError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_internal_without_secret_rejects() {
        let auth = authenticator(None);
        let err = auth
            .authenticate(&auth_header("Bearer anything"), AuthMode::InternalSecret, "1.1.1.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_internal_brute_force_blocked() {
        let auth = authenticator(Some("s3cret"));
        let headers = auth_header("Bearer guess");
        let mut saw_block = false;
        for _ in 0..20 {
            if let Err(AppError::RateLimited { retry_after_secs }) = auth
                .authenticate(&headers, AuthMode::InternalSecret, "6.6.6.6")
                .await
            {
                assert!(retry_after_secs >= 1);
                saw_block = true;
                break;
            }
        }
        assert!(saw_block, "repeated failures should be throttled");
    }

    async fn block(auth: &Authenticator, ip: &str) -> u64 {
        let headers = auth_header("Bearer guess");
        for _ in 0..20 {
            if let Err(AppError::RateLimited { retry_after_secs }) =
                auth.authenticate(&headers, AuthMode::InternalSecret, ip).await
            {
                return retry_after_secs;
            }
        }
        panic!("{ip} was never blocked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_active_blocks() {
        let auth = authenticator(Some("s3cret"));
        block(&auth, "6.6.6.6").await;
        assert_eq!(auth.blocked_len(), 1);

        assert_eq!(auth.sweep(), 0);
        assert_eq!(auth.blocked_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_drops_expired_blocks() {
        let auth = authenticator(Some("s3cret"));
        let sweeper = Sweeper::new();
        auth.start_sweeper(&sweeper, Duration::from_secs(30));

        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            block(&auth, ip).await;
        }
        assert_eq!(auth.blocked_len(), 3);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(auth.blocked_len(), 0);

        sweeper.stop().await;
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret123", "secret123"));
        assert!(!constant_time_eq("secret123", "secret456"));
        assert!(!constant_time_eq("short", "much-longer-string"));
    }
}

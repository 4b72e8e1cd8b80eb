//! Per-route pipeline configuration and presets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method};

use crate::middleware::AuthMode;
use crate::models::Plan;
use crate::validation::Schema;

/// Inputs available when deriving a rate-limit key.
///
/// Rate limiting runs before identity extraction, so no identity is
/// available here.
#[derive(Debug, Clone, Copy)]
pub struct KeyContext<'a> {
    pub client_ip: &'a str,
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
}

/// Custom rate-limit key derivation.
pub type KeyFn = Arc<dyn Fn(&KeyContext<'_>) -> String + Send + Sync>;

/// Cross-cutting behaviour for one route.
///
/// Plain configuration: build one with a preset, adjust it with the
/// `with_*` methods, and hand it to [`Pipeline::endpoint`](super::Pipeline::endpoint).
#[derive(Clone)]
pub struct MiddlewareOptions {
    pub require_auth: bool,
    pub required_plan: Option<Plan>,
    pub auth_mode: AuthMode,
    /// Calls allowed per window; 0 disables rate limiting.
    pub rate_limit: u32,
    pub rate_limit_window: Duration,
    /// Defaults to the client IP when unset.
    pub rate_limit_key: Option<KeyFn>,
    pub body_schema: Option<Arc<dyn Schema>>,
    pub query_schema: Option<Arc<dyn Schema>>,
    /// Handler budget; the pipeline default applies when unset.
    pub timeout: Option<Duration>,
}

impl MiddlewareOptions {
    /// Anonymous access, 100 calls per minute per IP.
    pub fn public() -> Self {
        Self {
            require_auth: false,
            required_plan: None,
            auth_mode: AuthMode::Bearer,
            rate_limit: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_key: None,
            body_schema: None,
            query_schema: None,
            timeout: None,
        }
    }

    /// Authenticated callers only, 60 calls per minute.
    pub fn protected() -> Self {
        Self {
            require_auth: true,
            rate_limit: 60,
            ..Self::public()
        }
    }

    /// Authenticated callers on `plan` or above, 30 calls per minute.
    pub fn elevated(plan: Plan) -> Self {
        Self {
            required_plan: Some(plan),
            rate_limit: 30,
            ..Self::protected()
        }
    }

    /// Service-to-service calls authenticated by the internal secret.
    pub fn internal() -> Self {
        Self {
            require_auth: true,
            auth_mode: AuthMode::InternalSecret,
            rate_limit: 1000,
            ..Self::public()
        }
    }

    pub fn with_rate_limit(mut self, limit: u32, window: Duration) -> Self {
        self.rate_limit = limit;
        self.rate_limit_window = window;
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = 0;
        self
    }

    pub fn with_rate_limit_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&KeyContext<'_>) -> String + Send + Sync + 'static,
    {
        self.rate_limit_key = Some(Arc::new(key));
        self
    }

    pub fn with_required_plan(mut self, plan: Plan) -> Self {
        self.require_auth = true;
        self.required_plan = Some(plan);
        self
    }

    pub fn with_body_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.body_schema = Some(schema);
        self
    }

    pub fn with_query_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.query_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn rate_limited(&self) -> bool {
        self.rate_limit > 0
    }

    /// Key for the rate limiter under these options.
    pub fn derive_rate_limit_key(&self, ctx: &KeyContext<'_>) -> String {
        match &self.rate_limit_key {
            Some(derive) => derive(ctx),
            None => ctx.client_ip.to_string(),
        }
    }
}

impl Default for MiddlewareOptions {
    fn default() -> Self {
        Self::public()
    }
}

impl fmt::Debug for MiddlewareOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareOptions")
            .field("require_auth", &self.require_auth)
            .field("required_plan", &self.required_plan)
            .field("auth_mode", &self.auth_mode)
            .field("rate_limit", &self.rate_limit)
            .field("rate_limit_window", &self.rate_limit_window)
            .field("custom_rate_limit_key", &self.rate_limit_key.is_some())
            .field("body_schema", &self.body_schema.is_some())
            .field("query_schema", &self.query_schema.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

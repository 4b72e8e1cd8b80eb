//! The request pipeline.
//!
//! Every endpoint runs the same fixed sequence of stages; each stage can
//! short-circuit the rest:
//!
//! ```text
//! 1. context     bind a fresh RequestContext (deadline = now + timeout)
//! 2. rate limit  fixed window keyed by client IP or a custom key   → 429
//! 3. identity    parse bearer credential, resolve identity          → 400
//! 4. auth        identity required?                                 → 401
//! 5. plan        resolved plan >= required plan?                    → 401
//! 6. validation  query always, body for POST/PUT/PATCH; all errors  → 400
//! 7. handler     own task, raced against the timeout                → 500
//! 8. response    envelope { success, data | error, meta }
//! ```
//!
//! Presets ([`MiddlewareOptions::public`], [`MiddlewareOptions::protected`],
//! [`MiddlewareOptions::elevated`], [`MiddlewareOptions::internal`]) only
//! change configuration; the code path is the same.
//!
//! # Timeouts
//!
//! The handler runs on its own task with the request context bound. When
//! the timeout wins the race the handler's [`CancellationToken`] is
//! cancelled and the task is aborted, so the handler stops at its next
//! suspension point. Work the handler detached with `tokio::spawn` keeps
//! running unless it observes the token.

mod handler;
mod options;

pub use handler::{Handler, HandlerContext};
pub use options::{KeyContext, KeyFn, MiddlewareOptions};

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequestParts, MatchedPath, RawPathParams, Request};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tower::Service;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::clock;
use crate::context::{self, CreateOptions, RequestContext};
use crate::error::{AppError, AppResult, FieldViolation};
use crate::metrics;
use crate::middleware::rate_limit::RateLimitDecision;
use crate::middleware::{
    Authenticator, BoxFuture, RateLimiter, TrustedProxyConfig, extract_client_ip,
};
use crate::models::{Envelope, Identity, ResponseMeta};
use crate::redact::redact;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";

const RATE_LIMIT_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Shared stage dependencies. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Pipeline {
    rate_limiter: RateLimiter,
    authenticator: Authenticator,
    trusted_proxies: Arc<TrustedProxyConfig>,
    max_body_size: usize,
    default_timeout: Duration,
}

impl Pipeline {
    pub fn new(rate_limiter: RateLimiter, authenticator: Authenticator) -> Self {
        Self {
            rate_limiter,
            authenticator,
            trusted_proxies: Arc::new(TrustedProxyConfig::default()),
            max_body_size: 1024 * 1024,
            default_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_trusted_proxies(mut self, trusted_proxies: TrustedProxyConfig) -> Self {
        self.trusted_proxies = Arc::new(trusted_proxies);
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Wrap `handler` in the pipeline configured by `options`.
    pub fn endpoint<H: Handler>(&self, options: MiddlewareOptions, handler: H) -> Endpoint {
        Endpoint {
            pipeline: self.clone(),
            options: Arc::new(options),
            handler: Arc::new(handler),
        }
    }

    /// Run every stage for one request. Always produces a response.
    pub async fn handle(
        &self,
        options: &MiddlewareOptions,
        handler: Arc<dyn Handler>,
        request: Request,
    ) -> Response {
        let (mut parts, body) = request.into_parts();

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let client_ip = extract_client_ip(&parts.headers, peer, &self.trusted_proxies).into_owned();
        let route = parts
            .extensions
            .get::<MatchedPath>()
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let path_params = path_params(&mut parts).await;
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        // Stage 1: context binding
        let ctx = RequestContext::create(CreateOptions {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            user_ip: client_ip.clone(),
            user_agent: header_str(&parts.headers, axum::http::header::USER_AGENT.as_str()),
            trace_id: header_str(&parts.headers, TRACE_ID_HEADER),
            timeout: Some(timeout),
        });

        let span = info_span!(
            "request",
            request_id = %ctx.request_id,
            trace_id = %ctx.trace_id,
            span_id = %ctx.span_id,
            method = %ctx.method,
            path = %ctx.path,
            client_ip = %client_ip,
            user_id = tracing::field::Empty,
        );
        let method = parts.method.clone();

        let work = async move {
            debug!("Request received");
            let mut rate_decision = None;
            let outcome = self
                .process(
                    options,
                    handler,
                    parts,
                    body,
                    path_params,
                    &client_ip,
                    timeout,
                    &mut rate_decision,
                )
                .await;
            self.respond(outcome, rate_decision, &route, &method)
        };

        context::run(ctx, work.instrument(span)).await
    }

    /// Stages 2 to 7.
    #[allow(clippy::too_many_arguments)]
    async fn process(
        &self,
        options: &MiddlewareOptions,
        handler: Arc<dyn Handler>,
        parts: Parts,
        body: Body,
        path_params: HashMap<String, String>,
        client_ip: &str,
        timeout: Duration,
        rate_decision: &mut Option<RateLimitDecision>,
    ) -> AppResult<Value> {
        // Stage 2: rate limiting
        if options.rate_limited() {
            let key = options.derive_rate_limit_key(&KeyContext {
                client_ip,
                method: &parts.method,
                path: parts.uri.path(),
                headers: &parts.headers,
            });
            let decision = self
                .rate_limiter
                .check(&key, options.rate_limit, options.rate_limit_window);
            *rate_decision = Some(decision);
            decision.into_result()?;
            debug!(remaining = decision.remaining, "Rate limit passed");
        }

        // Stage 3: identity extraction
        let identity = self
            .authenticator
            .authenticate(&parts.headers, options.auth_mode, client_ip)
            .await?;
        if let Some(identity) = &identity {
            record_identity(identity)?;
        }

        // Stage 4: auth requirement
        if options.require_auth && identity.is_none() {
            return Err(AppError::Unauthenticated(
                "Authentication required".to_string(),
            ));
        }

        // Stage 5: plan check
        if let Some(required) = options.required_plan {
            check_plan(identity.as_ref(), required)?;
        }

        // Stage 6: input validation
        let (query, body) = self.validate(options, &parts, body).await?;

        // Stage 7: handler racing the deadline
        let handler_ctx = HandlerContext {
            request: context::require()?,
            identity,
            body,
            query,
            headers: parts.headers,
            path_params,
            cancellation: CancellationToken::new(),
        };
        invoke(handler, handler_ctx, timeout).await
    }

    async fn validate(
        &self,
        options: &MiddlewareOptions,
        parts: &Parts,
        body: Body,
    ) -> AppResult<(Option<Value>, Option<Value>)> {
        let mut violations: Vec<FieldViolation> = Vec::new();

        let query = match &options.query_schema {
            Some(schema) => match schema.check_query(&parts.uri) {
                Ok(value) => Some(value),
                Err(found) => {
                    violations.extend(found);
                    None
                }
            },
            None => None,
        };

        let body = if is_mutating(&parts.method) {
            let raw = read_json_body(body, self.max_body_size).await?;
            match (&options.body_schema, raw) {
                (Some(schema), Some(raw)) => match schema.check_body(raw) {
                    Ok(value) => Some(value),
                    Err(found) => {
                        violations.extend(found);
                        None
                    }
                },
                (Some(_), None) => {
                    violations.push(FieldViolation::new("body", "is required"));
                    None
                }
                (None, raw) => raw,
            }
        } else {
            None
        };

        if !violations.is_empty() {
            return Err(AppError::SchemaValidation(violations));
        }

        if let Some(body) = &body {
            debug!(body = %redact(body), "Validated request body");
        }
        Ok((query, body))
    }

    /// Stage 8: map the outcome to an envelope.
    fn respond(
        &self,
        outcome: AppResult<Value>,
        rate_decision: Option<RateLimitDecision>,
        route: &str,
        method: &Method,
    ) -> Response {
        let current = context::current();
        let elapsed = current.as_ref().map(RequestContext::elapsed).unwrap_or_default();
        let request_id = current
            .as_ref()
            .map(|c| c.request_id.clone())
            .unwrap_or_default();
        let meta = ResponseMeta {
            request_id: request_id.clone(),
            timestamp: clock::timestamp(),
            duration: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        };

        let (status, envelope, retry_after) = match outcome {
            Ok(data) => {
                info!(status = 200, duration_ms = meta.duration, "Request completed");
                (StatusCode::OK, Envelope::success(data, meta), None)
            }
            Err(err) => {
                log_failure(&err, meta.duration);
                (err.status(), Envelope::failure(&err, meta), err.retry_after())
            }
        };

        let mut response = (status, Json(envelope)).into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        if let Some(decision) = rate_decision {
            headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
            headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(decision.remaining));
        }
        if let Some(retry_after) = retry_after {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
        }

        metrics::record_request(route, method.as_str(), status.as_u16(), elapsed.as_secs_f64());
        response
    }
}

/// Run the handler on its own task and race it against `timeout`.
async fn invoke(
    handler: Arc<dyn Handler>,
    ctx: HandlerContext,
    timeout: Duration,
) -> AppResult<Value> {
    let token = ctx.cancellation.clone();
    let cancel_on_drop = token.clone().drop_guard();
    let bound = context::require()?;

    let task = AbortOnDropHandle::new(tokio::spawn(
        context::run(bound, handler.call(ctx)).instrument(Span::current()),
    ));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => {
            cancel_on_drop.disarm();
            result
        }
        Ok(Err(join_error)) if join_error.is_panic() => {
            error!("Handler panicked");
            Err(AppError::Internal("Handler panicked".to_string()))
        }
        Ok(Err(_)) => Err(AppError::Internal("Handler task was cancelled".to_string())),
        Err(_) => {
            // Dropping the task handle aborts it; the guard cancels the token
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(timeout_ms, "Handler exceeded its timeout, cancelling");
            Err(AppError::Timeout { timeout_ms })
        }
    }
}

/// Record the resolved identity on the ambient context and log span.
fn record_identity(identity: &Identity) -> AppResult<()> {
    context::update(|ctx| {
        ctx.user_id = Some(identity.user_id.clone());
        ctx.user_plan = Some(identity.plan);
    })?;
    Span::current().record("user_id", identity.user_id.as_str());
    debug!(plan = %identity.plan, "Identity resolved");
    Ok(())
}

fn check_plan(identity: Option<&Identity>, required: crate::models::Plan) -> AppResult<()> {
    match identity {
        Some(identity) if identity.plan.satisfies(required) => Ok(()),
        Some(identity) => Err(AppError::Unauthenticated(format!(
            "This endpoint requires the {required} plan or higher (current plan: {})",
            identity.plan
        ))),
        None => Err(AppError::Unauthenticated(format!(
            "This endpoint requires the {required} plan or higher"
        ))),
    }
}

fn log_failure(err: &AppError, duration_ms: u64) {
    let details = err.details().map(|d| redact(&d));
    if err.is_operational() {
        warn!(
            code = err.code(),
            status = err.status().as_u16(),
            duration_ms,
            details = ?details,
            error = %err,
            "Request failed"
        );
    } else {
        error!(
            code = err.code(),
            status = err.status().as_u16(),
            duration_ms,
            details = ?details,
            error = %err,
            "Request failed"
        );
    }
}

pub fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Read and parse a JSON body; an empty body is `None`.
async fn read_json_body(body: Body, limit: usize) -> AppResult<Option<Value>> {
    let bytes: Bytes = axum::body::to_bytes(body, limit).await.map_err(|_| {
        AppError::Validation(format!(
            "Request body is unreadable or larger than {limit} bytes"
        ))
    })?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|_| AppError::Validation("Request body is not valid JSON".to_string()))
}

async fn path_params(parts: &mut Parts) -> HashMap<String, String> {
    match RawPathParams::from_request_parts(parts, &()).await {
        Ok(params) => params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        Err(_) => HashMap::new(),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// A handler wrapped in the pipeline. A `tower::Service`, mountable with
/// `Router::route_service` or `get_service` / `post_service`.
#[derive(Clone)]
pub struct Endpoint {
    pipeline: Pipeline,
    options: Arc<MiddlewareOptions>,
    handler: Arc<dyn Handler>,
}

impl Endpoint {
    pub fn options(&self) -> &MiddlewareOptions {
        &self.options
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Service<Request> for Endpoint {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let options = Arc::clone(&self.options);
        let handler = Arc::clone(&self.handler);

        Box::pin(async move { Ok(pipeline.handle(&options, handler, request).await) })
    }
}

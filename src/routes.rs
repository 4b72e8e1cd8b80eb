//! Application routing.
//!
//! Every route is a pipeline [`Endpoint`](crate::pipeline::Endpoint), a
//! `tower::Service` mounted with a method filter (`get_service`,
//! `post_service`); the per-route preset decides which pipeline stages are
//! active. Other methods get axum's 405.
//!
//! # Routes
//!
//! | Route                 | Preset          | Schema                   |
//! |-----------------------|-----------------|--------------------------|
//! | `GET /health`         | public          |                          |
//! | `POST /v1/analyze`    | protected       | body: `AnalyzeRequest`   |
//! | `GET /v1/insights`    | elevated (pro)  | query: `InsightsQuery`   |
//! | `GET /internal/stats` | internal        |                          |
//!
//! # Router Layers (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Body size limit │
//! └────────┬─────────┘
//!          ▼
//!      Pipeline → Handler
//! ```

use std::future::Future;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get_service, post_service};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::AppResult;
use crate::handlers;
use crate::models::{AnalyzeRequest, InsightsQuery, Plan};
use crate::pipeline::{Endpoint, HandlerContext, MiddlewareOptions};
use crate::state::AppState;
use crate::validation::schema;

/// Build the application router with all routes and layers configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;
    let cors = build_cors_layer(&config.cors_allowed_origins);

    let router = Router::new()
        .route(
            "/health",
            get_service(mount(&state, MiddlewareOptions::public(), handlers::health_check)),
        )
        .route(
            "/v1/analyze",
            post_service(mount(
                &state,
                MiddlewareOptions::protected().with_body_schema(schema::<AnalyzeRequest>()),
                handlers::analyze,
            )),
        )
        .route(
            "/v1/insights",
            get_service(mount(
                &state,
                MiddlewareOptions::elevated(Plan::Pro).with_query_schema(schema::<InsightsQuery>()),
                handlers::insights,
            )),
        )
        .route(
            "/internal/stats",
            get_service(mount(&state, MiddlewareOptions::internal(), handlers::stats)),
        );

    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );

    router
        .layer(DefaultBodyLimit::max(config.max_request_body_size))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Wrap a state-taking handler in a pipeline endpoint.
fn mount<F, Fut, T>(state: &AppState, options: MiddlewareOptions, handler: F) -> Endpoint
where
    F: Fn(AppState, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<T>> + Send + 'static,
    T: Serialize,
{
    let captured = state.clone();
    state
        .pipeline
        .endpoint(options, move |ctx| handler(captured.clone(), ctx))
}

/// Build CORS layer from configuration.
///
/// # Arguments
///
/// * `allowed_origins` - List of allowed origins, or `["*"]` for any origin
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

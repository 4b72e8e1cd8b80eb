//! # Request Pipeline
//!
//! Request-processing core for an Axum service, featuring:
//!
//! - **Ambient Context**: per-request identity, deadline, attributes and
//!   spans reachable from any code running on behalf of the request
//! - **Middleware Pipeline**: rate limit → identity → auth → plan →
//!   validation → handler (with timeout) → response envelope
//! - **Rate Limiting**: fixed-window counters per key
//! - **Request Coalescing**: identical concurrent operations share one
//!   execution, results are cached with a TTL
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Router layers (Trace → CORS → Body limit)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline endpoint per route (preset + schema + handler)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, analyze, insights, internal stats)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TextAnalyzer → RequestCoalescer (LRU + in-flight registry) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use request_pipeline::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state.clone());
//!
//!     // Start the server...
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! Bearer identities and the internal secret:
//! ```bash
//! API_TOKENS=tok-1:alice:pro,tok-2:bob:free INTERNAL_API_SECRET=s3cret cargo run
//! ```

pub mod clock;
pub mod coalescer;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod redact;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use coalescer::{CoalesceKey, RequestCoalescer};
pub use config::Config;
pub use context::RequestContext;
pub use error::{AppError, AppResult};
pub use pipeline::{HandlerContext, MiddlewareOptions, Pipeline};
pub use routes::build_router;
pub use state::AppState;

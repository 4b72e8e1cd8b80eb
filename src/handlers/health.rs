//! Liveness endpoint.
//!
//! `GET /health` runs behind the public preset: no identity required, IP
//! rate limited.

use tracing::instrument;

use crate::error::AppResult;
use crate::models::HealthResponse;
use crate::pipeline::HandlerContext;
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "success": true,
///   "data": { "status": "healthy", "version": "0.1.0", "uptime_seconds": 42 },
///   "meta": { "requestId": "...", "timestamp": "...", "duration": 0 }
/// }
/// ```
#[instrument(skip_all)]
pub async fn health_check(state: AppState, _ctx: HandlerContext) -> AppResult<HealthResponse> {
    let status = if state.is_shut_down() {
        "shutting_down"
    } else {
        "healthy"
    };

    Ok(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
    })
}

use tracing::instrument;

use crate::error::AppResult;
use crate::models::StatsResponse;
use crate::pipeline::HandlerContext;
use crate::state::AppState;

/// `GET /internal/stats`: rate-limit and coalescer counters.
#[instrument(skip_all)]
pub async fn stats(state: AppState, _ctx: HandlerContext) -> AppResult<StatsResponse> {
    Ok(state.stats())
}

use tracing::instrument;

use crate::error::{AppError, AppResult};
use crate::models::{InsightsQuery, InsightsResponse};
use crate::pipeline::HandlerContext;
use crate::state::AppState;

const DEFAULT_METRIC: &str = "executions";

/// `GET /v1/insights?days=N&metric=M`: usage figures for plan holders.
///
/// Known metrics: `executions`, `cache_hits`, `joins`, `hit_ratio`. The
/// figure is the process-wide counter averaged over `days`, except
/// `hit_ratio` which is a plain ratio.
#[instrument(skip_all)]
pub async fn insights(state: AppState, ctx: HandlerContext) -> AppResult<InsightsResponse> {
    let identity = ctx.require_identity()?.clone();
    let query: InsightsQuery = ctx.query_as()?;
    let metric = query.metric.as_deref().unwrap_or(DEFAULT_METRIC);
    let stats = state.analyzer.coalescer().stats();
    let days = f64::from(query.days);

    let value = match metric {
        "executions" => stats.executions as f64 / days,
        "cache_hits" => stats.hits as f64 / days,
        "joins" => stats.joins as f64 / days,
        "hit_ratio" => {
            let served = stats.hits + stats.joins + stats.executions;
            if served == 0 {
                0.0
            } else {
                (stats.hits + stats.joins) as f64 / served as f64
            }
        }
        other => return Err(AppError::NotFound(format!("Unknown metric '{other}'"))),
    };

    Ok(InsightsResponse {
        user_id: identity.user_id,
        plan: identity.plan,
        metric: metric.to_string(),
        days: query.days,
        value,
    })
}

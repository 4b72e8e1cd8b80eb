use tracing::{info, instrument};

use crate::context;
use crate::error::AppResult;
use crate::models::{AnalysisResult, AnalyzeRequest};
use crate::pipeline::HandlerContext;
use crate::state::AppState;

/// `POST /v1/analyze`: run the metered analyzer, coalescing identical
/// requests.
#[instrument(skip_all)]
pub async fn analyze(state: AppState, ctx: HandlerContext) -> AppResult<AnalysisResult> {
    let request: AnalyzeRequest = ctx.body_as()?;
    let user_id = ctx.identity.as_ref().map(|identity| identity.user_id.as_str());

    let result = state
        .analyzer
        .analyze(&request, user_id, &ctx.cancellation)
        .await?;

    context::set_attribute("analysis.cached", result.cached)?;
    info!(
        word_count = result.word_count,
        cached = result.cached,
        "Analysis completed"
    );

    Ok(result)
}

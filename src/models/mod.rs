mod api;
mod identity;

pub use api::{
    AnalysisResult, AnalyzeRequest, Envelope, ErrorBody, HealthResponse, InsightsQuery,
    InsightsResponse, ResponseMeta, StatsResponse,
};
pub use identity::{Identity, Plan};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::error::AppError;
use crate::models::Plan;

/// Response metadata attached to every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub request_id: String,
    /// ISO-8601 timestamp of when the response was produced
    pub timestamp: String,
    /// Elapsed milliseconds since the request entered the pipeline
    pub duration: u64,
}

/// Error body inside a failed envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.public_message(),
            details: err.details(),
        }
    }
}

/// Wire shape of every pipeline response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub meta: ResponseMeta,
}

impl Envelope {
    pub fn success(data: Value, meta: ResponseMeta) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta,
        }
    }

    pub fn failure(err: &AppError, meta: ResponseMeta) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody::from(err)),
            meta,
        }
    }
}

/// Request body for the text analysis endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AnalyzeRequest {
    /// Text to analyze
    #[validate(length(min = 3, max = 10_000, message = "must be between 3 and 10000 characters"))]
    pub text: String,
    /// Analysis category, affects the result
    #[serde(default)]
    #[validate(length(max = 64, message = "must be at most 64 characters"))]
    pub category: Option<String>,
    /// Sampling temperature, affects the result
    #[serde(default)]
    #[validate(range(min = 0.0, max = 2.0, message = "must be between 0 and 2"))]
    pub temperature: Option<f32>,
    /// Token ceiling, affects the result
    #[serde(default)]
    #[validate(range(min = 1, max = 8192, message = "must be between 1 and 8192"))]
    pub max_tokens: Option<u32>,
    /// Client-side hint only; never part of the coalescing key
    #[serde(default)]
    pub client_timeout_ms: Option<u64>,
}

/// Result of analysing a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub provider: String,
    pub word_count: usize,
    pub sentiment: f32,
    pub summary: String,
    /// Whether this result was served without running the provider
    pub cached: bool,
}

/// Query parameters for the insights endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InsightsQuery {
    #[validate(range(min = 1, max = 90, message = "must be between 1 and 90"))]
    pub days: u32,
    #[serde(default)]
    #[validate(length(min = 1, max = 64, message = "must be between 1 and 64 characters"))]
    pub metric: Option<String>,
}

/// Aggregate usage figure for the insights endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightsResponse {
    pub user_id: String,
    pub plan: Plan,
    pub metric: String,
    pub days: u32,
    pub value: f64,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Operational snapshot for the internal stats endpoint.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub rate_limit_keys: usize,
    pub cache_entries: usize,
    pub cache_capacity: usize,
    pub in_flight: usize,
    pub cache_hits: u64,
    pub coalesced_joins: u64,
    pub executions: u64,
    pub evictions: u64,
    pub uptime_seconds: u64,
}

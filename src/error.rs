use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::context::ContextError;

/// A single field-level violation reported by schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    /// Dotted path to the offending field (e.g. `items[0].name`).
    pub path: String,
    /// Human readable description of the violated constraint.
    pub message: String,
}

impl FieldViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Classification of every fault the pipeline can emit.
///
/// The kind decides the wire `code` and the transport status; several
/// [`AppError`] variants can share one kind (timeouts are `Internal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    SchemaValidation,
    Unauthenticated,
    NotFound,
    RateLimit,
    Internal,
}

impl ErrorKind {
    /// Stable error code surfaced in the response envelope.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "ERR_VALIDATION",
            ErrorKind::SchemaValidation => "ERR_SCHEMA_VALIDATION",
            ErrorKind::Unauthenticated => "ERR_UNAUTHENTICATED",
            ErrorKind::NotFound => "ERR_NOT_FOUND",
            ErrorKind::RateLimit => "ERR_RATE_LIMIT",
            ErrorKind::Internal => "ERR_INTERNAL",
        }
    }

    /// Transport status for this kind of fault.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation | ErrorKind::SchemaValidation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Application-wide error type.
///
/// Expected business outcomes (bad input, missing identity, unknown
/// resources) are returned by handlers as values of this type. Anything the
/// pipeline catches at its boundary (panics, timeouts, lost context) is
/// folded into the `Internal` kind.
///
/// The type is `Clone` so a single coalesced failure can be delivered to
/// every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Request failed schema validation ({} violation(s))", .0.len())]
    SchemaValidation(Vec<FieldViolation>),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Handler timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::SchemaValidation(_) => ErrorKind::SchemaValidation,
            AppError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::RateLimited { .. } => ErrorKind::RateLimit,
            AppError::Internal(_) | AppError::Timeout { .. } | AppError::ConfigError(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Operational faults are expected client-side failures; the rest are
    /// alerting-grade.
    pub fn is_operational(&self) -> bool {
        self.kind() != ErrorKind::Internal
    }

    /// Seconds the caller should wait before retrying, only for rate limits.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Message safe to show to clients.
    ///
    /// Internal details stay in the server log.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation(msg)
            | AppError::Unauthenticated(msg)
            | AppError::NotFound(msg) => msg.clone(),
            AppError::SchemaValidation(_) => "Request validation failed".to_string(),
            AppError::RateLimited { .. } => "Rate limit exceeded. Please retry later.".to_string(),
            AppError::Timeout { .. } => "Request timed out".to_string(),
            AppError::Internal(_) => {
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string()
            }
            AppError::ConfigError(_) => "Service configuration error. Please contact support."
                .to_string(),
        }
    }

    /// Structured details for the error body, when the kind carries any.
    pub fn details(&self) -> Option<Value> {
        match self {
            AppError::SchemaValidation(violations) => Some(json!(violations)),
            AppError::RateLimited { retry_after_secs } => {
                Some(json!({ "retryAfter": retry_after_secs }))
            }
            AppError::Timeout { timeout_ms } => {
                Some(json!({ "reason": "timeout", "timeoutMs": timeout_ms }))
            }
            _ => None,
        }
    }
}

impl From<ContextError> for AppError {
    fn from(err: ContextError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Reduce a serde error to a message that names the field but not our types.
pub(crate) fn sanitize_serde_error(e: &serde_json::Error) -> FieldViolation {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(field) = backticked(&msg)
    {
        return FieldViolation::new(field, "is required");
    }

    if msg.contains("unknown field")
        && let Some(field) = backticked(&msg)
    {
        return FieldViolation::new(field, "is not allowed");
    }

    if msg.contains("invalid type") || msg.contains("invalid value") {
        return FieldViolation::new("", "has an invalid data type");
    }

    FieldViolation::new("", "has an invalid format")
}

fn backticked(msg: &str) -> Option<&str> {
    let start = msg.find('`')?;
    let rest = msg.get(start + 1..)?;
    let end = rest.find('`')?;
    rest.get(..end)
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::SchemaValidation(vec![]).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unauthenticated("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::RateLimited {
                retry_after_secs: 3
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Timeout { timeout_ms: 10 }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_timeout_is_internal_kind() {
        let err = AppError::Timeout { timeout_ms: 500 };
        assert_eq!(err.code(), "ERR_INTERNAL");
        assert!(!err.is_operational());
        assert_eq!(err.details().unwrap()["reason"], "timeout");
    }

    #[test]
    fn test_internal_message_is_sanitized() {
        let err = AppError::Internal("db password=hunter2 leaked".into());
        assert!(!err.public_message().contains("hunter2"));
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        assert_eq!(
            AppError::RateLimited {
                retry_after_secs: 7
            }
            .retry_after(),
            Some(7)
        );
        assert_eq!(AppError::NotFound("x".into()).retry_after(), None);
    }

    #[test]
    fn test_sanitize_missing_field() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Probe {
            name: String,
        }
        let err = serde_json::from_str::<Probe>("{}").unwrap_err();
        let violation = sanitize_serde_error(&err);
        assert_eq!(violation.path, "name");
        assert_eq!(violation.message, "is required");
    }
}

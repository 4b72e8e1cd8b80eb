//! Handler contract.
//!
//! A handler is any `Fn(HandlerContext) -> impl Future<Output = AppResult<T>>`
//! where `T: Serialize`. Expected business failures are returned as
//! `Err(AppError)`; a panic is caught by the pipeline and reported as an
//! internal fault.

use std::collections::HashMap;
use std::future::Future;

use axum::http::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::RequestContext;
use crate::error::{AppError, AppResult, sanitize_serde_error};
use crate::middleware::BoxFuture;
use crate::models::Identity;

/// Everything a handler receives from the pipeline.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Snapshot of the request context at invocation time. The same context
    /// is also ambient (see [`crate::context::current`]).
    pub request: RequestContext,
    pub identity: Option<Identity>,
    /// Validated body (mutating verbs only).
    pub body: Option<Value>,
    /// Validated query string, when the route declares a query schema.
    pub query: Option<Value>,
    pub headers: HeaderMap,
    pub path_params: HashMap<String, String>,
    /// Cancelled when the pipeline stops waiting for the handler.
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    /// Deserialize the validated body.
    ///
    /// # Errors
    ///
    /// `Validation` when there is no body, `SchemaValidation` when it does not
    /// fit `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> AppResult<T> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| AppError::Validation("Request body is required".to_string()))?;
        serde_json::from_value(body).map_err(|e| schema_error(&e))
    }

    /// Deserialize the validated query; an absent query reads as `{}`.
    pub fn query_as<T: DeserializeOwned>(&self) -> AppResult<T> {
        let query = self
            .query
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        serde_json::from_value(query).map_err(|e| schema_error(&e))
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// The resolved identity, or `Unauthenticated`.
    pub fn require_identity(&self) -> AppResult<&Identity> {
        self.identity
            .as_ref()
            .ok_or_else(|| AppError::Unauthenticated("Authentication required".to_string()))
    }
}

fn schema_error(e: &serde_json::Error) -> AppError {
    AppError::SchemaValidation(vec![sanitize_serde_error(e)])
}

/// Business logic wrapped by the pipeline.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: HandlerContext) -> BoxFuture<'static, AppResult<Value>>;
}

impl<F, Fut, T> Handler for F
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<T>> + Send + 'static,
    T: Serialize,
{
    fn call(&self, ctx: HandlerContext) -> BoxFuture<'static, AppResult<Value>> {
        let fut = self(ctx);
        Box::pin(async move {
            let data = fut.await?;
            serde_json::to_value(data)
                .map_err(|e| AppError::Internal(format!("Failed to serialize response: {e}")))
        })
    }
}

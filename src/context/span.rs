use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{Instrument, debug, info_span};

use super::{CURRENT, ContextError, RequestContext};
use crate::clock;

/// Outcome recorded for a finished span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanStatus::Ok => write!(f, "ok"),
            SpanStatus::Error => write!(f, "error"),
        }
    }
}

/// A finalized span.
#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub name: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub status: SpanStatus,
    pub duration: Duration,
}

/// Append-only list of finished spans shared by every fork of one request.
#[derive(Debug, Clone, Default)]
pub struct SpanLog {
    records: Arc<Mutex<Vec<SpanRecord>>>,
}

impl SpanLog {
    fn push(&self, record: SpanRecord) {
        self.records.lock().push(record);
    }

    pub fn records(&self) -> Vec<SpanRecord> {
        self.records.lock().clone()
    }

    pub fn find(&self, name: &str) -> Option<SpanRecord> {
        self.records.lock().iter().find(|r| r.name == name).cloned()
    }
}

/// Finalizes a span when dropped.
///
/// If the wrapped future never reported an outcome (it panicked or was
/// dropped mid-flight) the span is recorded as `error`.
struct SpanGuard {
    name: String,
    span_id: String,
    parent_span_id: Option<String>,
    log: SpanLog,
    started: tokio::time::Instant,
    status: Option<SpanStatus>,
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let status = self.status.unwrap_or(SpanStatus::Error);
        let duration = clock::now().saturating_duration_since(self.started);

        debug!(
            span = %self.name,
            span_id = %self.span_id,
            status = %status,
            duration_ms = duration.as_millis() as u64,
            "Span finished"
        );

        self.log.push(SpanRecord {
            name: std::mem::take(&mut self.name),
            span_id: std::mem::take(&mut self.span_id),
            parent_span_id: self.parent_span_id.take(),
            status,
            duration,
        });
    }
}

/// Run `fut` inside a child span of the ambient context.
///
/// The child context is ambient for the extent of `fut`. The span is
/// recorded as `error` iff `fut` resolves to `Err` (or never resolves),
/// and its duration is recorded in every case.
///
/// # Errors
///
/// Fails with [`ContextError::Missing`] (converted into `E`) when called
/// outside a bound request scope.
pub async fn with_span<F, T, E>(name: &str, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<ContextError>,
{
    let child: RequestContext = CURRENT
        .try_with(|c| c.borrow().fork())
        .map_err(|_| E::from(ContextError::Missing))?;

    let mut guard = SpanGuard {
        name: name.to_string(),
        span_id: child.span_id.clone(),
        parent_span_id: child.parent_span_id.clone(),
        log: child.spans().clone(),
        started: clock::now(),
        status: None,
    };

    let tracing_span = info_span!(
        "span",
        name = %name,
        span_id = %child.span_id,
        parent_span_id = child.parent_span_id.as_deref().unwrap_or_default(),
    );

    let result = CURRENT
        .scope(std::cell::RefCell::new(child), fut)
        .instrument(tracing_span)
        .await;

    guard.status = Some(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::Error
    });

    result
}

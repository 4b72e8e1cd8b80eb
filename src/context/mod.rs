//! Request-scoped ambient context.
//!
//! A [`RequestContext`] is bound to the dynamic extent of a future with
//! [`run`]. While that future executes, [`current`] (and the other free
//! functions of this module) observe the bound context from anywhere in the
//! call tree without the context being threaded through as a parameter.
//!
//! # Isolation
//!
//! The binding uses tokio task-local storage. Tokio installs the value each
//! time the scoped future is polled and restores the previous value when the
//! poll returns, so the binding follows the future across every `.await`
//! rather than the thread it happens to run on:
//!
//! ```text
//! poll(A) ─ bind ctx_A ─ ... ─ Pending ─ restore
//! poll(B) ─ bind ctx_B ─ ... ─ Pending ─ restore
//! poll(A) ─ bind ctx_A ─ ... ─ Ready   ─ restore
//! ```
//!
//! Two interleaved requests never observe each other's identifiers or
//! attributes.
//!
//! # Spans
//!
//! [`with_span`] forks the ambient context for a named sub-scope. The fork
//! gets a fresh span id, records the enclosing span as its parent and works
//! on a copy of the attribute map. On exit the span's status and duration are
//! appended to the trace-wide [`SpanLog`].

mod span;

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock;
use crate::models::Plan;

pub use span::{SpanLog, SpanRecord, SpanStatus, with_span};

tokio::task_local! {
    static CURRENT: RefCell<RequestContext>;
}

/// Errors raised when ambient context is used incorrectly.
///
/// These indicate programmer errors, not business failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("request context missing: called outside of a bound request scope")]
    Missing,
}

/// Inputs for [`RequestContext::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub method: String,
    pub path: String,
    pub user_ip: String,
    pub user_agent: Option<String>,
    /// Upstream trace id; defaults to the new request id.
    pub trace_id: Option<String>,
    /// Budget for the whole request; sets the deadline when present.
    pub timeout: Option<Duration>,
}

/// Ambient state of one inbound call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub start_time: Instant,
    deadline: Option<Instant>,
    pub user_id: Option<String>,
    pub user_plan: Option<Plan>,
    pub user_ip: String,
    pub method: String,
    pub path: String,
    pub user_agent: Option<String>,
    pub attributes: HashMap<String, Value>,
    spans: SpanLog,
}

impl RequestContext {
    /// Create a fresh context for an inbound call.
    pub fn create(options: CreateOptions) -> Self {
        let request_id = Uuid::new_v4().to_string();
        let start_time = clock::now();
        let trace_id = options
            .trace_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| request_id.clone());

        Self {
            trace_id,
            span_id: new_span_id(),
            parent_span_id: None,
            start_time,
            deadline: options.timeout.map(|t| start_time + t),
            user_id: None,
            user_plan: None,
            user_ip: options.user_ip,
            method: options.method,
            path: options.path,
            user_agent: options.user_agent,
            attributes: HashMap::new(),
            spans: SpanLog::default(),
            request_id,
        }
    }

    /// Fork a child context for a span nested under this one.
    ///
    /// The attribute map is copied; the span log is shared.
    pub fn fork(&self) -> Self {
        Self {
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            attributes: self.attributes.clone(),
            ..self.clone()
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Tighten the deadline. A later deadline than the current one is ignored.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
    }

    pub fn elapsed(&self) -> Duration {
        clock::now().saturating_duration_since(self.start_time)
    }

    /// Budget left until the deadline, `Duration::MAX` when none is set.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(clock::now()),
            None => Duration::MAX,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| clock::now() >= d)
    }

    pub fn spans(&self) -> &SpanLog {
        &self.spans
    }
}

fn new_span_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Bind `ctx` as the ambient context for the whole of `fut`.
///
/// The previous binding (or none) is restored when `fut` completes, fails
/// or is dropped.
pub async fn run<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(RefCell::new(ctx), fut).await
}

/// Snapshot of the ambient context, or `None` outside any scope.
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(|c| c.borrow().clone()).ok()
}

/// Snapshot of the ambient context, failing outside any scope.
pub fn require() -> Result<RequestContext, ContextError> {
    current().ok_or(ContextError::Missing)
}

/// Mutate the ambient context in place.
pub fn update<R>(f: impl FnOnce(&mut RequestContext) -> R) -> Result<R, ContextError> {
    CURRENT
        .try_with(|c| f(&mut c.borrow_mut()))
        .map_err(|_| ContextError::Missing)
}

pub fn request_id() -> Result<String, ContextError> {
    CURRENT
        .try_with(|c| c.borrow().request_id.clone())
        .map_err(|_| ContextError::Missing)
}

pub fn set_attribute(key: impl Into<String>, value: impl Into<Value>) -> Result<(), ContextError> {
    update(|c| {
        c.attributes.insert(key.into(), value.into());
    })
}

pub fn attribute(key: &str) -> Result<Option<Value>, ContextError> {
    CURRENT
        .try_with(|c| c.borrow().attributes.get(key).cloned())
        .map_err(|_| ContextError::Missing)
}

pub fn elapsed() -> Result<Duration, ContextError> {
    CURRENT
        .try_with(|c| c.borrow().elapsed())
        .map_err(|_| ContextError::Missing)
}

pub fn remaining() -> Result<Duration, ContextError> {
    CURRENT
        .try_with(|c| c.borrow().remaining())
        .map_err(|_| ContextError::Missing)
}

pub fn is_deadline_exceeded() -> Result<bool, ContextError> {
    CURRENT
        .try_with(|c| c.borrow().is_deadline_exceeded())
        .map_err(|_| ContextError::Missing)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(path: &str) -> RequestContext {
        RequestContext::create(CreateOptions {
            method: "GET".into(),
            path: path.into(),
            user_ip: "127.0.0.1".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_create_defaults_trace_to_request_id() {
        let c = ctx("/a");
        assert_eq!(c.trace_id, c.request_id);
        assert!(Uuid::parse_str(&c.request_id).is_ok());
        assert_eq!(c.span_id.len(), 16);
        assert!(c.deadline().is_none());
        assert_eq!(c.remaining(), Duration::MAX);
    }

    #[test]
    fn test_create_keeps_upstream_trace() {
        let c = RequestContext::create(CreateOptions {
            trace_id: Some("upstream-trace".into()),
            ..Default::default()
        });
        assert_eq!(c.trace_id, "upstream-trace");
        assert_ne!(c.request_id, "upstream-trace");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_from_timeout() {
        let c = RequestContext::create(CreateOptions {
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        assert_eq!(c.deadline(), Some(c.start_time + Duration::from_secs(5)));
        assert!(!c.is_deadline_exceeded());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(c.remaining(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(c.is_deadline_exceeded());
    }

    #[test]
    fn test_deadline_never_extended() {
        let mut c = RequestContext::create(CreateOptions {
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let original = c.deadline().unwrap();
        c.set_deadline(original + Duration::from_secs(60));
        assert_eq!(c.deadline(), Some(original));

        c.set_deadline(original - Duration::from_secs(1));
        assert_eq!(c.deadline(), Some(original - Duration::from_secs(1)));
    }

    #[test]
    fn test_fork_links_parent_and_copies_attributes() {
        let mut parent = ctx("/a");
        parent.attributes.insert("k".into(), json!(1));
        let child = parent.fork();

        assert_eq!(child.parent_span_id.as_deref(), Some(parent.span_id.as_str()));
        assert_ne!(child.span_id, parent.span_id);
        assert_eq!(child.request_id, parent.request_id);
        assert_eq!(child.attributes.get("k"), Some(&json!(1)));
    }

    #[test]
    fn test_current_outside_scope() {
        assert!(current().is_none());
        assert_eq!(require().unwrap_err(), ContextError::Missing);
        assert_eq!(set_attribute("a", 1).unwrap_err(), ContextError::Missing);
    }

    #[tokio::test]
    async fn test_run_binds_and_restores() {
        let c = ctx("/bound");
        let id = c.request_id.clone();

        let seen = run(c, async {
            tokio::task::yield_now().await;
            request_id().unwrap()
        })
        .await;

        assert_eq!(seen, id);
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_nested_run_restores_outer() {
        let outer = ctx("/outer");
        let inner = ctx("/inner");
        let outer_id = outer.request_id.clone();
        let inner_id = inner.request_id.clone();

        run(outer, async move {
            let seen_inner = run(inner, async { request_id().unwrap() }).await;
            assert_eq!(seen_inner, inner_id);
            assert_eq!(request_id().unwrap(), outer_id);
        })
        .await;
    }

    #[tokio::test]
    async fn test_interleaved_scopes_are_isolated() {
        let a = ctx("/a");
        let b = ctx("/b");
        let (a_id, b_id) = (a.request_id.clone(), b.request_id.clone());

        let task = |c: RequestContext, tag: &'static str| async move {
            run(c, async move {
                let mut seen = Vec::new();
                for i in 0..5 {
                    set_attribute(format!("{tag}-{i}"), i).unwrap();
                    tokio::task::yield_now().await;
                    let snapshot = current().unwrap();
                    seen.push((snapshot.request_id.clone(), snapshot.attributes.len()));
                    assert!(
                        snapshot.attributes.keys().all(|k| k.starts_with(tag)),
                        "foreign attribute leaked into {tag}"
                    );
                }
                seen
            })
            .await
        };

        let (seen_a, seen_b) = tokio::join!(task(a, "a"), task(b, "b"));

        assert!(seen_a.iter().all(|(id, _)| id == &a_id));
        assert!(seen_b.iter().all(|(id, _)| id == &b_id));
        assert_eq!(seen_a.last().unwrap().1, 5);
        assert_eq!(seen_b.last().unwrap().1, 5);
    }

    #[tokio::test]
    async fn test_run_restores_after_panic_free_failure() {
        let c = ctx("/fail");
        let result: Result<(), &str> = run(c, async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(current().is_none());
    }
}

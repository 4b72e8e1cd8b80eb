//! Prometheus metrics for application observability.
//!
//! Metrics are exposed by a dedicated HTTP listener (see `METRICS_PORT`).
//! Every `record_*` function is safe to call before, or without,
//! [`init_metrics`]; the `metrics` facade drops values when no recorder is
//! installed.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `pipeline_requests_total` - Requests handled (labels: route, method, status)
//! - `pipeline_rate_limit_denied_total` - Calls rejected by the fixed-window limiter
//! - `pipeline_auth_failures_total` - Authentication failures (label: reason)
//! - `coalescer_cache_hits_total` - Calls served from the coalescer cache
//! - `coalescer_joins_total` - Calls that joined an in-flight execution
//! - `coalescer_executions_total` - Underlying executions started
//! - `coalescer_evictions_total` - LRU evictions
//! - `coalescer_stale_resolutions_total` - In-flight entries force-resolved by the sweep
//!
//! ## Histograms
//! - `pipeline_request_duration_seconds` - Request duration (labels: route, method, status)
//!
//! ## Gauges
//! - `coalescer_cache_entries` - Current cache size
//! - `coalescer_in_flight` - Current in-flight executions
//!
//! # Usage
//!
//! ```rust,ignore
//! use request_pipeline::metrics::{init_metrics, record_request};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_request("/v1/analyze", "POST", 200, 0.045);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "pipeline_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "pipeline_request_duration_seconds";
    pub const RATE_LIMIT_DENIED_TOTAL: &str = "pipeline_rate_limit_denied_total";
    pub const AUTH_FAILURES_TOTAL: &str = "pipeline_auth_failures_total";
    pub const COALESCER_CACHE_HITS_TOTAL: &str = "coalescer_cache_hits_total";
    pub const COALESCER_JOINS_TOTAL: &str = "coalescer_joins_total";
    pub const COALESCER_EXECUTIONS_TOTAL: &str = "coalescer_executions_total";
    pub const COALESCER_EVICTIONS_TOTAL: &str = "coalescer_evictions_total";
    pub const COALESCER_STALE_TOTAL: &str = "coalescer_stale_resolutions_total";
    pub const COALESCER_CACHE_ENTRIES: &str = "coalescer_cache_entries";
    pub const COALESCER_IN_FLIGHT: &str = "coalescer_in_flight";
}

/// Install the Prometheus exporter and describe every metric.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Total number of requests handled");
    describe_counter!(
        names::RATE_LIMIT_DENIED_TOTAL,
        "Total number of calls rejected by the rate limiter"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of authentication failures"
    );
    describe_counter!(
        names::COALESCER_CACHE_HITS_TOTAL,
        "Calls answered from the coalescer cache"
    );
    describe_counter!(
        names::COALESCER_JOINS_TOTAL,
        "Calls that joined an in-flight execution"
    );
    describe_counter!(
        names::COALESCER_EXECUTIONS_TOTAL,
        "Underlying executions started by the coalescer"
    );
    describe_counter!(
        names::COALESCER_EVICTIONS_TOTAL,
        "Least-recently-used cache evictions"
    );
    describe_counter!(
        names::COALESCER_STALE_TOTAL,
        "In-flight executions force-resolved after exceeding the maximum age"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Request duration in seconds"
    );

    describe_gauge!(names::COALESCER_CACHE_ENTRIES, "Entries in the coalescer cache");
    describe_gauge!(names::COALESCER_IN_FLIGHT, "Executions currently in flight");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Record one completed request.
pub fn record_request(route: &str, method: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    counter!(
        names::REQUESTS_TOTAL,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.clone()
    )
    .increment(1);
    histogram!(
        names::REQUEST_DURATION_SECONDS,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status
    )
    .record(duration_secs);
}

pub fn record_rate_limit_denied() {
    counter!(names::RATE_LIMIT_DENIED_TOTAL).increment(1);
}

/// Record an authentication failure; `reason` is a short static label.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

// =============================================================================
// Coalescer
// =============================================================================

pub fn record_cache_hit() {
    counter!(names::COALESCER_CACHE_HITS_TOTAL).increment(1);
}

pub fn record_coalesced_join() {
    counter!(names::COALESCER_JOINS_TOTAL).increment(1);
}

pub fn record_execution() {
    counter!(names::COALESCER_EXECUTIONS_TOTAL).increment(1);
}

pub fn record_eviction() {
    counter!(names::COALESCER_EVICTIONS_TOTAL).increment(1);
}

pub fn record_stale_resolution(count: u64) {
    counter!(names::COALESCER_STALE_TOTAL).increment(count);
}

/// Update the cache-size and in-flight gauges.
pub fn set_coalescer_sizes(cache_entries: usize, in_flight: usize) {
    gauge!(names::COALESCER_CACHE_ENTRIES).set(cache_entries as f64);
    gauge!(names::COALESCER_IN_FLIGHT).set(in_flight as f64);
}

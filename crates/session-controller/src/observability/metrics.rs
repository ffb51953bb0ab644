//! Metrics definitions for the Session Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix for Session Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code:
//! - `operation`: engine operation names (enable_channel, admit_temp_host, ...)
//! - `status`: success, error
//! - `error_type`: `ScError::error_type_label()` values
//! - `stage`: recording call (acquire, start, stop, query)
//! - `effect`: side-effect kind (schedule, publish, notify, stop_recording)
//! - `endpoint`: axum route template, or `/other` for unmatched paths

use metrics::{counter, histogram};
use std::time::Duration;

/// Record an HTTP request.
///
/// Metric: `sc_http_requests_total`, `sc_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status` / `status_code`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let status = categorize_status_code(status_code);

    histogram!("sc_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("sc_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Record completion of an engine operation.
///
/// Metric: `sc_operations_total`, `sc_operation_duration_seconds`
/// Labels: `operation`, `status`, `error_type`
pub fn record_operation(operation: &'static str, error_type: Option<&'static str>, duration: Duration) {
    let status = if error_type.is_some() { "error" } else { "success" };

    histogram!("sc_operation_duration_seconds",
        "operation" => operation,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("sc_operations_total",
        "operation" => operation,
        "status" => status,
        "error_type" => error_type.unwrap_or("none")
    )
    .increment(1);
}

/// Record a unit of work that lost a version check.
///
/// Metric: `sc_commit_conflicts_total`
/// Labels: `operation`
pub fn record_commit_conflict(operation: &'static str) {
    counter!("sc_commit_conflicts_total", "operation" => operation).increment(1);
}

/// Record a failed call to the recording service.
///
/// Metric: `sc_recording_failures_total`
/// Labels: `stage`
pub fn record_recording_failure(stage: &'static str) {
    counter!("sc_recording_failures_total", "stage" => stage).increment(1);
}

/// Record a post-commit side effect that failed and was dropped.
///
/// Metric: `sc_side_effect_failures_total`
/// Labels: `effect`
pub fn record_side_effect_failure(effect: &'static str) {
    counter!("sc_side_effect_failures_total", "effect" => effect).increment(1);
}

/// Record the current mailbox depth of an actor.
///
/// Metric: `sc_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_mailbox_depth(actor_type: &'static str, depth: usize) {
    metrics::gauge!("sc_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

/// Record the number of live host actors.
///
/// Metric: `sc_host_actors`
pub fn set_host_actor_count(count: usize) {
    metrics::gauge!("sc_host_actors").set(count as f64);
}

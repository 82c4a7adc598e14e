//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Protocol exchanges by command and status
//! - Transport retries and throttling
//! - Cursor invalidations and persistence
//! - Retry-poll attempts and outcomes
//! - Teardown reconciliation results
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `harness_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, attempts)
//!
//! # Usage
//!
//! ```rust,no_run
//! use conformance_harness::metrics;
//! use std::time::Duration;
//!
//! metrics::record_exchange("Sync", "Success", Duration::from_millis(120));
//! metrics::record_poll_outcome("exhausted", 10);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one completed exchange.
pub fn record_exchange(command: &str, status: &str, duration: Duration) {
    counter!(
        "harness_exchanges_total",
        "command" => command.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("harness_exchange_duration_seconds", "command" => command.to_string())
        .record(duration.as_secs_f64());
}

/// Record an exchange that failed below the protocol layer.
pub fn record_transport_failure(command: &str, retryable: bool) {
    let kind = if retryable { "transient" } else { "permanent" };
    counter!(
        "harness_transport_failures_total",
        "command" => command.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a transport retry.
pub fn record_transport_retry(command: &str) {
    counter!("harness_transport_retries_total", "command" => command.to_string()).increment(1);
}

/// Record time spent waiting on the request rate limiter.
pub fn record_throttle_wait(duration: Duration) {
    histogram!("harness_throttle_wait_seconds").record(duration.as_secs_f64());
}

/// Record a hierarchy handshake.
pub fn record_handshake(owner: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("harness_handshakes_total", "owner" => owner.to_string(), "status" => status).increment(1);
}

/// Record an identity switch.
pub fn record_identity_switch(owner: &str) {
    counter!("harness_identity_switches_total", "owner" => owner.to_string()).increment(1);
}

/// Record a cursor invalidated by a cursor-state status.
pub fn record_cursor_invalidation(owner: &str) {
    counter!("harness_cursor_invalidations_total", "owner" => owner.to_string()).increment(1);
}

/// Record cursor flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize) {
    counter!("harness_cursor_flushes_total").increment(1);
    counter!("harness_cursor_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("harness_cursor_flush_errors_total").increment(errors as u64);
    }
}

/// Record cursor SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn cursor_retries_total(operation: &str) {
    counter!("harness_cursor_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record one poll attempt.
pub fn record_poll_attempt() {
    counter!("harness_poll_attempts_total").increment(1);
}

/// Record how a retry-poll ended.
///
/// `outcome` is one of `satisfied`, `exhausted`, `deadline`, `cancelled`,
/// `error`.
pub fn record_poll_outcome(outcome: &str, attempts: u32) {
    counter!("harness_polls_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("harness_poll_attempts", "outcome" => outcome.to_string()).record(attempts as f64);
}

/// Set the number of artifacts currently registered for teardown.
pub fn set_tracked_artifacts(count: usize) {
    gauge!("harness_tracked_artifacts").set(count as f64);
}

/// Record the terminal state of one reconciled artifact.
pub fn record_artifact_outcome(state: &str) {
    counter!("harness_artifact_outcomes_total", "state" => state.to_string()).increment(1);
}

/// Record an environment restoration at release.
pub fn record_restoration(kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("harness_restorations_total", "kind" => kind.to_string(), "status" => status).increment(1);
}

/// Record a completed scenario teardown.
pub fn record_teardown(scenario: &str, clean: bool, duration: Duration) {
    let status = if clean { "clean" } else { "residue" };
    counter!("harness_teardowns_total", "status" => status).increment(1);
    histogram!("harness_teardown_duration_seconds", "scenario" => scenario.to_string())
        .record(duration.as_secs_f64());
}

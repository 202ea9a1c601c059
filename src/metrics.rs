//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change capture and publishing (master)
//! - Scheduler iterations and errors
//! - Message and row apply outcomes (slave)
//! - Ordering anomalies and already-processed deliveries
//! - Slave session and agent state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use db_replication::metrics;
//! use std::time::Duration;
//!
//! // In the converter after a check
//! metrics::record_changes_captured(42);
//!
//! // In the scheduler loop
//! metrics::record_scheduler_iteration(Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Master side
// =============================================================================

/// Staged rows consumed by one converter check.
pub fn record_changes_captured(count: usize) {
    if count > 0 {
        counter!("replication_changes_captured_total").increment(count as u64);
    }
}

/// A change message handed to the publisher.
pub fn record_message_published(command: &str) {
    counter!("replication_messages_published_total", "command" => command.to_string()).increment(1);
}

/// A message (master) or delivery (slave) flagged as already processed.
pub fn record_already_processed() {
    counter!("replication_already_processed_total").increment(1);
}

/// One scheduler iteration, successful or not.
pub fn record_scheduler_iteration(duration: Duration) {
    counter!("replication_scheduler_iterations_total").increment(1);
    histogram!("replication_scheduler_iteration_seconds").record(duration.as_secs_f64());
}

/// A failed scheduler iteration.
pub fn record_scheduler_error(retryable: bool) {
    let kind = if retryable { "transient" } else { "fatal" };
    counter!("replication_scheduler_errors_total", "kind" => kind).increment(1);
}

// =============================================================================
// Slave side
// =============================================================================

/// A message committed on the destination.
pub fn record_message_applied(command: &str) {
    counter!("replication_messages_applied_total", "command" => command.to_string()).increment(1);
}

/// A message rolled back (or never decoded).
pub fn record_message_failed(command: &str) {
    counter!("replication_messages_failed_total", "command" => command.to_string()).increment(1);
}

/// One INSERT/UPDATE/DELETE row applied.
pub fn record_row_applied(action: &str) {
    counter!("replication_rows_applied_total", "action" => action.to_string()).increment(1);
}

/// An INSERT hit an existing row and was skipped.
pub fn record_duplicate_insert() {
    counter!("replication_duplicate_inserts_total").increment(1);
}

/// A row arrived with a replKey not above the last applied one.
pub fn record_ordering_anomaly() {
    counter!("replication_ordering_anomalies_total").increment(1);
}

/// Slave session state change.
pub fn record_session_transition(from: &str, to: &str) {
    counter!(
        "replication_session_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

// =============================================================================
// High-water store
// =============================================================================

/// Record a debounced flush of dirty replKeys.
pub fn record_state_flush(flushed: usize, errors: usize) {
    counter!("replication_state_flushes_total").increment(1);
    counter!("replication_state_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("replication_state_flush_errors_total").increment(errors as u64);
    }
}

/// Record a state store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn state_store_retries_total(operation: &str) {
    counter!("replication_state_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Agent
// =============================================================================

/// Gauge for agent state.
pub fn set_agent_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_agent_state").set(value);
}

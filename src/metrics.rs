// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Stream copy and tail throughput
//! - Replication lag per stream
//! - Stream state transitions and apply retries
//! - Migration phase transitions
//! - Topology CAS conflicts and blacklist enforcement
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `migration_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use keyspace_migrator::metrics;
//! use std::time::Duration;
//!
//! // In the tail loop after reading events
//! metrics::record_events_read(7, 42);
//!
//! // After a phase commits
//! metrics::record_phase_transition("a+b", "rdonly", "apply", true);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Stream Engine
// =============================================================================

/// Record source events read by a stream.
pub fn record_events_read(stream_id: i64, count: usize) {
    counter!("migration_stream_events_read_total", "stream_id" => stream_id.to_string()).increment(count as u64);
}

/// Record source transactions applied (after filtering, non-empty only).
pub fn record_transactions_applied(stream_id: i64, count: usize) {
    counter!("migration_stream_transactions_applied_total", "stream_id" => stream_id.to_string()).increment(count as u64);
}

/// Record row changes applied to the destination.
pub fn record_rows_applied(stream_id: i64, rows: usize) {
    counter!("migration_stream_rows_applied_total", "stream_id" => stream_id.to_string()).increment(rows as u64);
}

/// Record time spent applying one batch.
pub fn record_apply_latency(stream_id: i64, duration: Duration) {
    histogram!("migration_stream_apply_duration_seconds", "stream_id" => stream_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record rows bulk-copied for a table.
pub fn record_rows_copied(stream_id: i64, table: &str, rows: usize) {
    counter!(
        "migration_copy_rows_total",
        "stream_id" => stream_id.to_string(),
        "table" => table.to_string()
    )
    .increment(rows as u64);
}

/// Record a completed table copy.
pub fn record_table_copied(stream_id: i64, table: &str, duration: Duration) {
    counter!("migration_copy_tables_total", "stream_id" => stream_id.to_string()).increment(1);
    histogram!("migration_copy_table_duration_seconds", "table" => table.to_string())
        .record(duration.as_secs_f64());
}

/// Record replication lag in milliseconds.
pub fn set_stream_lag_ms(stream_id: i64, lag_ms: u64) {
    gauge!("migration_stream_lag_ms", "stream_id" => stream_id.to_string()).set(lag_ms as f64);
}

/// Record replication lag in events (how far behind the source head).
pub fn set_stream_lag_events(stream_id: i64, lag_events: u64) {
    gauge!("migration_stream_lag_events", "stream_id" => stream_id.to_string()).set(lag_events as f64);
}

/// Record a stream state transition.
pub fn record_stream_state(stream_id: i64, state: &str) {
    counter!(
        "migration_stream_transitions_total",
        "stream_id" => stream_id.to_string(),
        "state" => state.to_string()
    )
    .increment(1);

    // Numeric encoding for alerting
    let value = match state {
        "Init" => 0.0,
        "Copying" => 1.0,
        "Running" => 2.0,
        "Stopped" => 3.0,
        "Error" => 4.0,
        _ => -1.0,
    };
    gauge!("migration_stream_state", "stream_id" => stream_id.to_string()).set(value);
}

/// Record a transient apply/read failure that will be retried.
pub fn record_stream_retry(stream_id: i64, operation: &str) {
    counter!(
        "migration_stream_retries_total",
        "stream_id" => stream_id.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record time a stream waited on the apply throttle.
pub fn record_throttle_wait(stream_id: i64, duration: Duration) {
    histogram!("migration_stream_throttle_wait_seconds", "stream_id" => stream_id.to_string())
        .record(duration.as_secs_f64());
}

/// Gauge for number of streams with a live task.
pub fn set_active_streams(count: usize) {
    gauge!("migration_active_streams").set(count as f64);
}

/// Record stream store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("migration_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Record a phase transition attempt.
///
/// `action` is one of `apply`, `reverse`, `finalize`, `cancel`.
pub fn record_phase_transition(migration: &str, phase: &str, action: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "migration_phase_transitions_total",
        "migration" => migration.to_string(),
        "phase" => phase.to_string(),
        "action" => action.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record how long a phase took end to end (including stream waits).
pub fn record_phase_duration(phase: &str, duration: Duration) {
    histogram!("migration_phase_duration_seconds", "phase" => phase.to_string())
        .record(duration.as_secs_f64());
}

/// Record an optimistic concurrency conflict on a topology key.
pub fn record_cas_conflict(key: &str) {
    counter!("migration_cas_conflicts_total", "key" => key.to_string()).increment(1);
}

/// Gauge for the current number of routing rules.
pub fn set_routing_rules(count: usize) {
    gauge!("migration_routing_rules").set(count as f64);
}

// =============================================================================
// Blacklists
// =============================================================================

/// Record a blacklist install/removal on a shard.
pub fn record_blacklist_change(partition: &str, class: &str, action: &str, tables: usize) {
    counter!(
        "migration_blacklist_changes_total",
        "partition" => partition.to_string(),
        "class" => class.to_string(),
        "action" => action.to_string()
    )
    .increment(tables as u64);
}

/// Record a write rejected because the table is blacklisted.
pub fn record_blacklist_rejection(partition: &str, table: &str) {
    counter!(
        "migration_blacklist_rejections_total",
        "partition" => partition.to_string(),
        "table" => table.to_string()
    )
    .increment(1);
}

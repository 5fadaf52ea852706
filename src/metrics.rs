// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Emits through the `metrics` facade for:
//! - Sightings recorded on the write path
//! - Cache applies by source and outcome
//! - Inbound rejects and self-origin suppressions
//! - Reconciliation ticks and rows
//! - Transport publish outcomes
//! - Store operation latency
//!
//! No recorder is installed here; the host process picks the exporter.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `altfinder_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use alt_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_cache_apply("redis", "updated");
//! metrics::record_store_op("sqlite", "upsert", true, Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a sighting reported by a local caller.
pub fn record_sighting(outcome: &str) {
    counter!("altfinder_sightings_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a record applied to the local cache.
///
/// `source` is where the record came from (local, store, redis, broker);
/// `outcome` is inserted, updated or unchanged.
pub fn record_cache_apply(source: &str, outcome: &str) {
    counter!(
        "altfinder_cache_applies_total",
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record rows removed from the cache by a delete.
pub fn record_cache_delete(source: &str, removed: usize) {
    counter!("altfinder_cache_deletes_total", "source" => source.to_string()).increment(1);
    counter!("altfinder_cache_deleted_rows_total", "source" => source.to_string())
        .increment(removed as u64);
}

/// Gauge for number of rows held by the cache.
pub fn set_cache_rows(count: usize) {
    gauge!("altfinder_cache_rows").set(count as f64);
}

/// Record an inbound message dropped before reaching the cache.
pub fn record_inbound_reject(transport: &str, reason: &str) {
    counter!(
        "altfinder_inbound_rejects_total",
        "transport" => transport.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a message discarded because this node published it.
pub fn record_self_origin_suppressed(transport: &str) {
    counter!("altfinder_self_origin_suppressed_total", "transport" => transport.to_string())
        .increment(1);
}

// =============================================================================
// Transport Metrics
// =============================================================================

/// Record a publish attempt on a transport stream.
pub fn record_publish(transport: &str, stream: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "altfinder_publishes_total",
        "transport" => transport.to_string(),
        "stream" => stream.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a transport connection attempt.
pub fn record_transport_connection(transport: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "altfinder_transport_connections_total",
        "transport" => transport.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Gauge for number of connected transports.
pub fn set_connected_transports(count: usize) {
    gauge!("altfinder_connected_transports").set(count as f64);
}

// =============================================================================
// Store Metrics
// =============================================================================

/// Record a durable store operation with its latency.
pub fn record_store_op(dialect: &str, operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "altfinder_store_ops_total",
        "dialect" => dialect.to_string(),
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "altfinder_store_op_duration_seconds",
        "dialect" => dialect.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("altfinder_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Reconciliation Metrics
// =============================================================================

/// Record a completed reconciliation pass.
pub fn record_sync_tick(rows: usize, published: usize, errors: usize, duration: Duration) {
    counter!("altfinder_sync_ticks_total").increment(1);
    counter!("altfinder_sync_rows_total").increment(rows as u64);
    counter!("altfinder_sync_published_total").increment(published as u64);
    if errors > 0 {
        counter!("altfinder_sync_errors_total").increment(errors as u64);
    }
    histogram!("altfinder_sync_tick_duration_seconds").record(duration.as_secs_f64());
}

/// Gauge for the last checkpoint handed off by the reconciliation loop.
pub fn set_sync_checkpoint(checkpoint: i64) {
    gauge!("altfinder_sync_checkpoint").set(checkpoint as f64);
}

/// Record queue entries pruned.
pub fn record_queue_pruned(count: u64) {
    if count > 0 {
        counter!("altfinder_queue_pruned_total").increment(count);
    }
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("altfinder_engine_state").set(value);
}

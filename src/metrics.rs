//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Operations fetched from leader shards and applied to follower shards
//! - Fetch/apply latency
//! - Per-shard replication lag (leader tip minus leader checkpoint)
//! - Index and shard task lifecycle transitions
//! - Checkpoint store flushes
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
//! use index_replication::metrics;
//! use std::time::Duration;
//!
//! // In a shard task after a fetch
//! metrics::record_ops_fetched("idx1f", 42, 8192, Duration::from_millis(12));
//!
//! // After advancing the checkpoint
//! metrics::set_shard_lag("idx1f", 0, 17);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a leader fetch: operation count, payload bytes and latency.
pub fn record_ops_fetched(follower_index: &str, ops: usize, bytes: usize, duration: Duration) {
    counter!("replication_ops_fetched_total", "index" => follower_index.to_string()).increment(ops as u64);
    counter!("replication_bytes_fetched_total", "index" => follower_index.to_string()).increment(bytes as u64);
    histogram!("replication_fetch_duration_seconds", "index" => follower_index.to_string())
        .record(duration.as_secs_f64());
}

/// Record operations applied to a follower shard.
pub fn record_ops_applied(follower_index: &str, ops: usize, duration: Duration) {
    counter!("replication_ops_applied_total", "index" => follower_index.to_string()).increment(ops as u64);
    histogram!("replication_apply_duration_seconds", "index" => follower_index.to_string())
        .record(duration.as_secs_f64());
}

/// Record a shard-level error by kind (`transient`, `permanent`, `index_wide`).
pub fn record_shard_error(follower_index: &str, kind: &str) {
    counter!(
        "replication_shard_errors_total",
        "index" => follower_index.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record replication lag of one shard, in operations.
pub fn set_shard_lag(follower_index: &str, shard: u32, lag_ops: u64) {
    gauge!(
        "replication_shard_lag_ops",
        "index" => follower_index.to_string(),
        "shard" => shard.to_string()
    )
    .set(lag_ops as f64);
}

/// Record an index task state transition.
pub fn record_index_state(follower_index: &str, state: &str) {
    counter!(
        "replication_index_state_transitions_total",
        "index" => follower_index.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record a shard task exit by outcome (`cancelled`, `killed`, `failed`).
pub fn record_shard_exit(follower_index: &str, outcome: &str) {
    counter!(
        "replication_shard_exits_total",
        "index" => follower_index.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a shard task restart after an external kill.
pub fn record_shard_restart(follower_index: &str) {
    counter!("replication_shard_restarts_total", "index" => follower_index.to_string()).increment(1);
}

/// Number of index tasks currently alive.
pub fn set_active_index_tasks(count: usize) {
    gauge!("replication_active_index_tasks").set(count as f64);
}

/// Record a control operation outcome (`start`, `pause`, ...).
pub fn record_control_op(operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_control_ops_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record an auto-follow poll: how many indices were started.
pub fn record_autofollow_poll(alias: &str, started: usize, failed: usize) {
    counter!("replication_autofollow_polls_total", "alias" => alias.to_string()).increment(1);
    counter!("replication_autofollow_started_total", "alias" => alias.to_string()).increment(started as u64);
    if failed > 0 {
        counter!("replication_autofollow_failures_total", "alias" => alias.to_string()).increment(failed as u64);
    }
}

/// Record one checkpoint flush: rows written, or a failed transaction.
pub fn record_checkpoint_flush(rows: usize, failed: bool) {
    let outcome = if failed { "failure" } else { "success" };
    counter!("replication_checkpoint_flushes_total", "outcome" => outcome).increment(1);
    counter!("replication_checkpoint_rows_flushed_total").increment(rows as u64);
}

/// Record a checkpoint statement retried on SQLITE_BUSY/SQLITE_LOCKED.
pub fn record_checkpoint_busy_retry(statement: &'static str) {
    counter!("replication_checkpoint_busy_retries_total", "statement" => statement).increment(1);
}

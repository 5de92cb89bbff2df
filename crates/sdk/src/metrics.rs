//! Metrics hooks for store calls, batch retries, and dropped rows.
//!
//! This module provides a pluggable [`Metrics`] trait that callers can
//! implement to collect telemetry from the mapping layer. Two
//! implementations are included:
//!
//! - [`NoopMetrics`]: the default; discards everything.
//! - [`MetricsFacade`]: forwards to the [`metrics`](https://docs.rs/metrics) crate facade,
//!   reaching whatever recorder is installed (Prometheus, StatsD, etc.).
//!
//! # Metric Names
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tessera_requests_total` | Counter | `operation`, `status` | Terminal operations by outcome |
//! | `tessera_request_duration_seconds` | Histogram | `operation` | Terminal operation latency |
//! | `tessera_batch_retries_total` | Counter | `operation`, `attempt` | Batch chunk retries |
//! | `tessera_batch_unprocessed_total` | Counter | `operation` | Items left unprocessed after retries |
//! | `tessera_rows_dropped_total` | Counter | `scope`, `reason` | Rows discarded while reading |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tessera::{MetricsFacade, TableConfig};
//!
//! # fn example() -> Result<(), tessera::Error> {
//! let config = TableConfig::builder()
//!     .with_table("ledger")
//!     .with_metrics(Arc::new(MetricsFacade))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::{fmt, sync::Arc, time::Duration};

/// Why a stored row was not returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The row is tagged with another entity or version.
    Foreign,
    /// The row claims this entity but its keys or values do not decode.
    Undecodable,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Foreign => write!(f, "foreign"),
            Self::Undecodable => write!(f, "undecodable"),
        }
    }
}

/// Metrics sink.
///
/// All methods have default no-op implementations, so only the metrics of
/// interest need overriding. Implementations must be `Send + Sync`; one
/// instance is shared by every entity built from the same [`TableConfig`]
/// and by concurrent batch chunks.
///
/// [`TableConfig`]: crate::TableConfig
pub trait Metrics: Send + Sync + fmt::Debug {
    /// Records the outcome of one terminal operation.
    ///
    /// - `operation`: `get`, `put`, `query`, `batch_write`, ...
    /// - `duration`: wall-clock time including batch retries.
    /// - `success`: whether the caller received `Ok`.
    fn record_request(&self, operation: &str, duration: Duration, success: bool) {
        let _ = (operation, duration, success);
    }

    /// Records a batch retry round. `attempt` is 2 for the first retry.
    fn record_retry(&self, operation: &str, attempt: u32) {
        let _ = (operation, attempt);
    }

    /// Records items a batch gave up on.
    fn record_unprocessed(&self, operation: &str, count: usize) {
        let _ = (operation, count);
    }

    /// Records rows dropped while reading an entity or collection.
    fn record_dropped_rows(&self, scope: &str, reason: DropReason, count: usize) {
        let _ = (scope, reason, count);
    }
}

/// No-op metrics. The default when no sink is configured.
#[derive(Debug, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Forwards to the `metrics` crate facade.
#[derive(Debug, Clone, Copy)]
pub struct MetricsFacade;

mod metric_names {
    pub const REQUESTS_TOTAL: &str = "tessera_requests_total";
    pub const REQUEST_DURATION: &str = "tessera_request_duration_seconds";
    pub const BATCH_RETRIES_TOTAL: &str = "tessera_batch_retries_total";
    pub const BATCH_UNPROCESSED_TOTAL: &str = "tessera_batch_unprocessed_total";
    pub const ROWS_DROPPED_TOTAL: &str = "tessera_rows_dropped_total";
}

impl Metrics for MetricsFacade {
    fn record_request(&self, operation: &str, duration: Duration, success: bool) {
        let status = if success { "success" } else { "error" };
        metrics::counter!(
            metric_names::REQUESTS_TOTAL,
            "operation" => operation.to_owned(),
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(metric_names::REQUEST_DURATION, "operation" => operation.to_owned())
            .record(duration.as_secs_f64());
    }

    fn record_retry(&self, operation: &str, attempt: u32) {
        metrics::counter!(
            metric_names::BATCH_RETRIES_TOTAL,
            "operation" => operation.to_owned(),
            "attempt" => attempt.to_string(),
        )
        .increment(1);
    }

    fn record_unprocessed(&self, operation: &str, count: usize) {
        metrics::counter!(
            metric_names::BATCH_UNPROCESSED_TOTAL,
            "operation" => operation.to_owned(),
        )
        .increment(count as u64);
    }

    fn record_dropped_rows(&self, scope: &str, reason: DropReason, count: usize) {
        metrics::counter!(
            metric_names::ROWS_DROPPED_TOTAL,
            "scope" => scope.to_owned(),
            "reason" => reason.to_string(),
        )
        .increment(count as u64);
    }
}

/// Creates the default metrics instance (no-op).
pub(crate) fn default_metrics() -> Arc<dyn Metrics> {
    Arc::new(NoopMetrics)
}

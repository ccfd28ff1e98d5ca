//! Observability metrics for the coordinator.
//!
//! Exposed via the `metrics` crate facade; wiring an exporter is the
//! embedding process's concern.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tether_coord_requests_total` | Counter | `op`, `outcome` | Dispatcher operations by outcome |
//! | `tether_coord_wal_appends_total` | Counter | `record_type` | WAL records appended |
//! | `tether_coord_leased_tasks` | Gauge | - | Tasks currently under lease |
//! | `tether_coord_lease_expirations_total` | Counter | - | Leases revoked by time |
//! | `tether_coord_duplicate_executions_total` | Counter | - | Grants beyond a task's first attempt |
//! | `tether_coord_retries_total` | Counter | - | Failed attempts re-queued per policy |
//! | `tether_coord_restarts_total` | Counter | - | Coordinator starts against an existing WAL |
//! | `tether_coord_wal_replay_duration_seconds` | Histogram | - | Startup replay wall time |

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Dispatcher operations by outcome.
    pub const REQUESTS_TOTAL: &str = "tether_coord_requests_total";
    /// Counter: WAL records appended.
    pub const WAL_APPENDS_TOTAL: &str = "tether_coord_wal_appends_total";
    /// Gauge: Tasks currently under lease.
    pub const LEASED_TASKS: &str = "tether_coord_leased_tasks";
    /// Counter: Leases revoked by time.
    pub const LEASE_EXPIRATIONS_TOTAL: &str = "tether_coord_lease_expirations_total";
    /// Counter: Grants beyond a task's first attempt.
    pub const DUPLICATE_EXECUTIONS_TOTAL: &str = "tether_coord_duplicate_executions_total";
    /// Counter: Failed attempts re-queued per retry policy.
    pub const RETRIES_TOTAL: &str = "tether_coord_retries_total";
    /// Counter: Coordinator starts.
    pub const RESTARTS_TOTAL: &str = "tether_coord_restarts_total";
    /// Histogram: Startup replay wall time in seconds.
    pub const WAL_REPLAY_DURATION_SECONDS: &str = "tether_coord_wal_replay_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Dispatcher operation (`submit_task`, `complete`, ...).
    pub const OP: &str = "op";
    /// Request outcome (`committed`, `cancelled`, `rejected`, `empty`).
    pub const OUTCOME: &str = "outcome";
    /// WAL record type name.
    pub const RECORD_TYPE: &str = "record_type";
}

/// High-level interface for recording coordinator metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorMetrics;

impl CoordinatorMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a dispatcher operation and its outcome.
    pub fn record_request(&self, op: &'static str, outcome: &str) {
        counter!(
            names::REQUESTS_TOTAL,
            labels::OP => op,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records a WAL append.
    pub fn record_append(&self, record_type: &'static str) {
        counter!(
            names::WAL_APPENDS_TOTAL,
            labels::RECORD_TYPE => record_type,
        )
        .increment(1);
    }

    /// Updates the leased-task gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small counts.
    pub fn set_leased_tasks(&self, count: usize) {
        gauge!(names::LEASED_TASKS).set(count as f64);
    }

    /// Records leases revoked by the expiry scan.
    pub fn record_expirations(&self, count: u64) {
        counter!(names::LEASE_EXPIRATIONS_TOTAL).increment(count);
    }

    /// Records a grant beyond a task's first attempt, the duplicate
    /// execution the at-least-once model permits.
    pub fn record_duplicate_execution(&self) {
        counter!(names::DUPLICATE_EXECUTIONS_TOTAL).increment(1);
    }

    /// Records a failed attempt re-queued for retry.
    pub fn record_retry(&self) {
        counter!(names::RETRIES_TOTAL).increment(1);
    }

    /// Records a coordinator start and its replay duration.
    pub fn record_startup(&self, replay_duration_secs: f64) {
        counter!(names::RESTARTS_TOTAL).increment(1);
        histogram!(names::WAL_REPLAY_DURATION_SECONDS).record(replay_duration_secs);
    }
}

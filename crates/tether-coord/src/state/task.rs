//! Task and lease state for the coordination kernel.
//!
//! This module provides:
//! - `TaskState`: The five-state task machine
//! - `Task`: The authoritative record for one unit of scheduled work
//! - `Lease`: Time-bounded, exclusive authority over one task attempt
//! - `RetryPolicy`: Per-task retry bounds and backoff

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::{LeaseId, RequestId, TaskId, WorkerId};

/// Task state machine.
///
/// ```text
/// ┌─────────┐ LeaseGranted ┌────────┐ TaskCompleted ┌───────────┐
/// │ WAITING │─────────────►│ LEASED │──────────────►│ COMPLETED │
/// └─────────┘              └────────┘               └───────────┘
///      ▲                    │  │  │
///      │   LeaseExpired     │  │  │ TaskFailed            ┌────────┐
///      ├────────────────────┘  │  ├──────────────────────►│ FAILED │
///      │   TaskFailed (retry)  │  │  (attempts exhausted) └────────┘
///      └───────────────────────┘  │
///                                 │ TaskDead (from any    ┌────────┐
///                                 └─ non-terminal state)─►│  DEAD  │
///                                                         └────────┘
/// ```
///
/// `TaskCancelled` never moves a task between states; it is a history
/// record of authority loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Eligible for lease grant.
    Waiting,
    /// Exclusively owned by a current lease.
    Leased,
    /// Completed successfully (terminal).
    Completed,
    /// Failed with retry attempts exhausted (terminal).
    Failed,
    /// Administratively terminated (terminal).
    Dead,
}

impl TaskState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Dead)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Backoff applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    /// A fixed delay before the next lease grant.
    Fixed(Duration),
}

impl RetryBackoff {
    /// Returns the delay before the next attempt becomes eligible.
    #[must_use]
    pub const fn delay(self) -> Duration {
        match self {
            Self::Fixed(delay) => delay,
        }
    }
}

/// Retry bounds for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of lease attempts. A failure on attempt `n` re-queues
    /// the task iff `n < max_attempts`.
    pub max_attempts: u32,
    /// Backoff between a failed attempt and the next grant.
    pub backoff: RetryBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            backoff: RetryBackoff::Fixed(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy {
    /// Returns true if a failure on `attempt` leaves retries available.
    #[must_use]
    pub const fn retries_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// The authoritative record for one unit of scheduled work.
///
/// Tasks are created by `TaskCreated`, mutated only by applying WAL
/// records, and never destroyed within a WAL generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Unique task identifier.
    pub task_id: TaskId,
    /// Opaque work payload, delivered to the leasing worker.
    pub payload: Bytes,
    /// Duration bound on ownership per attempt.
    pub execution_window: Duration,
    /// Retry bounds.
    pub retry_policy: RetryPolicy,
    /// Current state.
    pub state: TaskState,
    /// Count of lease grants so far.
    pub attempt: u32,
    /// The current lease, present iff `state == Leased`.
    pub current_lease_id: Option<LeaseId>,
    /// Submission timestamp (metadata; also the FIFO selection key).
    pub created_at: DateTime<Utc>,
    /// Idempotency key the task was submitted under, if any.
    pub request_id: Option<RequestId>,
}

/// Time-bounded, exclusive authority over exactly one task attempt.
///
/// A lease is *current* iff it equals its task's `current_lease_id`.
/// Non-current leases are historical: they are retained so that a late
/// worker report can be classified as authority loss rather than a
/// protocol error, and they never regain authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Unique lease identifier.
    pub lease_id: LeaseId,
    /// The task this lease covers.
    pub task_id: TaskId,
    /// The worker holding the lease.
    pub worker_id: WorkerId,
    /// Absolute expiry. A lease is valid strictly before this instant.
    pub expiry: DateTime<Utc>,
    /// The attempt number this lease was granted for.
    pub attempt: u32,
}

impl Lease {
    /// Returns true if the lease has expired at `now`.
    ///
    /// Expiry is strict: a lease observed exactly at its expiry instant
    /// is already expired.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Leased.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Dead.is_terminal());
    }

    #[test]
    fn retry_policy_boundary() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        assert!(policy.retries_after(1));
        assert!(!policy.retries_after(2));
        assert!(!policy.retries_after(3));

        let no_retries = RetryPolicy::default();
        assert!(!no_retries.retries_after(1));
    }

    #[test]
    fn lease_expiry_is_strict() {
        let expiry = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let lease = Lease {
            lease_id: LeaseId::generate(),
            task_id: TaskId::generate(),
            worker_id: WorkerId::new("w1").unwrap(),
            expiry,
            attempt: 1,
        };

        assert!(!lease.is_expired_at(expiry - chrono::Duration::nanoseconds(1)));
        assert!(lease.is_expired_at(expiry));
        assert!(lease.is_expired_at(expiry + chrono::Duration::seconds(1)));
    }

    #[test]
    fn state_labels_are_lowercase() {
        assert_eq!(TaskState::Waiting.label(), "waiting");
        assert_eq!(TaskState::Dead.to_string(), "dead");
    }
}

//! Worker/client protocol envelopes.
//!
//! Every request terminates in exactly one of COMMITTED, CANCELLED,
//! REJECTED, or a transport-level error (a `Result::Err` from the
//! dispatcher). The contract the core relies on:
//!
//! - after CANCELLED, the worker must not retry, re-submit, or emit side
//!   effects tied to that attempt: authority was lost, the result was
//!   discarded, and this is *not* a failure;
//! - after COMMITTED or REJECTED, the worker must not re-submit.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use tether_core::{LeaseId, RequestId, TaskId};

use crate::state::RetryPolicy;

/// A task submission.
#[derive(Debug, Clone)]
pub struct SubmitTask {
    /// Opaque work payload.
    pub payload: Bytes,
    /// Duration bound on ownership per attempt.
    pub execution_window: Duration,
    /// Retry bounds; the configured default applies when absent.
    pub retry_policy: Option<RetryPolicy>,
    /// Idempotency key: a repeated submission returns the original task.
    pub request_id: Option<RequestId>,
}

/// Response to `submit_task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitResponse {
    /// The task is durably recorded.
    Accepted {
        /// Assigned (or originally assigned) task identifier.
        task_id: TaskId,
        /// True when an earlier submission with the same request ID
        /// already created the task; nothing was appended.
        deduplicated: bool,
    },
    /// The submission was malformed.
    Rejected {
        /// What failed validation.
        reason: String,
    },
}

/// A granted lease, handed to the requesting worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseOffer {
    /// The leased task.
    pub task_id: TaskId,
    /// The authority token for this attempt.
    pub lease_id: LeaseId,
    /// The work payload.
    pub payload: Bytes,
    /// Absolute expiry; the worker must heartbeat before it.
    pub lease_expiry: DateTime<Utc>,
    /// The attempt number this lease begins.
    pub attempt: u32,
}

/// Response to `heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatResponse {
    /// The lease is valid; `lease_expiry` is the (possibly unchanged)
    /// authoritative expiry.
    Committed {
        /// Authoritative expiry after the heartbeat.
        lease_expiry: DateTime<Utc>,
    },
    /// The lease is expired, superseded, or unknown. The worker should
    /// stop working on the attempt.
    Rejected {
        /// Why the heartbeat was refused.
        reason: String,
    },
}

/// Response to `complete`, `fail`, and `kill_task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionResponse {
    /// The outcome is durably recorded; terminal for the attempt.
    Committed,
    /// Authority was lost before the report arrived. The result is
    /// discarded and a cancellation record preserves the history.
    Cancelled,
    /// Malformed or unknown request; protocol error.
    Rejected {
        /// What failed validation.
        reason: String,
    },
}

impl CompletionResponse {
    /// Returns true for the COMMITTED outcome.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    /// Returns true for the CANCELLED outcome.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Stable label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Cancelled => "cancelled",
            Self::Rejected { .. } => "rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lease_offer_serializes_for_the_transport() {
        let offer = LeaseOffer {
            task_id: TaskId::generate(),
            lease_id: LeaseId::generate(),
            payload: Bytes::from_static(b"\x01\x02"),
            lease_expiry: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap(),
            attempt: 1,
        };

        let json = serde_json::to_string(&offer).unwrap();
        let back: LeaseOffer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, offer);
    }

    #[test]
    fn completion_labels_are_stable() {
        assert_eq!(CompletionResponse::Committed.label(), "committed");
        assert_eq!(CompletionResponse::Cancelled.label(), "cancelled");
        assert_eq!(
            CompletionResponse::Rejected {
                reason: "nope".into()
            }
            .label(),
            "rejected"
        );
        assert!(CompletionResponse::Committed.is_committed());
        assert!(CompletionResponse::Cancelled.is_cancelled());
    }
}

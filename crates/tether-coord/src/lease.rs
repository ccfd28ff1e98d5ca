//! Lease decision logic: grant selection, expiry computation, and the
//! expiry scan.
//!
//! The engine is pure decision code. It never appends records or mutates
//! authoritative state; it proposes candidate records for the dispatcher
//! to run through the serialized pipeline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use tether_core::{LeaseId, TaskId, WorkerId};

use crate::state::{StateStore, Task};
use crate::wal::WalRecord;

/// A proposed lease grant: the record to append plus the fields the
/// dispatcher echoes back to the worker.
#[derive(Debug, Clone)]
pub struct GrantCandidate {
    /// The `LeaseGranted` record for the pipeline.
    pub record: WalRecord,
    /// The selected task.
    pub task_id: TaskId,
    /// The fresh lease.
    pub lease_id: LeaseId,
    /// The attempt the grant begins.
    pub attempt: u32,
    /// The computed expiry.
    pub lease_expiry: DateTime<Utc>,
}

/// Grant and expiry decisions over the state store.
#[derive(Debug)]
pub struct LeaseEngine {
    /// Cap on each renewable lease span.
    lease_duration: Duration,
    /// Soft retry spacing: tasks ineligible for grant until the recorded
    /// instant. Lost on restart: the failure record carries no
    /// timestamp, and losing the delay only makes a retry earlier.
    retry_not_before: HashMap<TaskId, DateTime<Utc>>,
}

impl LeaseEngine {
    /// Creates an engine with the configured lease duration cap.
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            lease_duration,
            retry_not_before: HashMap::new(),
        }
    }

    /// Computes a lease expiry: `now + min(execution_window, lease_duration)`.
    ///
    /// The execution window bounds ownership for short-lived tasks; the
    /// configured lease duration caps the renewable span for everything
    /// else, so a stalled worker is discovered within one lease duration
    /// regardless of window size.
    #[must_use]
    pub fn expiry_for(&self, task: &Task, now: DateTime<Utc>) -> DateTime<Utc> {
        self.renewal_expiry(task.execution_window, now)
    }

    /// Computes the expiry for a lease (or heartbeat renewal) over a task
    /// with the given execution window.
    #[must_use]
    pub fn renewal_expiry(&self, execution_window: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        let span = execution_window.min(self.lease_duration);
        let span = chrono::Duration::from_std(span)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        now + span
    }

    /// Selects the next grantable task: FIFO by `created_at`, ties broken
    /// by `task_id` ascending, retry-backoff holds skipped.
    #[must_use]
    pub fn next_candidate<'a>(
        &self,
        store: &'a StateStore,
        now: DateTime<Utc>,
    ) -> Option<&'a Task> {
        store.waiting_in_order().find(|task| {
            self.retry_not_before
                .get(&task.task_id)
                .is_none_or(|eligible_at| now >= *eligible_at)
        })
    }

    /// Builds the candidate `LeaseGranted` record for a selected task.
    #[must_use]
    pub fn build_grant(&self, task: &Task, worker_id: WorkerId, now: DateTime<Utc>) -> GrantCandidate {
        let lease_id = LeaseId::generate();
        let attempt = task.attempt + 1;
        let lease_expiry = self.expiry_for(task, now);
        GrantCandidate {
            record: WalRecord::LeaseGranted {
                task_id: task.task_id,
                lease_id,
                worker_id,
                attempt,
                lease_expiry,
                granted_at: now,
            },
            task_id: task.task_id,
            lease_id,
            attempt,
            lease_expiry,
        }
    }

    /// Records a retry hold after a failed attempt was re-queued.
    pub fn hold_for_backoff(&mut self, task_id: TaskId, eligible_at: DateTime<Utc>) {
        self.retry_not_before.insert(task_id, eligible_at);
    }

    /// Drops any retry hold (on grant or terminal transition).
    pub fn clear_hold(&mut self, task_id: TaskId) {
        self.retry_not_before.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::task::RetryPolicy;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn seed(store: &mut StateStore, created_at: DateTime<Utc>, window: Duration) -> TaskId {
        let task_id = TaskId::generate();
        store
            .apply(&WalRecord::TaskCreated {
                task_id,
                payload: Bytes::from_static(b"p"),
                execution_window: window,
                retry_policy: RetryPolicy::default(),
                request_id: None,
                created_at,
            })
            .unwrap();
        task_id
    }

    #[test]
    fn expiry_is_capped_by_lease_duration() {
        let engine = LeaseEngine::new(Duration::from_secs(30));
        let mut store = StateStore::new();
        let long = seed(&mut store, t0(), Duration::from_secs(300));
        let short = seed(
            &mut store,
            t0() + chrono::Duration::seconds(1),
            Duration::from_secs(5),
        );

        let long_task = store.task(long).unwrap();
        assert_eq!(
            engine.expiry_for(long_task, t0()),
            t0() + chrono::Duration::seconds(30)
        );

        let short_task = store.task(short).unwrap();
        assert_eq!(
            engine.expiry_for(short_task, t0()),
            t0() + chrono::Duration::seconds(5)
        );
    }

    #[test]
    fn selection_is_fifo() {
        let engine = LeaseEngine::new(Duration::from_secs(30));
        let mut store = StateStore::new();
        let second = seed(
            &mut store,
            t0() + chrono::Duration::seconds(2),
            Duration::from_secs(30),
        );
        let first = seed(&mut store, t0(), Duration::from_secs(30));

        let picked = engine.next_candidate(&store, t0()).unwrap().task_id;
        assert_eq!(picked, first);
        assert_ne!(picked, second);
    }

    #[test]
    fn backoff_hold_skips_task_until_eligible() {
        let mut engine = LeaseEngine::new(Duration::from_secs(30));
        let mut store = StateStore::new();
        let held = seed(&mut store, t0(), Duration::from_secs(30));
        let fresh = seed(
            &mut store,
            t0() + chrono::Duration::seconds(1),
            Duration::from_secs(30),
        );

        engine.hold_for_backoff(held, t0() + chrono::Duration::seconds(10));

        let now = t0() + chrono::Duration::seconds(5);
        assert_eq!(engine.next_candidate(&store, now).unwrap().task_id, fresh);

        let later = t0() + chrono::Duration::seconds(10);
        assert_eq!(engine.next_candidate(&store, later).unwrap().task_id, held);

        engine.clear_hold(held);
        assert_eq!(engine.next_candidate(&store, now).unwrap().task_id, held);
    }

    #[test]
    fn grant_increments_attempt_and_assigns_fresh_lease() {
        let engine = LeaseEngine::new(Duration::from_secs(30));
        let mut store = StateStore::new();
        let task_id = seed(&mut store, t0(), Duration::from_secs(30));
        let task = store.task(task_id).unwrap();

        let grant = engine.build_grant(task, WorkerId::new("w1").unwrap(), t0());
        assert_eq!(grant.attempt, 1);
        assert_eq!(grant.lease_expiry, t0() + chrono::Duration::seconds(30));
        assert_eq!(grant.task_id, task_id);
        assert!(matches!(grant.record, WalRecord::LeaseGranted { .. }));
    }
}

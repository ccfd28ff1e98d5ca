//! In-memory authoritative state, mutated only by applying WAL records.
//!
//! The store owns the task table and the lease table, plus the derived
//! indexes the lease engine reads. Indexes are rebuilt purely from
//! applied records and are never written independently:
//!
//! - `waiting`: tasks eligible for grant, ordered by `(created_at, task_id)`
//! - `leased`: task → current lease
//! - `leases_by_expiry`: min-heap by expiry, lazily pruned
//! - `terminal`: tasks in COMPLETED/FAILED/DEAD
//! - `requests`: idempotency key → task

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use tether_core::{LeaseId, RequestId, TaskId};

use super::task::{Lease, Task, TaskState};

/// The in-memory authoritative state.
#[derive(Debug, Default)]
pub struct StateStore {
    pub(crate) tasks: HashMap<TaskId, Task>,
    /// All leases ever granted. Non-current leases stay here so stale
    /// worker reports can be classified as authority loss.
    pub(crate) leases: HashMap<LeaseId, Lease>,
    pub(crate) waiting: BTreeSet<(DateTime<Utc>, TaskId)>,
    pub(crate) leased: HashMap<TaskId, LeaseId>,
    pub(crate) leases_by_expiry: BinaryHeap<Reverse<(DateTime<Utc>, LeaseId)>>,
    pub(crate) terminal: HashSet<TaskId>,
    pub(crate) requests: HashMap<RequestId, TaskId>,
}

impl StateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a task.
    #[must_use]
    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    /// Looks up a lease (current or historical).
    #[must_use]
    pub fn lease(&self, lease_id: LeaseId) -> Option<&Lease> {
        self.leases.get(&lease_id)
    }

    /// Returns the task a request ID was originally mapped to.
    #[must_use]
    pub fn task_for_request(&self, request_id: &RequestId) -> Option<TaskId> {
        self.requests.get(request_id).copied()
    }

    /// Returns true if `lease_id` is the current lease of `task_id`.
    #[must_use]
    pub fn lease_is_current(&self, task_id: TaskId, lease_id: LeaseId) -> bool {
        self.tasks
            .get(&task_id)
            .is_some_and(|task| task.current_lease_id == Some(lease_id))
    }

    /// Iterates waiting tasks in grant order: FIFO by `created_at`,
    /// ties broken by `task_id` ascending.
    pub fn waiting_in_order(&self) -> impl Iterator<Item = &Task> {
        self.waiting
            .iter()
            .filter_map(|(_, task_id)| self.tasks.get(task_id))
    }

    /// Number of tasks eligible for grant.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Number of tasks under a current lease.
    #[must_use]
    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }

    /// Number of tasks in the given state.
    #[must_use]
    pub fn count_in_state(&self, state: TaskState) -> usize {
        match state {
            TaskState::Waiting => self.waiting.len(),
            TaskState::Leased => self.leased.len(),
            _ => self
                .terminal
                .iter()
                .filter(|id| self.tasks.get(id).is_some_and(|t| t.state == state))
                .count(),
        }
    }

    /// Total tasks ever created in this WAL generation.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Pops every current lease whose expiry is at or before `now`.
    ///
    /// Heap entries are pruned lazily: entries for extended or
    /// invalidated leases are discarded as they surface.
    pub fn expired_due(&mut self, now: DateTime<Utc>) -> Vec<(TaskId, LeaseId)> {
        let mut due = Vec::new();
        while let Some(Reverse((expiry, lease_id))) = self.leases_by_expiry.peek().copied() {
            if expiry > now {
                break;
            }
            self.leases_by_expiry.pop();
            let Some(lease) = self.leases.get(&lease_id) else {
                continue;
            };
            if lease.expiry != expiry {
                // Stale entry from a later extension.
                continue;
            }
            if !self.lease_is_current(lease.task_id, lease_id) {
                continue;
            }
            due.push((lease.task_id, lease_id));
        }
        due
    }

    /// Re-indexes a lease for expiry scanning.
    ///
    /// Used when a popped candidate could not be durably expired (the
    /// append failed) and must surface again on the next scan.
    pub(crate) fn restore_expiry_entry(&mut self, lease_id: LeaseId) {
        if let Some(lease) = self.leases.get(&lease_id) {
            self.leases_by_expiry
                .push(Reverse((lease.expiry, lease_id)));
        }
    }

    /// Takes a canonical, order-independent snapshot of authoritative
    /// state (soft state and index internals excluded).
    ///
    /// Two replays of the same WAL prefix produce equal snapshots.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tasks: self
                .tasks
                .values()
                .map(|task| {
                    (
                        task.task_id.to_string(),
                        TaskSnapshot {
                            state: task.state,
                            attempt: task.attempt,
                            current_lease_id: task.current_lease_id.map(|id| id.to_string()),
                            payload: task.payload.to_vec(),
                            created_at: task.created_at,
                            execution_window_nanos: u64::try_from(
                                task.execution_window.as_nanos(),
                            )
                            .unwrap_or(u64::MAX),
                            max_attempts: task.retry_policy.max_attempts,
                        },
                    )
                })
                .collect(),
            leases: self
                .leases
                .values()
                .map(|lease| {
                    (
                        lease.lease_id.to_string(),
                        LeaseSnapshot {
                            task_id: lease.task_id.to_string(),
                            worker_id: lease.worker_id.to_string(),
                            expiry: lease.expiry,
                            attempt: lease.attempt,
                            current: self.lease_is_current(lease.task_id, lease.lease_id),
                        },
                    )
                })
                .collect(),
            requests: self
                .requests
                .iter()
                .map(|(req, task)| (req.to_string(), task.to_string()))
                .collect(),
        }
    }
}

/// Canonical view of authoritative state for comparison and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSnapshot {
    /// Every task, keyed by task ID.
    pub tasks: BTreeMap<String, TaskSnapshot>,
    /// Every lease ever granted, keyed by lease ID.
    pub leases: BTreeMap<String, LeaseSnapshot>,
    /// Idempotency key mapping.
    pub requests: BTreeMap<String, String>,
}

/// Canonical view of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    /// Current state.
    pub state: TaskState,
    /// Lease grants so far.
    pub attempt: u32,
    /// Current lease, if leased.
    pub current_lease_id: Option<String>,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
    /// Ownership bound per attempt, in nanoseconds.
    pub execution_window_nanos: u64,
    /// Retry bound.
    pub max_attempts: u32,
}

/// Canonical view of one lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseSnapshot {
    /// The covered task.
    pub task_id: String,
    /// The holding worker.
    pub worker_id: String,
    /// Absolute expiry.
    pub expiry: DateTime<Utc>,
    /// The attempt the lease was granted for.
    pub attempt: u32,
    /// Whether the lease is its task's current lease.
    pub current: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::task::RetryPolicy;
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::time::Duration;
    use tether_core::WorkerId;

    fn seed_task(store: &mut StateStore, created_at: DateTime<Utc>) -> TaskId {
        let task_id = TaskId::generate();
        store.tasks.insert(
            task_id,
            Task {
                task_id,
                payload: Bytes::from_static(b"p"),
                execution_window: Duration::from_secs(30),
                retry_policy: RetryPolicy::default(),
                state: TaskState::Waiting,
                attempt: 0,
                current_lease_id: None,
                created_at,
                request_id: None,
            },
        );
        store.waiting.insert((created_at, task_id));
        task_id
    }

    #[test]
    fn waiting_order_is_fifo_with_id_tiebreak() {
        let mut store = StateStore::new();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let later = seed_task(&mut store, t0 + chrono::Duration::seconds(5));
        let a = seed_task(&mut store, t0);
        let b = seed_task(&mut store, t0);
        let (first_same, second_same) = if a < b { (a, b) } else { (b, a) };

        let order: Vec<TaskId> = store.waiting_in_order().map(|t| t.task_id).collect();
        assert_eq!(order, vec![first_same, second_same, later]);
    }

    #[test]
    fn expired_due_prunes_stale_entries() {
        let mut store = StateStore::new();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let task_id = seed_task(&mut store, t0);
        let lease_id = LeaseId::generate();

        let old_expiry = t0 + chrono::Duration::seconds(30);
        let new_expiry = t0 + chrono::Duration::seconds(90);
        store.leases.insert(
            lease_id,
            Lease {
                lease_id,
                task_id,
                worker_id: WorkerId::new("w1").unwrap(),
                expiry: new_expiry,
                attempt: 1,
            },
        );
        store.waiting.clear();
        if let Some(task) = store.tasks.get_mut(&task_id) {
            task.state = TaskState::Leased;
            task.current_lease_id = Some(lease_id);
        }
        store.leased.insert(task_id, lease_id);
        // Both the pre-extension and post-extension entries are indexed.
        store.leases_by_expiry.push(Reverse((old_expiry, lease_id)));
        store.leases_by_expiry.push(Reverse((new_expiry, lease_id)));

        // The stale entry matures first and must be skipped.
        assert!(store
            .expired_due(t0 + chrono::Duration::seconds(45))
            .is_empty());
        // The live entry matures later and fires.
        assert_eq!(
            store.expired_due(t0 + chrono::Duration::seconds(120)),
            vec![(task_id, lease_id)]
        );
    }

    #[test]
    fn snapshot_is_stable_across_insertion_order() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut a = StateStore::new();
        let first = seed_task(&mut a, t0);
        let second = seed_task(&mut a, t0 + chrono::Duration::seconds(1));

        let mut b = StateStore::new();
        for id in [second, first] {
            let task = a.tasks[&id].clone();
            b.waiting.insert((task.created_at, id));
            b.tasks.insert(id, task);
        }

        assert_eq!(a.snapshot(), b.snapshot());
    }
}

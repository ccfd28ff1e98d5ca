//! Soft, rebuildable worker bookkeeping.
//!
//! The registry tracks which workers have been heard from and how many
//! current leases each holds. It is advisory only: lease placement
//! heuristics read it, correctness decisions never do. After a restart it
//! starts empty and refills from worker traffic.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use tether_core::WorkerId;

/// Advisory view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerState {
    /// The worker's self-assigned identifier.
    pub worker_id: WorkerId,
    /// Last time the worker contacted the coordinator.
    pub last_heartbeat: DateTime<Utc>,
    /// Current leases held by the worker.
    pub active_lease_count: u32,
}

/// The worker map, under its own short-lived lock.
///
/// Lock poisoning is recovered by taking the inner value: the data is
/// soft and a panicked writer cannot leave it in a state that matters.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    inner: RwLock<HashMap<WorkerId, WorkerState>>,
}

impl WorkerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records contact from a worker, creating the entry if needed.
    pub fn observe(&self, worker_id: &WorkerId, now: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .entry(worker_id.clone())
            .and_modify(|w| w.last_heartbeat = now)
            .or_insert_with(|| WorkerState {
                worker_id: worker_id.clone(),
                last_heartbeat: now,
                active_lease_count: 0,
            });
    }

    /// Increments the worker's active-lease count.
    pub fn lease_granted(&self, worker_id: &WorkerId) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = inner.get_mut(worker_id) {
            worker.active_lease_count = worker.active_lease_count.saturating_add(1);
        }
    }

    /// Decrements the worker's active-lease count.
    ///
    /// Saturating: after a restart the registry may never have seen the
    /// grant whose release it is told about.
    pub fn lease_released(&self, worker_id: &WorkerId) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = inner.get_mut(worker_id) {
            worker.active_lease_count = worker.active_lease_count.saturating_sub(1);
        }
    }

    /// Advisory staleness check: true if the worker has not been heard
    /// from within `heartbeat_interval × 3`, or was never seen.
    #[must_use]
    pub fn is_stale(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        heartbeat_interval: Duration,
    ) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(worker_id)
            .is_none_or(|w| now - w.last_heartbeat > heartbeat_interval * 3)
    }

    /// Number of workers ever heard from since startup.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no worker has been heard from.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all workers, sorted by ID for stable output.
    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkerState> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut workers: Vec<WorkerState> = inner.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }
}

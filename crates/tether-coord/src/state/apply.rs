//! Deterministic record application.
//!
//! `apply` is the sole mutator of the [`StateStore`]. It runs in two
//! places: live, after a record has been appended and synced; and during
//! replay. The function is clock-free: records encode facts, and any
//! time comparison ("is this lease expired?") happens in the dispatcher
//! before a record is chosen, never here.
//!
//! On the live path a precondition failure here is a coordinator bug:
//! the dispatcher validates before appending. On replay it is fatal and
//! means log corruption or a version mismatch.

use chrono::{DateTime, Utc};

use tether_core::{LeaseId, RequestId, TaskId};

use super::store::StateStore;
use super::task::{Lease, Task, TaskState};
use crate::wal::WalRecord;

/// A precondition failure while applying a record.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApplyError {
    /// `TaskCreated` for a task ID already present.
    #[error("task {task_id} already exists")]
    TaskExists {
        /// The duplicated task.
        task_id: TaskId,
    },

    /// `TaskCreated` reuses a request ID mapped to another task.
    #[error("request {request_id} already mapped to task {task_id}")]
    RequestExists {
        /// The duplicated idempotency key.
        request_id: RequestId,
        /// The task it already maps to.
        task_id: TaskId,
    },

    /// The record names a task the store has never seen.
    #[error("unknown task {task_id}")]
    UnknownTask {
        /// The unknown task.
        task_id: TaskId,
    },

    /// The record names a lease the store has never seen.
    #[error("unknown lease {lease_id}")]
    UnknownLease {
        /// The unknown lease.
        lease_id: LeaseId,
    },

    /// `LeaseGranted` reuses a lease ID.
    #[error("lease {lease_id} already exists")]
    LeaseExists {
        /// The duplicated lease.
        lease_id: LeaseId,
    },

    /// The task is not in WAITING where the record requires it.
    #[error("task {task_id} is {state}, expected waiting")]
    NotWaiting {
        /// The task.
        task_id: TaskId,
        /// Its actual state.
        state: TaskState,
    },

    /// The task is not in LEASED where the record requires it.
    #[error("task {task_id} is {state}, expected leased")]
    NotLeased {
        /// The task.
        task_id: TaskId,
        /// Its actual state.
        state: TaskState,
    },

    /// The named lease is not the task's current lease.
    #[error("lease {lease_id} is not current for task {task_id}")]
    LeaseNotCurrent {
        /// The task.
        task_id: TaskId,
        /// The stale lease.
        lease_id: LeaseId,
    },

    /// The named lease was never associated with the task.
    #[error("lease {lease_id} was never associated with task {task_id}")]
    LeaseNotAssociated {
        /// The task.
        task_id: TaskId,
        /// The foreign lease.
        lease_id: LeaseId,
    },

    /// `LeaseGranted` does not increment the attempt by exactly one.
    #[error("task {task_id}: attempt {got} does not follow prior attempt {prior}")]
    AttemptMismatch {
        /// The task.
        task_id: TaskId,
        /// The task's attempt before the grant.
        prior: u32,
        /// The attempt carried by the record.
        got: u32,
    },

    /// `LeaseExtended` does not strictly increase the expiry.
    #[error("lease {lease_id}: new expiry {new} does not extend {old}")]
    NonMonotonicExpiry {
        /// The lease.
        lease_id: LeaseId,
        /// Its current expiry.
        old: DateTime<Utc>,
        /// The rejected replacement.
        new: DateTime<Utc>,
    },

    /// A record other than a redundant `TaskCancelled` reached a
    /// terminal task.
    #[error("task {task_id} is terminal ({state})")]
    TerminalTask {
        /// The task.
        task_id: TaskId,
        /// Its terminal state.
        state: TaskState,
    },
}

impl StateStore {
    /// Applies one record, enforcing its precondition.
    ///
    /// # Errors
    ///
    /// Returns an [`ApplyError`] naming the violated precondition; the
    /// store is unchanged on error.
    pub fn apply(&mut self, record: &WalRecord) -> Result<(), ApplyError> {
        match record {
            WalRecord::TaskCreated {
                task_id,
                payload,
                execution_window,
                retry_policy,
                request_id,
                created_at,
            } => {
                if self.tasks.contains_key(task_id) {
                    return Err(ApplyError::TaskExists { task_id: *task_id });
                }
                if let Some(request_id) = request_id {
                    if let Some(existing) = self.requests.get(request_id) {
                        return Err(ApplyError::RequestExists {
                            request_id: request_id.clone(),
                            task_id: *existing,
                        });
                    }
                    self.requests.insert(request_id.clone(), *task_id);
                }
                self.tasks.insert(
                    *task_id,
                    Task {
                        task_id: *task_id,
                        payload: payload.clone(),
                        execution_window: *execution_window,
                        retry_policy: *retry_policy,
                        state: TaskState::Waiting,
                        attempt: 0,
                        current_lease_id: None,
                        created_at: *created_at,
                        request_id: request_id.clone(),
                    },
                );
                self.waiting.insert((*created_at, *task_id));
                Ok(())
            }

            WalRecord::LeaseGranted {
                task_id,
                lease_id,
                worker_id,
                attempt,
                lease_expiry,
                granted_at: _,
            } => {
                let task = self
                    .tasks
                    .get(task_id)
                    .ok_or(ApplyError::UnknownTask { task_id: *task_id })?;
                if task.state != TaskState::Waiting {
                    return Err(ApplyError::NotWaiting {
                        task_id: *task_id,
                        state: task.state,
                    });
                }
                if *attempt != task.attempt + 1 {
                    return Err(ApplyError::AttemptMismatch {
                        task_id: *task_id,
                        prior: task.attempt,
                        got: *attempt,
                    });
                }
                if self.leases.contains_key(lease_id) {
                    return Err(ApplyError::LeaseExists {
                        lease_id: *lease_id,
                    });
                }

                let created_at = task.created_at;
                let task = self
                    .tasks
                    .get_mut(task_id)
                    .ok_or(ApplyError::UnknownTask { task_id: *task_id })?;
                task.state = TaskState::Leased;
                task.attempt = *attempt;
                task.current_lease_id = Some(*lease_id);
                self.waiting.remove(&(created_at, *task_id));
                self.leased.insert(*task_id, *lease_id);
                self.leases.insert(
                    *lease_id,
                    Lease {
                        lease_id: *lease_id,
                        task_id: *task_id,
                        worker_id: worker_id.clone(),
                        expiry: *lease_expiry,
                        attempt: *attempt,
                    },
                );
                self.leases_by_expiry
                    .push(std::cmp::Reverse((*lease_expiry, *lease_id)));
                Ok(())
            }

            WalRecord::LeaseExtended {
                lease_id,
                new_lease_expiry,
            } => {
                let lease = self.leases.get(lease_id).ok_or(ApplyError::UnknownLease {
                    lease_id: *lease_id,
                })?;
                let task_id = lease.task_id;
                if !self.lease_is_current(task_id, *lease_id) {
                    return Err(ApplyError::LeaseNotCurrent {
                        task_id,
                        lease_id: *lease_id,
                    });
                }
                let old = lease.expiry;
                if *new_lease_expiry <= old {
                    return Err(ApplyError::NonMonotonicExpiry {
                        lease_id: *lease_id,
                        old,
                        new: *new_lease_expiry,
                    });
                }
                if let Some(lease) = self.leases.get_mut(lease_id) {
                    lease.expiry = *new_lease_expiry;
                }
                self.leases_by_expiry
                    .push(std::cmp::Reverse((*new_lease_expiry, *lease_id)));
                Ok(())
            }

            WalRecord::LeaseExpired { task_id, lease_id } => {
                self.release_current_lease(*task_id, *lease_id, TaskState::Waiting)
            }

            WalRecord::TaskCompleted { task_id, lease_id } => {
                self.release_current_lease(*task_id, *lease_id, TaskState::Completed)
            }

            WalRecord::TaskFailed {
                task_id,
                lease_id,
                failure_reason: _,
            } => {
                let task = self
                    .tasks
                    .get(task_id)
                    .ok_or(ApplyError::UnknownTask { task_id: *task_id })?;
                let next = if task.retry_policy.retries_after(task.attempt) {
                    TaskState::Waiting
                } else {
                    TaskState::Failed
                };
                self.release_current_lease(*task_id, *lease_id, next)
            }

            WalRecord::TaskCancelled { task_id, lease_id } => {
                if !self.tasks.contains_key(task_id) {
                    return Err(ApplyError::UnknownTask { task_id: *task_id });
                }
                let lease = self.leases.get(lease_id).ok_or(ApplyError::UnknownLease {
                    lease_id: *lease_id,
                })?;
                if lease.task_id != *task_id {
                    return Err(ApplyError::LeaseNotAssociated {
                        task_id: *task_id,
                        lease_id: *lease_id,
                    });
                }
                // History only. Whether the lease is current (it may still
                // be, when cancellation raced its expiry record) or long
                // superseded, state does not change.
                Ok(())
            }

            WalRecord::TaskDead { task_id, reason: _ } => {
                let task = self
                    .tasks
                    .get(task_id)
                    .ok_or(ApplyError::UnknownTask { task_id: *task_id })?;
                if task.state.is_terminal() {
                    return Err(ApplyError::TerminalTask {
                        task_id: *task_id,
                        state: task.state,
                    });
                }
                let created_at = task.created_at;
                let task = self
                    .tasks
                    .get_mut(task_id)
                    .ok_or(ApplyError::UnknownTask { task_id: *task_id })?;
                task.current_lease_id = None;
                task.state = TaskState::Dead;
                self.waiting.remove(&(created_at, *task_id));
                self.leased.remove(task_id);
                self.terminal.insert(*task_id);
                Ok(())
            }
        }
    }

    /// Shared transition out of LEASED under the current lease.
    fn release_current_lease(
        &mut self,
        task_id: TaskId,
        lease_id: LeaseId,
        next: TaskState,
    ) -> Result<(), ApplyError> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(ApplyError::UnknownTask { task_id })?;
        if task.state != TaskState::Leased {
            return Err(ApplyError::NotLeased {
                task_id,
                state: task.state,
            });
        }
        if task.current_lease_id != Some(lease_id) {
            return Err(ApplyError::LeaseNotCurrent { task_id, lease_id });
        }

        let created_at = task.created_at;
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(ApplyError::UnknownTask { task_id })?;
        task.state = next;
        task.current_lease_id = None;
        self.leased.remove(&task_id);
        match next {
            TaskState::Waiting => {
                self.waiting.insert((created_at, task_id));
            }
            TaskState::Completed | TaskState::Failed | TaskState::Dead => {
                self.terminal.insert(task_id);
            }
            TaskState::Leased => {}
        }
        Ok(())
    }
}

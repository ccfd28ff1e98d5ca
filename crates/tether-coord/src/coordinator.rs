//! The request dispatcher: the single serialization point for every
//! authoritative state change.
//!
//! Every operation runs the same pipeline:
//!
//! ```text
//! validate → choose record → WAL append → WAL sync → apply → respond
//! ```
//!
//! The WAL + store + lease engine live behind one async mutex; the
//! `append → sync → apply` critical section is executed by exactly one
//! writer at a time, and concurrent requests queue behind it. The expiry
//! scan competes for the same lock. A failed append or sync means the
//! operation never happened: the caller gets a transport-level error and
//! retries with the same request ID.
//!
//! All operations take `now` explicitly: the transport front-end passes
//! the request arrival time, the expiry ticker passes its tick time, and
//! tests inject fixed clocks. Nothing below this layer reads a global
//! clock, which is what makes replay deterministic.

use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use tether_core::observability::dispatch_span;
use tether_core::{LeaseId, TaskId, WorkerId};

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::lease::LeaseEngine;
use crate::metrics::CoordinatorMetrics;
use crate::protocol::{
    CompletionResponse, HeartbeatResponse, LeaseOffer, SubmitResponse, SubmitTask,
};
use crate::registry::WorkerRegistry;
use crate::state::{StateStore, StoreSnapshot, TaskState};
use crate::wal::{Wal, WalRecord};

/// Payload size cap; keeps every task well inside one WAL frame.
const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Outcome of the startup replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records applied from the WAL.
    pub records: u64,
    /// Whether a torn or checksum-failing tail record was discarded.
    pub truncated_tail: bool,
    /// Wall time spent replaying.
    pub replay_duration: std::time::Duration,
}

/// Point-in-time counts for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    /// Tasks eligible for grant.
    pub waiting: usize,
    /// Tasks under a current lease.
    pub leased: usize,
    /// Tasks completed successfully.
    pub completed: usize,
    /// Tasks failed with retries exhausted.
    pub failed: usize,
    /// Tasks administratively terminated.
    pub dead: usize,
    /// Tasks ever created in this WAL generation.
    pub total_tasks: usize,
    /// Workers heard from since startup (soft state).
    pub workers_seen: usize,
    /// Records applied since startup, replay included.
    pub wal_records: u64,
    /// Bytes of valid WAL.
    pub wal_bytes: u64,
}

/// Read-only view of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    /// The task.
    pub task_id: TaskId,
    /// Current state.
    pub state: TaskState,
    /// Lease grants so far.
    pub attempt: u32,
    /// Current lease, if leased.
    pub current_lease_id: Option<LeaseId>,
    /// Current lease expiry, if leased.
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CoordCore {
    wal: Wal,
    store: StateStore,
    engine: LeaseEngine,
    /// Records applied since startup, replay included.
    applied_records: u64,
}

/// The coordinator: dispatcher, WAL, state, and lease engine in one
/// single-writer unit.
#[derive(Debug)]
pub struct Coordinator {
    core: Mutex<CoordCore>,
    registry: WorkerRegistry,
    metrics: CoordinatorMetrics,
    config: CoordinatorConfig,
}

/// Where a worker report stands relative to the current lease.
enum Authority {
    /// The lease is current and unexpired: the report carries authority.
    Current {
        /// The lease-holding worker.
        worker_id: WorkerId,
        /// The lease's current expiry.
        expiry: DateTime<Utc>,
        /// The task's execution window, for renewal computation.
        window: std::time::Duration,
    },
    /// The lease is associated with the task but superseded or expired:
    /// authority was lost.
    Lost,
    /// The task or lease is unknown, or the lease belongs to another
    /// task: protocol error.
    Unknown(String),
}

impl Coordinator {
    /// Opens the WAL at the configured path, replays it into a fresh
    /// store, and returns the running coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WalLocked`] when another instance owns the WAL,
    /// [`Error::Corruption`] or [`Error::Invariant`] when replay refuses
    /// the log, and [`Error::Configuration`] for invalid settings.
    pub fn open(config: CoordinatorConfig) -> Result<(Self, ReplayReport)> {
        config.validate()?;

        let mut wal = Wal::open(&config.wal_path, config.sync_policy())?;
        let mut store = StateStore::new();

        let started = Instant::now();
        let stats = wal.replay(|seq, offset, record| {
            store.apply(&record).map_err(|e| Error::Invariant {
                seq,
                offset,
                message: e.to_string(),
            })
        })?;
        let replay_duration = started.elapsed();

        let metrics = CoordinatorMetrics::new();
        metrics.record_startup(replay_duration.as_secs_f64());
        metrics.set_leased_tasks(store.leased_count());

        tracing::info!(
            records = stats.records,
            truncated_tail = stats.truncated_tail,
            elapsed_ms = replay_duration.as_millis() as u64,
            wal = %config.wal_path.display(),
            "coordinator recovered"
        );

        let engine = LeaseEngine::new(config.lease_duration);
        let coordinator = Self {
            core: Mutex::new(CoordCore {
                wal,
                store,
                engine,
                applied_records: stats.records,
            }),
            registry: WorkerRegistry::new(),
            metrics,
            config,
        };
        Ok((
            coordinator,
            ReplayReport {
                records: stats.records,
                truncated_tail: stats.truncated_tail,
                replay_duration,
            },
        ))
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns the worker registry (advisory reads).
    #[must_use]
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Submits a task. Idempotent on `request_id`: a repeated submission
    /// returns the originally assigned task ID without appending.
    pub async fn submit_task(
        &self,
        submit: SubmitTask,
        now: DateTime<Utc>,
    ) -> Result<SubmitResponse> {
        if submit.execution_window.is_zero() {
            self.metrics.record_request("submit_task", "rejected");
            return Ok(SubmitResponse::Rejected {
                reason: "execution_window must be positive".into(),
            });
        }
        if submit.payload.len() > MAX_PAYLOAD_BYTES {
            self.metrics.record_request("submit_task", "rejected");
            return Ok(SubmitResponse::Rejected {
                reason: format!("payload exceeds {MAX_PAYLOAD_BYTES} bytes"),
            });
        }

        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        if let Some(request_id) = &submit.request_id {
            if let Some(task_id) = core.store.task_for_request(request_id) {
                tracing::debug!(%task_id, %request_id, "duplicate submission deduplicated");
                self.metrics.record_request("submit_task", "deduplicated");
                return Ok(SubmitResponse::Accepted {
                    task_id,
                    deduplicated: true,
                });
            }
        }

        let task_id = TaskId::generate();
        let record = WalRecord::TaskCreated {
            task_id,
            payload: submit.payload,
            execution_window: submit.execution_window,
            retry_policy: submit
                .retry_policy
                .unwrap_or_else(|| self.config.default_retry_policy()),
            request_id: submit.request_id,
            created_at: now,
        };
        self.commit(core, "submit_task", &record)?;

        self.metrics.record_request("submit_task", "committed");
        Ok(SubmitResponse::Accepted {
            task_id,
            deduplicated: false,
        })
    }

    /// Grants a lease on the next eligible waiting task, or returns
    /// `None` ("no work") without appending anything.
    pub async fn request_lease(
        &self,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseOffer>> {
        self.registry.observe(&worker_id, now);

        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let Some(task) = core.engine.next_candidate(&core.store, now) else {
            self.metrics.record_request("request_lease", "empty");
            return Ok(None);
        };
        let payload = task.payload.clone();
        let grant = core.engine.build_grant(task, worker_id.clone(), now);

        self.commit(core, "request_lease", &grant.record)?;
        core.engine.clear_hold(grant.task_id);

        self.registry.lease_granted(&worker_id);
        if grant.attempt > 1 {
            self.metrics.record_duplicate_execution();
        }
        self.metrics.set_leased_tasks(core.store.leased_count());
        self.metrics.record_request("request_lease", "committed");
        tracing::debug!(task_id = %grant.task_id, lease_id = %grant.lease_id, attempt = grant.attempt, "lease granted");

        Ok(Some(LeaseOffer {
            task_id: grant.task_id,
            lease_id: grant.lease_id,
            payload,
            lease_expiry: grant.lease_expiry,
            attempt: grant.attempt,
        }))
    }

    /// Extends a current, unexpired lease. The expiry hint is advisory;
    /// the coordinator computes the extension itself.
    pub async fn heartbeat(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        expiry_hint: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let (worker_id, current_expiry, window) =
            match authority(&core.store, task_id, lease_id, now) {
                Authority::Current {
                    worker_id,
                    expiry,
                    window,
                } => (worker_id, expiry, window),
                Authority::Lost => {
                    // Expired or superseded heartbeats are rejected, not
                    // cancelled: nothing was lost that a record must witness.
                    self.metrics.record_request("heartbeat", "rejected");
                    return Ok(HeartbeatResponse::Rejected {
                        reason: format!("lease {lease_id} is expired or superseded"),
                    });
                }
                Authority::Unknown(reason) => {
                    self.metrics.record_request("heartbeat", "rejected");
                    return Ok(HeartbeatResponse::Rejected { reason });
                }
            };

        self.registry.observe(&worker_id, now);

        let new_expiry = core.engine.renewal_expiry(window, now);
        if let Some(hint) = expiry_hint {
            if hint != new_expiry {
                tracing::trace!(%lease_id, %hint, %new_expiry, "ignoring worker expiry hint");
            }
        }

        if new_expiry > current_expiry {
            let record = WalRecord::LeaseExtended {
                lease_id,
                new_lease_expiry: new_expiry,
            };
            self.commit(core, "heartbeat", &record)?;
            self.metrics.record_request("heartbeat", "committed");
            return Ok(HeartbeatResponse::Committed {
                lease_expiry: new_expiry,
            });
        }

        // A computed extension that does not strictly increase the expiry
        // is acknowledged without an append.
        self.metrics.record_request("heartbeat", "committed");
        Ok(HeartbeatResponse::Committed {
            lease_expiry: current_expiry,
        })
    }

    /// Reports successful completion of a leased attempt.
    ///
    /// The result bytes are accepted for protocol fidelity and dropped:
    /// result delivery is a transport concern, and the record set stores
    /// facts about authority, not outputs.
    pub async fn complete(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        _result: Bytes,
        now: DateTime<Utc>,
    ) -> Result<CompletionResponse> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let response = match authority(&core.store, task_id, lease_id, now) {
            Authority::Current { worker_id, .. } => {
                self.commit(core, "complete", &WalRecord::TaskCompleted { task_id, lease_id })?;
                core.engine.clear_hold(task_id);
                self.registry.lease_released(&worker_id);
                self.metrics.set_leased_tasks(core.store.leased_count());
                CompletionResponse::Committed
            }
            Authority::Lost => {
                self.commit(core, "complete", &WalRecord::TaskCancelled { task_id, lease_id })?;
                tracing::debug!(%task_id, %lease_id, "stale completion cancelled");
                CompletionResponse::Cancelled
            }
            Authority::Unknown(reason) => CompletionResponse::Rejected { reason },
        };

        self.metrics.record_request("complete", response.label());
        Ok(response)
    }

    /// Reports a failed attempt. The applier consults the retry policy:
    /// the task either re-queues (with a backoff hold) or goes terminal.
    pub async fn fail(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<CompletionResponse> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let response = match authority(&core.store, task_id, lease_id, now) {
            Authority::Current { worker_id, .. } => {
                self.commit(
                    core,
                    "fail",
                    &WalRecord::TaskFailed {
                        task_id,
                        lease_id,
                        failure_reason: reason,
                    },
                )?;
                self.registry.lease_released(&worker_id);
                self.metrics.set_leased_tasks(core.store.leased_count());

                match core.store.task(task_id).map(|t| t.state) {
                    Some(TaskState::Waiting) => {
                        // Re-queued: space the next grant per the task's
                        // backoff. Soft state; see LeaseEngine.
                        let backoff = core
                            .store
                            .task(task_id)
                            .map(|t| t.retry_policy.backoff.delay())
                            .unwrap_or_default();
                        let eligible_at = now
                            + chrono::Duration::from_std(backoff)
                                .unwrap_or_else(|_| chrono::Duration::seconds(0));
                        core.engine.hold_for_backoff(task_id, eligible_at);
                        self.metrics.record_retry();
                    }
                    _ => core.engine.clear_hold(task_id),
                }
                CompletionResponse::Committed
            }
            Authority::Lost => {
                self.commit(core, "fail", &WalRecord::TaskCancelled { task_id, lease_id })?;
                tracing::debug!(%task_id, %lease_id, "stale failure cancelled");
                CompletionResponse::Cancelled
            }
            Authority::Unknown(reason) => CompletionResponse::Rejected { reason },
        };

        self.metrics.record_request("fail", response.label());
        Ok(response)
    }

    /// Administratively terminates a task from any non-terminal state.
    pub async fn kill_task(&self, task_id: TaskId, reason: String) -> Result<CompletionResponse> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let Some(task) = core.store.task(task_id) else {
            self.metrics.record_request("kill_task", "rejected");
            return Ok(CompletionResponse::Rejected {
                reason: format!("unknown task {task_id}"),
            });
        };
        if task.state.is_terminal() {
            self.metrics.record_request("kill_task", "rejected");
            return Ok(CompletionResponse::Rejected {
                reason: format!("task {task_id} is already terminal ({})", task.state),
            });
        }
        let held_by = task
            .current_lease_id
            .and_then(|lease_id| core.store.lease(lease_id))
            .map(|lease| lease.worker_id.clone());

        self.commit(core, "kill_task", &WalRecord::TaskDead { task_id, reason })?;
        core.engine.clear_hold(task_id);
        if let Some(worker_id) = held_by {
            self.registry.lease_released(&worker_id);
        }
        self.metrics.set_leased_tasks(core.store.leased_count());
        self.metrics.record_request("kill_task", "committed");
        Ok(CompletionResponse::Committed)
    }

    /// Revokes every current lease whose expiry is at or before `now`.
    ///
    /// Driven by the expiry ticker, but callable directly (tests, or an
    /// inline scan before shutdown). Expiry records carry no client
    /// acknowledgement, so the batch syncs per policy rather than per
    /// record; a crash can only lose revocations that the next scan
    /// re-derives from the clock.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let due = core.store.expired_due(now);
        if due.is_empty() {
            return Ok(0);
        }

        let mut expired = 0usize;
        for (index, (task_id, lease_id)) in due.iter().copied().enumerate() {
            let record = WalRecord::LeaseExpired { task_id, lease_id };
            if let Err(error) = core.wal.append(&record) {
                // The batch stops here; everything unwritten surfaces on
                // the next scan.
                for (_, lease_id) in due.iter().copied().skip(index) {
                    core.store.restore_expiry_entry(lease_id);
                }
                return Err(error);
            }
            core.store.apply(&record).map_err(|e| Error::Invariant {
                seq: core.applied_records,
                offset: core.wal.offset(),
                message: e.to_string(),
            })?;
            core.applied_records += 1;
            self.metrics.record_append(record.type_name());

            if let Some(lease) = core.store.lease(lease_id) {
                self.registry.lease_released(&lease.worker_id);
            }
            tracing::debug!(%task_id, %lease_id, "lease expired");
            expired += 1;
        }
        core.wal.sync_per_policy()?;

        self.metrics.record_expirations(expired as u64);
        self.metrics.set_leased_tasks(core.store.leased_count());
        Ok(expired)
    }

    /// Point-in-time counts, taken under the serialization lock.
    pub async fn status(&self) -> CoordinatorStatus {
        let core = self.core.lock().await;
        CoordinatorStatus {
            waiting: core.store.waiting_count(),
            leased: core.store.leased_count(),
            completed: core.store.count_in_state(TaskState::Completed),
            failed: core.store.count_in_state(TaskState::Failed),
            dead: core.store.count_in_state(TaskState::Dead),
            total_tasks: core.store.task_count(),
            workers_seen: self.registry.len(),
            wal_records: core.applied_records,
            wal_bytes: core.wal.offset(),
        }
    }

    /// Read-only view of one task.
    pub async fn task_view(&self, task_id: TaskId) -> Option<TaskView> {
        let core = self.core.lock().await;
        core.store.task(task_id).map(|task| TaskView {
            task_id: task.task_id,
            state: task.state,
            attempt: task.attempt,
            current_lease_id: task.current_lease_id,
            lease_expiry: task
                .current_lease_id
                .and_then(|id| core.store.lease(id))
                .map(|lease| lease.expiry),
            created_at: task.created_at,
        })
    }

    /// Canonical snapshot of authoritative state (soft state excluded).
    pub async fn snapshot(&self) -> StoreSnapshot {
        self.core.lock().await.store.snapshot()
    }

    /// Syncs and releases the WAL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Durability`] on fsync failure.
    pub fn close(self) -> Result<()> {
        self.core.into_inner().wal.close()
    }

    /// The invariant pipeline tail: append, sync, apply.
    ///
    /// Client-acknowledged records always sync before the response is
    /// released, so batched-sync laziness never weakens the durability
    /// contract. The section is synchronous, so the dispatch span guards
    /// it without crossing an await point.
    fn commit(&self, core: &mut CoordCore, op: &'static str, record: &WalRecord) -> Result<()> {
        let task_id = record.task_id().map_or_else(String::new, |id| id.to_string());
        let span = dispatch_span(op, &task_id);
        let _guard = span.enter();

        let offset = core.wal.append(record)?;
        core.wal.sync()?;
        core.store.apply(record).map_err(|e| Error::Invariant {
            seq: core.applied_records,
            offset,
            message: e.to_string(),
        })?;
        core.applied_records += 1;
        self.metrics.record_append(record.type_name());
        Ok(())
    }
}

/// Classifies a worker report against the task's current lease.
///
/// The clock is the source: a current lease observed at or past its
/// expiry has lost authority even if no expiry record exists yet.
fn authority(
    store: &StateStore,
    task_id: TaskId,
    lease_id: LeaseId,
    now: DateTime<Utc>,
) -> Authority {
    let Some(task) = store.task(task_id) else {
        return Authority::Unknown(format!("unknown task {task_id}"));
    };
    let Some(lease) = store.lease(lease_id) else {
        return Authority::Unknown(format!("unknown lease {lease_id}"));
    };
    if lease.task_id != task_id {
        return Authority::Unknown(format!(
            "lease {lease_id} was never associated with task {task_id}"
        ));
    }
    if task.current_lease_id == Some(lease_id) && !lease.is_expired_at(now) {
        Authority::Current {
            worker_id: lease.worker_id.clone(),
            expiry: lease.expiry,
            window: task.execution_window,
        }
    } else {
        Authority::Lost
    }
}

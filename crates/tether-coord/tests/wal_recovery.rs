//! Recovery behavior: torn tails, mid-log corruption, and replay
//! determinism at the coordinator level.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use tether_coord::config::CoordinatorConfig;
use tether_coord::coordinator::Coordinator;
use tether_coord::error::Error;
use tether_coord::protocol::{SubmitResponse, SubmitTask};
use tether_coord::state::TaskState;
use tether_core::observability::{init_logging, LogFormat};
use tether_core::{TaskId, WorkerId};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn init_tracing() {
    init_logging(LogFormat::Pretty);
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

async fn submit_one(coordinator: &Coordinator, now: DateTime<Utc>) -> TaskId {
    let response = coordinator
        .submit_task(
            SubmitTask {
                payload: Bytes::from_static(b"payload"),
                execution_window: Duration::from_secs(30),
                retry_policy: None,
                request_id: None,
            },
            now,
        )
        .await
        .unwrap();
    match response {
        SubmitResponse::Accepted { task_id, .. } => task_id,
        SubmitResponse::Rejected { reason } => panic!("submission rejected: {reason}"),
    }
}

/// Runs a small mixed workload and closes cleanly.
async fn run_workload(path: &Path) -> Vec<TaskId> {
    let (coordinator, _) = Coordinator::open(CoordinatorConfig::new(path)).unwrap();
    let worker = WorkerId::new("w1").unwrap();

    let completed = submit_one(&coordinator, t0()).await;
    let expired = submit_one(&coordinator, t0() + secs(1)).await;
    let waiting = submit_one(&coordinator, t0() + secs(2)).await;

    let first = coordinator
        .request_lease(worker.clone(), t0() + secs(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.task_id, completed);
    coordinator
        .complete(completed, first.lease_id, Bytes::new(), t0() + secs(4))
        .await
        .unwrap();

    let second = coordinator
        .request_lease(worker.clone(), t0() + secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.task_id, expired);
    coordinator
        .heartbeat(expired, second.lease_id, None, t0() + secs(10))
        .await
        .unwrap();
    coordinator.expire_due(t0() + secs(120)).await.unwrap();

    coordinator.close().unwrap();
    vec![completed, expired, waiting]
}

#[tokio::test]
async fn two_replays_of_one_wal_are_identical() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.wal");
    run_workload(&path).await;

    let (first, report_a) = Coordinator::open(CoordinatorConfig::new(&path)).unwrap();
    let snapshot_a = first.snapshot().await;
    drop(first);

    let (second, report_b) = Coordinator::open(CoordinatorConfig::new(&path)).unwrap();
    let snapshot_b = second.snapshot().await;

    assert_eq!(report_a.records, report_b.records);
    assert_eq!(snapshot_a, snapshot_b);
}

#[tokio::test]
async fn live_extension_of_a_replayed_wal_matches_fresh_replay() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.wal");
    let ids = run_workload(&path).await;

    // Recover, then extend the history live.
    let (coordinator, _) = Coordinator::open(CoordinatorConfig::new(&path)).unwrap();
    let worker = WorkerId::new("w2").unwrap();
    let offer = coordinator
        .request_lease(worker, t0() + secs(130))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        offer.task_id, ids[1],
        "the previously expired task re-grants before the fresh one",
    );
    coordinator
        .complete(offer.task_id, offer.lease_id, Bytes::new(), t0() + secs(131))
        .await
        .unwrap();
    let live_snapshot = coordinator.snapshot().await;
    coordinator.close().unwrap();

    // A cold replay of the extended WAL lands on the same state.
    let (fresh, _) = Coordinator::open(CoordinatorConfig::new(&path)).unwrap();
    assert_eq!(fresh.snapshot().await, live_snapshot);
}

#[tokio::test]
async fn torn_tail_recovers_to_the_prior_record() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.wal");

    let task_id = {
        let (coordinator, _) = Coordinator::open(CoordinatorConfig::new(&path)).unwrap();
        let task_id = submit_one(&coordinator, t0()).await;
        submit_one(&coordinator, t0() + secs(1)).await;
        coordinator.close().unwrap();
        task_id
    };

    // Chop the file mid-way through the final record, as a crash between
    // append and sync would.
    let len = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 5).unwrap();
    drop(file);

    let (coordinator, report) = Coordinator::open(CoordinatorConfig::new(&path)).unwrap();
    assert_eq!(report.records, 1);
    assert!(report.truncated_tail);
    assert_eq!(
        coordinator.task_view(task_id).await.unwrap().state,
        TaskState::Waiting
    );
    assert_eq!(coordinator.status().await.total_tasks, 1);

    // The log is usable again: appends land after the truncation point.
    let replacement = submit_one(&coordinator, t0() + secs(2)).await;
    coordinator.close().unwrap();

    let (reopened, report) = Coordinator::open(CoordinatorConfig::new(&path)).unwrap();
    assert_eq!(report.records, 2);
    assert!(!report.truncated_tail);
    assert!(reopened.task_view(replacement).await.is_some());
}

#[tokio::test]
async fn mid_log_corruption_refuses_startup() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.wal");

    {
        let (coordinator, _) = Coordinator::open(CoordinatorConfig::new(&path)).unwrap();
        submit_one(&coordinator, t0()).await;
        submit_one(&coordinator, t0() + secs(1)).await;
        submit_one(&coordinator, t0() + secs(2)).await;
        coordinator.close().unwrap();
    }

    // Flip one payload bit inside the middle record.
    let mut bytes = std::fs::read(&path).unwrap();
    let record_len = bytes.len() / 3;
    bytes[record_len + 10] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let err = Coordinator::open(CoordinatorConfig::new(&path)).unwrap_err();
    assert!(
        matches!(err, Error::Corruption { .. }),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn wal_lock_refuses_a_second_coordinator() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.wal");

    let (coordinator, _) = Coordinator::open(CoordinatorConfig::new(&path)).unwrap();
    let second = Coordinator::open(CoordinatorConfig::new(&path));
    assert!(matches!(second, Err(Error::WalLocked { .. })));

    coordinator.close().unwrap();
    assert!(Coordinator::open(CoordinatorConfig::new(&path)).is_ok());
}

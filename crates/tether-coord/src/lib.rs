//! # tether-coord
//!
//! The coordination kernel of the tether task scheduler: the
//! authoritative decision engine that assigns tasks to workers via
//! time-bounded leases, serializes every state change through an
//! append-only write-ahead log, and recovers deterministically by
//! replaying it.
//!
//! ## Components
//!
//! - [`wal`]: single-writer, append-only, durably-ordered record log
//! - [`state`]: in-memory authoritative state, mutated only by applying
//!   WAL records
//! - [`lease`]: grant selection and expiry decisions
//! - [`registry`]: soft worker bookkeeping (advisory only)
//! - [`coordinator`]: the request dispatcher, the single serialization
//!   point every authoritative change passes through
//! - [`expiry`]: the background expiry scan loop
//!
//! ## Guarantees
//!
//! - **Durable acknowledgement**: no response leaves before the record
//!   behind it is fsynced
//! - **Single writer**: one serialized `append → sync → apply → respond`
//!   critical section; WAL order is the observable order of events
//! - **Deterministic recovery**: replaying any WAL prefix reproduces the
//!   same authoritative state, clock-free
//! - **At-least-once**: a lease can expire mid-flight and the task runs
//!   again; the protocol's CANCELLED outcome tells the late worker its
//!   authority (not its correctness) is gone
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use chrono::Utc;
//! use std::time::Duration;
//! use tether_coord::config::CoordinatorConfig;
//! use tether_coord::coordinator::Coordinator;
//! use tether_coord::protocol::SubmitTask;
//! use tether_core::WorkerId;
//!
//! # async fn run() -> tether_coord::error::Result<()> {
//! let config = CoordinatorConfig::new("/var/lib/tether/tether.wal");
//! let (coordinator, report) = Coordinator::open(config)?;
//! println!("recovered {} records", report.records);
//!
//! let response = coordinator
//!     .submit_task(
//!         SubmitTask {
//!             payload: Bytes::from_static(b"resize img-1234"),
//!             execution_window: Duration::from_secs(300),
//!             retry_policy: None,
//!             request_id: None,
//!         },
//!         Utc::now(),
//!     )
//!     .await?;
//!
//! let worker: WorkerId = "worker-1".parse()?;
//! if let Some(offer) = coordinator.request_lease(worker, Utc::now()).await? {
//!     // hand offer.payload to the execution layer...
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod expiry;
pub mod lease;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod wal;

pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorStatus, ReplayReport, TaskView};
pub use error::{Error, Result};
pub use expiry::ExpiryTicker;
pub use protocol::{
    CompletionResponse, HeartbeatResponse, LeaseOffer, SubmitResponse, SubmitTask,
};
pub use state::{RetryBackoff, RetryPolicy, TaskState};
pub use wal::{SyncPolicy, Wal, WalRecord};

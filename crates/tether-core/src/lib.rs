//! # tether-core
//!
//! Shared primitives for the tether task scheduler coordinator.
//!
//! This crate provides the foundational types used across tether components:
//!
//! - **Identifiers**: Strongly-typed IDs for tasks, leases, workers, and requests
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `tether-core` is the only crate allowed to define shared primitives.
//! The coordination kernel (`tether-coord`) builds on these; nothing in
//! this crate knows about the WAL, leases, or scheduling.
//!
//! ## Example
//!
//! ```rust
//! use tether_core::{TaskId, WorkerId};
//!
//! let task = TaskId::generate();
//! let worker: WorkerId = "worker-7".parse().unwrap();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use id::{LeaseId, RequestId, TaskId, WorkerId};

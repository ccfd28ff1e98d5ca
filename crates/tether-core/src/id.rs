//! Strongly-typed identifiers for tether entities.
//!
//! Coordinator-generated identifiers ([`TaskId`], [`LeaseId`]) are ULIDs:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! Client-supplied identifiers ([`WorkerId`], [`RequestId`]) are opaque
//! strings validated on entry; the coordinator never interprets them.
//!
//! # Example
//!
//! ```rust
//! use tether_core::id::{LeaseId, TaskId};
//!
//! let task = TaskId::generate();
//! let lease = LeaseId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: TaskId = lease;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Maximum accepted length for client-supplied identifiers.
const MAX_OPAQUE_ID_LEN: usize = 256;

/// A unique identifier for a task.
///
/// Tasks are the unit of scheduled work. The embedded ULID timestamp
/// makes task IDs a deterministic tie-breaker for FIFO selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    /// Generates a new unique task ID.
    ///
    /// Uses ULID generation which is:
    /// - Lexicographically sortable by creation time
    /// - Globally unique without coordination
    /// - URL-safe and case-insensitive
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a task ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::invalid_id(format!("invalid task ID '{s}': {e}")))
    }
}

/// A unique identifier for a lease.
///
/// A lease is time-bounded, exclusive authority over one task attempt.
/// Lease IDs carry 80 bits of CSPRNG-backed randomness, so a worker
/// cannot forge the authority token for an attempt it was never granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Ulid);

impl LeaseId {
    /// Generates a new unique lease ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a lease ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LeaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::invalid_id(format!("invalid lease ID '{s}': {e}")))
    }
}

/// An opaque identifier for a worker process.
///
/// Workers name themselves; the coordinator treats the value as an opaque
/// key into advisory state and never derives meaning from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Validates and wraps a client-supplied worker identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty or longer than 256 bytes.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_opaque_id("worker ID", &value)?;
        Ok(Self(value))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// An opaque idempotency key for task submission.
///
/// Clients that retry a submission reuse the same request ID and receive
/// the originally assigned task ID back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Validates and wraps a client-supplied request identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty or longer than 256 bytes.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_opaque_id("request ID", &value)?;
        Ok(Self(value))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

fn validate_opaque_id(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_id(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_OPAQUE_ID_LEN {
        return Err(Error::invalid_id(format!(
            "{kind} exceeds {MAX_OPAQUE_ID_LEN} bytes"
        )));
    }
    Ok(())
}

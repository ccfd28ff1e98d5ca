//! The WAL record set and its payload codec.
//!
//! Eight record types cover every authoritative state change. Records
//! encode facts, not intent: each carries the minimum fields needed for
//! stand-alone apply, and each variant's precondition is enforced by the
//! applier, not here.
//!
//! ## Payload encoding
//!
//! Byte-deterministic little-endian fields:
//! - integers: fixed width (`u8`, `u32le`, `u64le`, `i64le`)
//! - timestamps: epoch nanoseconds as `i64le`
//! - ULID identifiers: 16 raw bytes
//! - strings and byte blobs: `u32le` length prefix + contents
//! - optional fields: `u8` presence flag, then the value if `1`
//!
//! Never appear as records: heartbeats that extend nothing, capacity
//! signals, metrics, failed scheduling attempts.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use ulid::Ulid;

use tether_core::{LeaseId, RequestId, TaskId, WorkerId};

use crate::state::task::{RetryBackoff, RetryPolicy};

/// Normative record type numbers. Stable across versions; the on-disk
/// log is unreadable if these change.
pub mod record_type {
    /// A new task entered the system.
    pub const TASK_CREATED: u8 = 1;
    /// A leased task completed successfully.
    pub const TASK_COMPLETED: u8 = 2;
    /// A leased task attempt failed.
    pub const TASK_FAILED: u8 = 3;
    /// A worker's authority was lost; history only.
    pub const TASK_CANCELLED: u8 = 4;
    /// A lease was granted for a waiting task.
    pub const LEASE_GRANTED: u8 = 5;
    /// A current lease's expiry was extended.
    pub const LEASE_EXTENDED: u8 = 6;
    /// A current lease expired by time.
    pub const LEASE_EXPIRED: u8 = 7;
    /// A task was administratively terminated.
    pub const TASK_DEAD: u8 = 8;
}

/// A decoded WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// New task, state=WAITING, attempt=0.
    TaskCreated {
        /// Coordinator-assigned task identifier.
        task_id: TaskId,
        /// Opaque work payload.
        payload: Bytes,
        /// Duration bound on ownership per attempt.
        execution_window: Duration,
        /// Retry bounds.
        retry_policy: RetryPolicy,
        /// Idempotency key, if the client supplied one.
        request_id: Option<RequestId>,
        /// Submission timestamp (metadata; FIFO selection key).
        created_at: DateTime<Utc>,
    },
    /// LEASED → COMPLETED under the current lease.
    TaskCompleted {
        /// The completed task.
        task_id: TaskId,
        /// The lease the completion arrived under.
        lease_id: LeaseId,
    },
    /// LEASED → WAITING or FAILED per retry policy.
    TaskFailed {
        /// The failed task.
        task_id: TaskId,
        /// The lease the failure arrived under.
        lease_id: LeaseId,
        /// Worker-reported failure reason.
        failure_reason: String,
    },
    /// Authority loss; no state change, history only.
    TaskCancelled {
        /// The task the stale report referenced.
        task_id: TaskId,
        /// The non-current (or expired) lease the report arrived under.
        lease_id: LeaseId,
    },
    /// WAITING → LEASED; creates the lease and increments the attempt.
    LeaseGranted {
        /// The granted task.
        task_id: TaskId,
        /// Fresh lease identifier.
        lease_id: LeaseId,
        /// The worker receiving authority.
        worker_id: WorkerId,
        /// The attempt this grant begins (prior attempt + 1).
        attempt: u32,
        /// Absolute expiry of the lease.
        lease_expiry: DateTime<Utc>,
        /// Grant timestamp (metadata).
        granted_at: DateTime<Utc>,
    },
    /// Bumps the current lease's expiry.
    LeaseExtended {
        /// The extended lease.
        lease_id: LeaseId,
        /// New absolute expiry; strictly later than the old one.
        new_lease_expiry: DateTime<Utc>,
    },
    /// LEASED → WAITING by time revocation.
    LeaseExpired {
        /// The task losing its lease.
        task_id: TaskId,
        /// The expired lease.
        lease_id: LeaseId,
    },
    /// Any non-terminal state → DEAD (administrative).
    TaskDead {
        /// The terminated task.
        task_id: TaskId,
        /// Operator-supplied reason.
        reason: String,
    },
}

impl WalRecord {
    /// Returns the normative on-disk type number.
    #[must_use]
    pub const fn record_type(&self) -> u8 {
        match self {
            Self::TaskCreated { .. } => record_type::TASK_CREATED,
            Self::TaskCompleted { .. } => record_type::TASK_COMPLETED,
            Self::TaskFailed { .. } => record_type::TASK_FAILED,
            Self::TaskCancelled { .. } => record_type::TASK_CANCELLED,
            Self::LeaseGranted { .. } => record_type::LEASE_GRANTED,
            Self::LeaseExtended { .. } => record_type::LEASE_EXTENDED,
            Self::LeaseExpired { .. } => record_type::LEASE_EXPIRED,
            Self::TaskDead { .. } => record_type::TASK_DEAD,
        }
    }

    /// Returns a stable name for metrics and logs.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task_created",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::LeaseGranted { .. } => "lease_granted",
            Self::LeaseExtended { .. } => "lease_extended",
            Self::LeaseExpired { .. } => "lease_expired",
            Self::TaskDead { .. } => "task_dead",
        }
    }

    /// Returns the task this record mentions, if it names one directly.
    #[must_use]
    pub const fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id, .. }
            | Self::LeaseGranted { task_id, .. }
            | Self::LeaseExpired { task_id, .. }
            | Self::TaskDead { task_id, .. } => Some(*task_id),
            Self::LeaseExtended { .. } => None,
        }
    }

    /// Encodes the record payload (everything between the frame's type
    /// byte and its CRC).
    #[must_use]
    pub fn encode_payload(&self) -> Bytes {
        let mut w = PayloadWriter::new();
        match self {
            Self::TaskCreated {
                task_id,
                payload,
                execution_window,
                retry_policy,
                request_id,
                created_at,
            } => {
                w.ulid(task_id.as_ulid());
                w.timestamp(*created_at);
                w.duration(*execution_window);
                w.u32(retry_policy.max_attempts);
                match retry_policy.backoff {
                    RetryBackoff::Fixed(delay) => {
                        w.u8(BACKOFF_FIXED);
                        w.duration(delay);
                    }
                }
                match request_id {
                    Some(id) => {
                        w.u8(1);
                        w.str(id.as_str());
                    }
                    None => w.u8(0),
                }
                w.bytes(payload);
            }
            Self::TaskCompleted { task_id, lease_id }
            | Self::TaskCancelled { task_id, lease_id }
            | Self::LeaseExpired { task_id, lease_id } => {
                w.ulid(task_id.as_ulid());
                w.ulid(lease_id.as_ulid());
            }
            Self::TaskFailed {
                task_id,
                lease_id,
                failure_reason,
            } => {
                w.ulid(task_id.as_ulid());
                w.ulid(lease_id.as_ulid());
                w.str(failure_reason);
            }
            Self::LeaseGranted {
                task_id,
                lease_id,
                worker_id,
                attempt,
                lease_expiry,
                granted_at,
            } => {
                w.ulid(task_id.as_ulid());
                w.ulid(lease_id.as_ulid());
                w.u32(*attempt);
                w.timestamp(*lease_expiry);
                w.timestamp(*granted_at);
                w.str(worker_id.as_str());
            }
            Self::LeaseExtended {
                lease_id,
                new_lease_expiry,
            } => {
                w.ulid(lease_id.as_ulid());
                w.timestamp(*new_lease_expiry);
            }
            Self::TaskDead { task_id, reason } => {
                w.ulid(task_id.as_ulid());
                w.str(reason);
            }
        }
        w.finish()
    }

    /// Decodes a record from its type number and payload bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] on unknown type numbers, truncated
    /// fields, invalid UTF-8, or trailing bytes.
    pub fn decode(record_type: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = PayloadReader::new(payload);
        let record = match record_type {
            record_type::TASK_CREATED => {
                let task_id = TaskId::from_ulid(r.ulid("task_id")?);
                let created_at = r.timestamp("created_at")?;
                let execution_window = r.duration("execution_window")?;
                let max_attempts = r.u32("max_attempts")?;
                let backoff = match r.u8("backoff_tag")? {
                    BACKOFF_FIXED => RetryBackoff::Fixed(r.duration("backoff_delay")?),
                    tag => {
                        return Err(DecodeError::InvalidValue {
                            field: "backoff_tag",
                            message: format!("unknown backoff strategy {tag}"),
                        });
                    }
                };
                let request_id = match r.u8("request_id_flag")? {
                    0 => None,
                    1 => {
                        let raw = r.str("request_id")?;
                        Some(RequestId::new(raw).map_err(|e| DecodeError::InvalidValue {
                            field: "request_id",
                            message: e.to_string(),
                        })?)
                    }
                    flag => {
                        return Err(DecodeError::InvalidValue {
                            field: "request_id_flag",
                            message: format!("invalid presence flag {flag}"),
                        });
                    }
                };
                let payload = r.bytes("payload")?;
                Self::TaskCreated {
                    task_id,
                    payload,
                    execution_window,
                    retry_policy: RetryPolicy {
                        max_attempts,
                        backoff,
                    },
                    request_id,
                    created_at,
                }
            }
            record_type::TASK_COMPLETED => Self::TaskCompleted {
                task_id: TaskId::from_ulid(r.ulid("task_id")?),
                lease_id: LeaseId::from_ulid(r.ulid("lease_id")?),
            },
            record_type::TASK_FAILED => Self::TaskFailed {
                task_id: TaskId::from_ulid(r.ulid("task_id")?),
                lease_id: LeaseId::from_ulid(r.ulid("lease_id")?),
                failure_reason: r.str("failure_reason")?,
            },
            record_type::TASK_CANCELLED => Self::TaskCancelled {
                task_id: TaskId::from_ulid(r.ulid("task_id")?),
                lease_id: LeaseId::from_ulid(r.ulid("lease_id")?),
            },
            record_type::LEASE_GRANTED => {
                let task_id = TaskId::from_ulid(r.ulid("task_id")?);
                let lease_id = LeaseId::from_ulid(r.ulid("lease_id")?);
                let attempt = r.u32("attempt")?;
                let lease_expiry = r.timestamp("lease_expiry")?;
                let granted_at = r.timestamp("granted_at")?;
                let worker_raw = r.str("worker_id")?;
                let worker_id =
                    WorkerId::new(worker_raw).map_err(|e| DecodeError::InvalidValue {
                        field: "worker_id",
                        message: e.to_string(),
                    })?;
                Self::LeaseGranted {
                    task_id,
                    lease_id,
                    worker_id,
                    attempt,
                    lease_expiry,
                    granted_at,
                }
            }
            record_type::LEASE_EXTENDED => Self::LeaseExtended {
                lease_id: LeaseId::from_ulid(r.ulid("lease_id")?),
                new_lease_expiry: r.timestamp("new_lease_expiry")?,
            },
            record_type::LEASE_EXPIRED => Self::LeaseExpired {
                task_id: TaskId::from_ulid(r.ulid("task_id")?),
                lease_id: LeaseId::from_ulid(r.ulid("lease_id")?),
            },
            record_type::TASK_DEAD => Self::TaskDead {
                task_id: TaskId::from_ulid(r.ulid("task_id")?),
                reason: r.str("reason")?,
            },
            other => return Err(DecodeError::UnknownRecordType(other)),
        };
        r.finish()?;
        Ok(record)
    }
}

/// Backoff strategy tag: fixed delay.
const BACKOFF_FIXED: u8 = 0;

/// Errors produced while decoding a record payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame's type byte names no known record.
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),

    /// The payload ended inside a field.
    #[error("payload truncated while reading {field}")]
    Truncated {
        /// The field being read.
        field: &'static str,
    },

    /// Bytes remained after the final field.
    #[error("{remaining} trailing bytes after final field")]
    TrailingBytes {
        /// How many bytes were left over.
        remaining: usize,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 {
        /// The field being read.
        field: &'static str,
    },

    /// A field held a structurally valid but semantically invalid value.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// The field being read.
        field: &'static str,
        /// Description of the failure.
        message: String,
    },
}

/// Append-only writer for deterministic payload bytes.
struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    fn u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    fn u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    fn ulid(&mut self, value: Ulid) {
        self.buf.put_slice(&value.to_bytes());
    }

    /// Epoch nanoseconds. Timestamps past the i64 nanosecond horizon
    /// (year 2262) saturate; config validation keeps expiries far below.
    fn timestamp(&mut self, value: DateTime<Utc>) {
        self.buf
            .put_i64_le(value.timestamp_nanos_opt().unwrap_or(i64::MAX));
    }

    fn duration(&mut self, value: Duration) {
        self.buf
            .put_u64_le(u64::try_from(value.as_nanos()).unwrap_or(u64::MAX));
    }

    fn str(&mut self, value: &str) {
        self.bytes(value.as_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.buf
            .put_u32_le(u32::try_from(value.len()).unwrap_or(u32::MAX));
        self.buf.put_slice(value);
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked reader over payload bytes.
struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated { field });
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, field)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let mut bytes = self.take(4, field)?;
        Ok(bytes.get_u32_le())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        let mut bytes = self.take(8, field)?;
        Ok(bytes.get_u64_le())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        let mut bytes = self.take(8, field)?;
        Ok(bytes.get_i64_le())
    }

    fn ulid(&mut self, field: &'static str) -> Result<Ulid, DecodeError> {
        let raw = self.take(16, field)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(Ulid::from_bytes(bytes))
    }

    fn timestamp(&mut self, field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
        Ok(DateTime::from_timestamp_nanos(self.i64(field)?))
    }

    fn duration(&mut self, field: &'static str) -> Result<Duration, DecodeError> {
        Ok(Duration::from_nanos(self.u64(field)?))
    }

    fn str(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u32(field)? as usize;
        let raw = self.take(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { field })
    }

    fn bytes(&mut self, field: &'static str) -> Result<Bytes, DecodeError> {
        let len = self.u32(field)? as usize;
        Ok(Bytes::copy_from_slice(self.take(len, field)?))
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes {
                remaining: self.buf.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_created() -> WalRecord {
        WalRecord::TaskCreated {
            task_id: TaskId::generate(),
            payload: Bytes::from_static(b"encode me"),
            execution_window: Duration::from_secs(300),
            retry_policy: RetryPolicy {
                max_attempts: 2,
                backoff: RetryBackoff::Fixed(Duration::from_millis(1500)),
            },
            request_id: Some(RequestId::new("req-1").unwrap()),
            created_at: Utc.with_ymd_and_hms(2026, 2, 14, 8, 30, 0).unwrap(),
        }
    }

    fn roundtrip(record: &WalRecord) -> WalRecord {
        let payload = record.encode_payload();
        WalRecord::decode(record.record_type(), &payload).unwrap()
    }

    #[test]
    fn task_created_roundtrip() {
        let record = sample_created();
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn task_created_without_request_id_roundtrip() {
        let record = WalRecord::TaskCreated {
            task_id: TaskId::generate(),
            payload: Bytes::new(),
            execution_window: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            request_id: None,
            created_at: Utc.with_ymd_and_hms(2026, 2, 14, 8, 30, 0).unwrap(),
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn lease_granted_roundtrip() {
        let now = Utc.with_ymd_and_hms(2026, 2, 14, 9, 0, 0).unwrap();
        let record = WalRecord::LeaseGranted {
            task_id: TaskId::generate(),
            lease_id: LeaseId::generate(),
            worker_id: WorkerId::new("worker-α").unwrap(),
            attempt: 3,
            lease_expiry: now + chrono::Duration::seconds(30),
            granted_at: now,
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn task_failed_roundtrip_preserves_reason() {
        let record = WalRecord::TaskFailed {
            task_id: TaskId::generate(),
            lease_id: LeaseId::generate(),
            failure_reason: "oom".into(),
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn encoding_is_byte_deterministic() {
        let record = sample_created();
        assert_eq!(record.encode_payload(), record.encode_payload());
    }

    #[test]
    fn type_numbers_are_normative() {
        let task_id = TaskId::generate();
        let lease_id = LeaseId::generate();
        assert_eq!(sample_created().record_type(), 1);
        assert_eq!(
            WalRecord::TaskCompleted { task_id, lease_id }.record_type(),
            2
        );
        assert_eq!(
            WalRecord::TaskFailed {
                task_id,
                lease_id,
                failure_reason: String::new()
            }
            .record_type(),
            3
        );
        assert_eq!(
            WalRecord::TaskCancelled { task_id, lease_id }.record_type(),
            4
        );
        assert_eq!(
            WalRecord::LeaseGranted {
                task_id,
                lease_id,
                worker_id: WorkerId::new("w").unwrap(),
                attempt: 1,
                lease_expiry: Utc::now(),
                granted_at: Utc::now(),
            }
            .record_type(),
            5
        );
        assert_eq!(
            WalRecord::LeaseExtended {
                lease_id,
                new_lease_expiry: Utc::now()
            }
            .record_type(),
            6
        );
        assert_eq!(
            WalRecord::LeaseExpired { task_id, lease_id }.record_type(),
            7
        );
        assert_eq!(
            WalRecord::TaskDead {
                task_id,
                reason: String::new()
            }
            .record_type(),
            8
        );
    }

    #[test]
    fn unknown_type_rejected() {
        let err = WalRecord::decode(99, &[]).unwrap_err();
        assert_eq!(err, DecodeError::UnknownRecordType(99));
    }

    #[test]
    fn truncated_payload_rejected() {
        let record = sample_created();
        let payload = record.encode_payload();
        let err = WalRecord::decode(record.record_type(), &payload[..payload.len() - 3]);
        assert!(matches!(err, Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let record = sample_created();
        let mut payload = record.encode_payload().to_vec();
        payload.push(0);
        let err = WalRecord::decode(record.record_type(), &payload);
        assert!(matches!(err, Err(DecodeError::TrailingBytes { .. })));
    }
}

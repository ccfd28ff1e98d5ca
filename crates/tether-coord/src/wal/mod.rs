//! The write-ahead log: a single-writer, append-only, durably-ordered
//! record log with deterministic replay.
//!
//! ## Contract
//!
//! - [`Wal::append`] writes a framed record at the log tail. Bytes reach
//!   the OS file; durability requires a subsequent [`Wal::sync`].
//! - [`Wal::sync`] fsyncs. Every record appended before a successful
//!   return survives process crash and OS reboot.
//! - [`Wal::replay`] decodes records from offset zero in order, invoking
//!   the apply function exactly once per record. A torn or CRC-failing
//!   record *at the tail* is discarded (and the file truncated to the
//!   last valid frame, so future appends never land after garbage);
//!   corruption anywhere earlier is fatal.
//! - [`Wal::close`] syncs and releases the file.
//!
//! ## Exclusivity
//!
//! Exactly one logical writer. Within the process, `&mut self` enforces
//! serialization; across processes, an advisory `flock` on the WAL path
//! refuses a second coordinator instance.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{Error, Result};

pub mod frame;
pub mod record;

pub use record::{DecodeError, WalRecord};

/// When appended records are fsynced.
///
/// Applies only to records that carry no client acknowledgement (the
/// expiry scan's batch). Client-acknowledged records are always synced
/// before the response is released, regardless of policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Sync once this many records are pending.
    pub batch_size: u32,
    /// Sync once this much time has passed since the last sync.
    pub batch_interval: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            batch_size: 1,
            batch_interval: Duration::ZERO,
        }
    }
}

/// Outcome of a replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Number of records applied.
    pub records: u64,
    /// Bytes of valid log consumed; the append position after replay.
    pub valid_bytes: u64,
    /// Whether a torn or checksum-failing tail record was discarded.
    pub truncated_tail: bool,
}

/// The write-ahead log over one local file.
#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Logical end of the log; the next append lands here.
    offset: u64,
    /// Records appended since the last sync.
    pending: u32,
    last_sync: Instant,
    policy: SyncPolicy,
}

impl Wal {
    /// Opens (creating if absent) the WAL at `path` and takes the
    /// advisory writer lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WalLocked`] if another coordinator instance holds
    /// the lock, or [`Error::Durability`] on I/O failure.
    pub fn open(path: impl AsRef<Path>, policy: SyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::durability("open", e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::WalLocked {
                path: path.display().to_string(),
            });
        }

        let offset = file
            .metadata()
            .map_err(|e| Error::durability("open", e))?
            .len();

        Ok(Self {
            file,
            path,
            offset,
            pending: 0,
            last_sync: Instant::now(),
            policy,
        })
    }

    /// Returns the WAL file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the logical end of the log in bytes.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the number of appended-but-unsynced records.
    #[must_use]
    pub const fn pending_records(&self) -> u32 {
        self.pending
    }

    /// Appends a record at the log tail and returns its frame offset.
    ///
    /// Does not imply durability; callers that acknowledge a client must
    /// [`Wal::sync`] first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Durability`] on I/O failure; the operation is
    /// treated as never having happened.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64> {
        let payload = record.encode_payload();
        let framed = frame::encode(record.record_type(), &payload);

        let at = self.offset;
        self.file
            .seek(SeekFrom::Start(at))
            .and_then(|_| self.file.write_all(&framed))
            .map_err(|e| Error::durability("append", e))?;

        self.offset += framed.len() as u64;
        self.pending = self.pending.saturating_add(1);
        Ok(at)
    }

    /// Forces an fsync. All previously appended records are durable after
    /// a successful return.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Durability`] on fsync failure.
    pub fn sync(&mut self) -> Result<()> {
        // sync_all, not sync_data: appends grow the file, and the new
        // length must survive the crash too.
        self.file
            .sync_all()
            .map_err(|e| Error::durability("sync", e))?;
        self.pending = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Syncs iff the batch policy thresholds are met.
    ///
    /// Returns whether a sync happened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Durability`] on fsync failure.
    pub fn sync_per_policy(&mut self) -> Result<bool> {
        if self.pending == 0 {
            return Ok(false);
        }
        if self.pending >= self.policy.batch_size
            || self.last_sync.elapsed() >= self.policy.batch_interval
        {
            self.sync()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Replays the log from offset zero, invoking `apply_fn(seq, offset,
    /// record)` once per valid record in order.
    ///
    /// Stops at EOF or at a torn/CRC-failing tail record, which is
    /// discarded and truncated away. Errors from `apply_fn` abort the
    /// replay and propagate unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] for any invalid record before the
    /// tail, or [`Error::Durability`] on I/O failure.
    pub fn replay(
        &mut self,
        mut apply_fn: impl FnMut(u64, u64, WalRecord) -> Result<()>,
    ) -> Result<ReplayStats> {
        let file_len = self
            .file
            .metadata()
            .map_err(|e| Error::durability("replay", e))?
            .len();

        let mut consumed: u64 = 0;
        let mut records: u64 = 0;
        let mut truncated_tail = false;

        {
            self.file
                .seek(SeekFrom::Start(0))
                .map_err(|e| Error::durability("replay", e))?;
            let mut reader = BufReader::new(&self.file);

            loop {
                let mut len_buf = [0u8; frame::LENGTH_PREFIX_LEN];
                match read_exact_or_eof(&mut reader, &mut len_buf)? {
                    ReadOutcome::Eof => break,
                    ReadOutcome::Partial => {
                        truncated_tail = true;
                        break;
                    }
                    ReadOutcome::Full => {}
                }

                let body_len = u32::from_le_bytes(len_buf);
                if body_len > frame::MAX_FRAME_LEN {
                    return Err(Error::corruption(
                        consumed,
                        format!("frame length {body_len} exceeds maximum"),
                    ));
                }

                let mut body = vec![0u8; body_len as usize];
                match read_exact_or_eof(&mut reader, &mut body)? {
                    ReadOutcome::Eof | ReadOutcome::Partial => {
                        truncated_tail = true;
                        break;
                    }
                    ReadOutcome::Full => {}
                }

                let frame_end = consumed + (frame::LENGTH_PREFIX_LEN as u64) + u64::from(body_len);
                match frame::decode(&body) {
                    Ok((record_type, payload)) => {
                        let record = WalRecord::decode(record_type, payload)
                            .map_err(|e| Error::corruption(consumed, e.to_string()))?;
                        apply_fn(records, consumed, record)?;
                        records += 1;
                        consumed = frame_end;
                    }
                    Err(err @ frame::FrameError::ChecksumMismatch { .. }) => {
                        if frame_end == file_len {
                            // Torn write at the tail: discard silently.
                            truncated_tail = true;
                            break;
                        }
                        return Err(Error::corruption(consumed, err.to_string()));
                    }
                    Err(err) => {
                        return Err(Error::corruption(consumed, err.to_string()));
                    }
                }
            }
        }

        if consumed < file_len {
            truncated_tail = true;
            self.file
                .set_len(consumed)
                .and_then(|_| self.file.sync_all())
                .map_err(|e| Error::durability("truncate", e))?;
        }

        self.offset = consumed;
        self.pending = 0;
        tracing::debug!(
            records,
            valid_bytes = consumed,
            truncated_tail,
            path = %self.path.display(),
            "wal replay complete"
        );

        Ok(ReplayStats {
            records,
            valid_bytes: consumed,
            truncated_tail,
        })
    }

    /// Syncs and releases the WAL. The advisory lock drops with the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Durability`] on fsync failure.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .map_err(|e| Error::durability("replay", e))?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{LeaseId, TaskId};

    fn completion(task_id: TaskId) -> WalRecord {
        WalRecord::TaskCompleted {
            task_id,
            lease_id: LeaseId::generate(),
        }
    }

    #[test]
    fn append_replay_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.wal");

        let first = completion(TaskId::generate());
        let second = completion(TaskId::generate());
        {
            let mut wal = Wal::open(&path, SyncPolicy::default()).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
            wal.close().unwrap();
        }

        let mut wal = Wal::open(&path, SyncPolicy::default()).unwrap();
        let mut seen = Vec::new();
        let stats = wal
            .replay(|seq, _offset, record| {
                seen.push((seq, record));
                Ok(())
            })
            .unwrap();

        assert_eq!(stats.records, 2);
        assert!(!stats.truncated_tail);
        assert_eq!(seen[0], (0, first));
        assert_eq!(seen[1], (1, second));
        assert_eq!(stats.valid_bytes, wal.offset());
    }

    #[test]
    fn torn_tail_is_discarded_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.wal");

        let keep = completion(TaskId::generate());
        let keep_len = {
            let mut wal = Wal::open(&path, SyncPolicy::default()).unwrap();
            wal.append(&keep).unwrap();
            let keep_len = wal.offset();
            wal.append(&completion(TaskId::generate())).unwrap();
            wal.close().unwrap();
            keep_len
        };

        // Chop the final record mid-frame, as a crash between write and
        // sync would.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(keep_len + 7).unwrap();
        drop(file);

        let mut wal = Wal::open(&path, SyncPolicy::default()).unwrap();
        let mut count = 0;
        let stats = wal
            .replay(|_, _, record| {
                assert_eq!(record, keep);
                count += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(count, 1);
        assert!(stats.truncated_tail);
        assert_eq!(stats.valid_bytes, keep_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), keep_len);
    }

    #[test]
    fn corrupt_tail_crc_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.wal");

        let keep_len = {
            let mut wal = Wal::open(&path, SyncPolicy::default()).unwrap();
            wal.append(&completion(TaskId::generate())).unwrap();
            let keep_len = wal.offset();
            wal.append(&completion(TaskId::generate())).unwrap();
            wal.close().unwrap();
            keep_len
        };

        // Flip a payload bit inside the final record.
        let mut bytes = std::fs::read(&path).unwrap();
        let flip_at = keep_len as usize + 8;
        bytes[flip_at] ^= 0x40;
        std::fs::write(&path, &bytes).unwrap();

        let mut wal = Wal::open(&path, SyncPolicy::default()).unwrap();
        let mut count = 0;
        let stats = wal.replay(|_, _, _| {
            count += 1;
            Ok(())
        });

        let stats = stats.unwrap();
        assert_eq!(count, 1);
        assert!(stats.truncated_tail);
    }

    #[test]
    fn mid_log_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.wal");

        {
            let mut wal = Wal::open(&path, SyncPolicy::default()).unwrap();
            wal.append(&completion(TaskId::generate())).unwrap();
            wal.append(&completion(TaskId::generate())).unwrap();
            wal.close().unwrap();
        }

        // Flip a bit inside the FIRST record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8] ^= 0x40;
        std::fs::write(&path, &bytes).unwrap();

        let mut wal = Wal::open(&path, SyncPolicy::default()).unwrap();
        let err = wal.replay(|_, _, _| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Corruption { offset: 0, .. }));
    }

    #[test]
    fn second_open_is_refused_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.wal");

        let wal = Wal::open(&path, SyncPolicy::default()).unwrap();
        let second = Wal::open(&path, SyncPolicy::default());
        assert!(matches!(second, Err(Error::WalLocked { .. })));
        drop(wal);

        // Lock released with the file handle.
        assert!(Wal::open(&path, SyncPolicy::default()).is_ok());
    }

    #[test]
    fn sync_policy_batches_unacknowledged_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.wal");
        let policy = SyncPolicy {
            batch_size: 3,
            batch_interval: Duration::from_secs(3600),
        };

        let mut wal = Wal::open(&path, policy).unwrap();
        wal.append(&completion(TaskId::generate())).unwrap();
        assert!(!wal.sync_per_policy().unwrap());
        wal.append(&completion(TaskId::generate())).unwrap();
        assert!(!wal.sync_per_policy().unwrap());
        wal.append(&completion(TaskId::generate())).unwrap();
        assert!(wal.sync_per_policy().unwrap());
        assert_eq!(wal.pending_records(), 0);
    }
}

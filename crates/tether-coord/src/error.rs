//! Error types for the coordination kernel.
//!
//! Validation failures and precondition violations never surface here;
//! they become `REJECTED` (or `CANCELLED`) protocol responses before any
//! WAL append. This enum covers the failures that terminate a request at
//! the transport level or refuse coordinator startup.

/// The result type used throughout tether-coord.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the coordination kernel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A WAL append or sync failed. The operation is treated as never
    /// having happened; the caller must retry with the same request ID.
    #[error("wal durability failure during {operation}: {source}")]
    Durability {
        /// The WAL operation that failed (`open`, `append`, `sync`, ...).
        operation: &'static str,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A record before the log tail failed frame or checksum validation.
    /// Fatal: the coordinator refuses to start on a corrupt log.
    #[error("wal corrupted at offset {offset}: {message}")]
    Corruption {
        /// Byte offset of the corrupt record's frame.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// An applier precondition failed during replay. Fatal: implies log
    /// corruption or a version mismatch.
    #[error("replay invariant violated at record {seq} (offset {offset}): {message}")]
    Invariant {
        /// Zero-based sequence number of the offending record.
        seq: u64,
        /// Byte offset of the offending record's frame.
        offset: u64,
        /// Description of the violated precondition.
        message: String,
    },

    /// Another coordinator instance holds the advisory lock on the WAL.
    #[error("wal at {path} is locked by another coordinator instance")]
    WalLocked {
        /// The contested WAL path.
        path: String,
    },

    /// A configuration value was malformed or out of range.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the failure.
        message: String,
    },

    /// An error from tether-core.
    #[error("core error: {0}")]
    Core(#[from] tether_core::Error),
}

impl Error {
    /// Creates a new durability error for the given WAL operation.
    #[must_use]
    pub fn durability(operation: &'static str, source: std::io::Error) -> Self {
        Self::Durability { operation, source }
    }

    /// Creates a new corruption error.
    #[must_use]
    pub fn corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

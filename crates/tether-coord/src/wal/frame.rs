//! On-disk record framing.
//!
//! Each record occupies one frame:
//!
//! ```text
//! length:u32le | type:u8 | payload:bytes | crc32:u32le
//! ```
//!
//! `length` counts everything after itself (`type + payload + crc32`).
//! The CRC covers `type | payload`. The layout guarantees that a torn
//! write manifests either as a short tail or as a CRC mismatch on the
//! final frame; any earlier frame that passes length validation must also
//! pass its CRC, otherwise the log is corrupt.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;

/// Size of the `length` prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the `type` byte.
pub const TYPE_LEN: usize = 1;

/// Size of the trailing CRC32.
pub const CRC_LEN: usize = 4;

/// Upper bound on a frame body. A length beyond this cannot come from a
/// torn append (the length field is written as part of a valid frame) and
/// is treated as corruption.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Errors produced while validating a frame body.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// The declared body length is below the fixed overhead.
    #[error("frame length {length} is below minimum {min}")]
    UndersizedFrame {
        /// The declared length.
        length: usize,
        /// The minimum valid length (`type + crc32`).
        min: usize,
    },

    /// The declared body length exceeds [`MAX_FRAME_LEN`].
    #[error("frame length {length} exceeds maximum {max}")]
    OversizedFrame {
        /// The declared length.
        length: u64,
        /// The configured maximum.
        max: u32,
    },

    /// The stored CRC32 does not match the computed one.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// CRC32 read from the frame trailer.
        stored: u32,
        /// CRC32 computed over `type | payload`.
        computed: u32,
    },
}

/// Computes the CRC32 over `type | payload`.
#[must_use]
pub fn checksum(record_type: u8, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(payload);
    hasher.finalize()
}

/// Encodes a complete frame, length prefix included.
#[must_use]
pub fn encode(record_type: u8, payload: &[u8]) -> Bytes {
    let body_len = TYPE_LEN + payload.len() + CRC_LEN;
    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body_len);
    frame.put_u32_le(u32::try_from(body_len).unwrap_or(u32::MAX));
    frame.put_u8(record_type);
    frame.put_slice(payload);
    frame.put_u32_le(checksum(record_type, payload));
    frame.freeze()
}

/// Validates a frame body (everything after the length prefix) and
/// returns the record type and payload slice.
///
/// # Errors
///
/// Returns [`FrameError::UndersizedFrame`] for bodies below the fixed
/// overhead and [`FrameError::ChecksumMismatch`] when the trailer CRC
/// does not cover the body.
pub fn decode(body: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    let min = TYPE_LEN + CRC_LEN;
    if body.len() < min {
        return Err(FrameError::UndersizedFrame {
            length: body.len(),
            min,
        });
    }

    let payload = &body[TYPE_LEN..body.len() - CRC_LEN];
    let mut head = body;
    let record_type = head.get_u8();
    let mut trailer = &body[body.len() - CRC_LEN..];
    let stored = trailer.get_u32_le();
    let computed = checksum(record_type, payload);

    if stored != computed {
        return Err(FrameError::ChecksumMismatch { stored, computed });
    }

    Ok((record_type, payload))
}

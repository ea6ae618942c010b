//! Wire-level error type.
//!
//! Pure parsing/encoding failures only — nothing here ever touches I/O.
//! Connection- and transport-level errors live in `gitmirror-core` and wrap
//! these via `From`.

use thiserror::Error;

/// Errors produced by the packet-line codec and the ref/capability parsers
/// built on top of it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer than 4 bytes were available to read a packet-line header.
    #[error("packet-line buffer too short: need at least 4 bytes, got {actual}")]
    ShortBuffer {
        /// Bytes actually available.
        actual: usize,
    },

    /// The header declared more payload than the buffer actually holds.
    #[error("truncated packet-line payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload {
        /// Payload length declared by the header.
        expected: usize,
        /// Payload bytes actually available.
        actual: usize,
    },

    /// The 4-byte header was not valid ASCII hex.
    #[error("packet-line header is not valid hex: {0:?}")]
    InvalidHeader([u8; 4]),

    /// `encode_data` was asked to frame a payload larger than the wire
    /// format can express.
    #[error("data payload of {len} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Payload length that was rejected.
        len: usize,
        /// Maximum payload length allowed.
        max: usize,
    },

    /// A ref-advertisement line did not match `"<object-id> <name>"`.
    #[error("malformed ref line: {0:?}")]
    MalformedRefLine(String),

    /// An object id was not a lowercase hex string of the expected width.
    #[error("malformed object id: {0:?}")]
    MalformedObjectId(String),
}

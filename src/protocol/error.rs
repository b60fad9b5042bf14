//! Protocol error types.

use thiserror::Error;

/// Errors related to protocol message handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("message too long: max {max}, got {got}")]
    MessageTooLong { max: usize, got: usize },

    #[error("length field inconsistent: declared {declared}, available {available}")]
    LengthMismatch { declared: usize, available: usize },

    #[error("payload checksum mismatch: header 0x{expected:08x}, computed 0x{actual:08x}")]
    BadChecksum { expected: u32, actual: u32 },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// True for the decode failures the spec groups under MALFORMED:
    /// short, unknown-kind, or length-inconsistent datagrams.
    pub fn is_malformed(&self) -> bool {
        !matches!(
            self,
            ProtocolError::BadChecksum { .. } | ProtocolError::UnsupportedVersion(_)
        )
    }
}

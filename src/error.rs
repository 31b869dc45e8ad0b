//! # Error Types
//!
//! Error handling for schema compilation, packet codecs and the secure frame pipeline.
//!
//! ## Error Categories
//! - **Schema Errors**: Raised while compiling a protocol definition; fatal for that version
//! - **Codec Errors**: Truncated input, malformed bytes, values that do not fit their type
//! - **Envelope Errors**: Unknown packet id or packet name
//! - **Frame Errors**: Integrity violations and corrupt payloads; fatal for the connection
//! - **Session Errors**: I/O, timeouts and closed transports
//!
//! `Truncated` is the only recoverable read failure: the caller may wait for more bytes
//! and retry. Everything raised by the frame pipeline on the receive path terminates the
//! connection, see [`ProtocolError::is_fatal`].
//!
//! ## Example Usage
//! ```rust
//! use bedrock_wire::error::{ProtocolError, Result};
//!
//! fn first_byte(buf: &[u8]) -> Result<u8> {
//!     buf.first().copied().ok_or(ProtocolError::Truncated {
//!         needed: 1,
//!         available: 0,
//!     })
//! }
//!
//! assert!(first_byte(&[]).unwrap_err().is_incomplete());
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Schema compilation
    pub const ERR_NATIVE_WITHOUT_IMPL: &str = "type is declared native but no implementation is registered";
    pub const ERR_DERIVED_WIDTH_OUTSIDE_CONTAINER: &str =
        "enum width selector is only valid as a container field";

    /// Codec errors
    pub const ERR_VARINT_TOO_LONG: &str = "varint exceeds maximum encoded length";
    pub const ERR_INVALID_UTF8: &str = "string is not valid UTF-8";
    pub const ERR_NESTING_TOO_DEEP: &str = "tagged tree nesting exceeds maximum depth";
    pub const ERR_COLLECTION_TOO_LONG: &str = "collection length exceeds configured maximum";
    pub const ERR_TOO_MANY_EMPTY_ELEMENTS: &str = "array holds too many zero-length elements";

    /// Frame pipeline
    pub const ERR_COUNTER_EXHAUSTED: &str = "frame counter exhausted";
    pub const ERR_PIPELINE_POISONED: &str = "receive pipeline already failed an integrity check";
    pub const ERR_SEND_INTERRUPTED: &str =
        "an earlier sealed frame was never delivered; the send keystream is out of step";
    pub const ERR_RECV_INTERRUPTED: &str = "an earlier verified frame was never delivered";
    pub const ERR_BAD_KEY_LENGTH: &str = "secret key must be 32 bytes";
    pub const ERR_BAD_IV_LENGTH: &str = "initialization vector must be 16 bytes";
    pub const ERR_COMPRESSION_FAILED: &str = "Compression failed";
    pub const ERR_BAD_COMPRESSION_LEVEL: &str = "compression level must be between 0 and 9";
}

// ProtocolError is the primary error type for all wire operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Truncated input: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Output buffer too small: need {needed} bytes, {available} available")]
    BufferOverflow { needed: usize, available: usize },

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Unknown packet id: {0}")]
    UnknownPacketId(u64),

    #[error("Unknown packet name: {0}")]
    UnknownPacketName(String),

    #[error("Integrity violation at frame counter {counter}")]
    IntegrityViolation { counter: u64 },

    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("Re-encoded packet `{name}` does not match the received bytes")]
    RoundTripMismatch { name: String },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Whether the error leaves the connection unusable.
    ///
    /// Integrity and payload failures mean the keystream or counters are out of step
    /// with the peer; nothing after them can be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::IntegrityViolation { .. }
                | ProtocolError::CorruptPayload(_)
                | ProtocolError::SecurityError(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::Io(_)
        )
    }

    /// Whether more input bytes could make the failed read succeed.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::Truncated { .. })
    }

    pub(crate) fn truncated(offset: usize, want: usize, buf_len: usize) -> Self {
        ProtocolError::Truncated {
            needed: want,
            available: buf_len.saturating_sub(offset),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::IntegrityViolation { counter: 3 }.is_fatal());
        assert!(ProtocolError::CorruptPayload("bad".into()).is_fatal());
        assert!(!ProtocolError::UnknownPacketId(7).is_fatal());
        assert!(!ProtocolError::Truncated {
            needed: 2,
            available: 1
        }
        .is_fatal());
    }

    #[test]
    fn test_truncated_helper_reports_remaining() {
        match ProtocolError::truncated(6, 4, 8) {
            ProtocolError::Truncated { needed, available } => {
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ProtocolError::truncated(10, 1, 4).is_incomplete());
    }
}

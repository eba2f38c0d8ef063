//! Error types for wire-level parsing and encoding.

use thiserror::Error;

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced by the wire codec and the grammar parsers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Message body exceeds the protocol size limit
    #[error("message body too large: {size} bytes (max {max})")]
    BodyTooLarge {
        /// Actual body size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Buffer ended before the full message arrived
    #[error("message truncated: expected {expected} body bytes, got {actual}")]
    Truncated {
        /// Body size the header claims
        expected: usize,
        /// Body bytes actually present
        actual: usize,
    },

    /// Unknown message tag byte
    #[error("invalid message tag: {0:#04x}")]
    InvalidTag(u8),

    /// Text message body is not valid UTF-8
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    /// Status token not in the protocol vocabulary
    #[error("unknown status token: {0:?}")]
    InvalidStatus(String),

    /// Command line did not match the grammar
    #[error("malformed command: {0}")]
    InvalidCommand(String),

    /// CBOR encoding failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR decoding failed
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}

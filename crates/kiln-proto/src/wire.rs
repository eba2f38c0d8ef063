//! Message framing for the Kiln wire protocol.
//!
//! Every message is `tag(1 byte) ‖ length(u32 Big Endian) ‖ body`. Two tags
//! exist: text lines and binary blobs. Text carries status tokens, commands,
//! nonces, and listings; blobs carry certificates, signed challenges,
//! wrapped keys, and telemetry ciphertexts.
//!
//! This module is sans-IO: encoding writes into a `BufMut`, decoding reads
//! from a byte slice. Async read/write against a socket lives with the
//! server driver, not here.
//!
//! # Security
//!
//! - **Size Validation First**: the length prefix is checked against
//!   [`WireMessage::MAX_BODY`] before any body bytes are copied, preventing
//!   memory exhaustion from a hostile length field.
//!
//! - **Exact Reads**: decoding consumes exactly `5 + length` bytes; trailing
//!   data is left untouched for the next message.

use bytes::{BufMut, Bytes};

use crate::errors::{ProtocolError, Result};

/// Tag byte for UTF-8 text messages.
pub const TAG_TEXT: u8 = 0x01;
/// Tag byte for binary blob messages.
pub const TAG_BLOB: u8 = 0x02;

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// UTF-8 text line (status, command, nonce, listing)
    Line(String),
    /// Opaque binary body (keys, challenges, ciphertexts)
    Blob(Bytes),
}

impl WireMessage {
    /// Size of the framing header (tag + length prefix).
    pub const HEADER_SIZE: usize = 5;

    /// Maximum body size (1 MiB). Large enough for an encrypted image,
    /// small enough to bound per-connection memory.
    pub const MAX_BODY: usize = 1024 * 1024;

    /// Body length in bytes.
    #[must_use]
    pub fn body_len(&self) -> usize {
        match self {
            Self::Line(text) => text.len(),
            Self::Blob(bytes) => bytes.len(),
        }
    }

    /// Encode the message into a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BodyTooLarge`] if the body exceeds
    /// [`Self::MAX_BODY`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let len = self.body_len();
        if len > Self::MAX_BODY {
            return Err(ProtocolError::BodyTooLarge { size: len, max: Self::MAX_BODY });
        }

        #[allow(clippy::cast_possible_truncation)]
        let len32 = len as u32;

        match self {
            Self::Line(text) => {
                dst.put_u8(TAG_TEXT);
                dst.put_u32(len32);
                dst.put_slice(text.as_bytes());
            },
            Self::Blob(bytes) => {
                dst.put_u8(TAG_BLOB);
                dst.put_u32(len32);
                dst.put_slice(bytes);
            },
        }

        Ok(())
    }

    /// Decode one message from the front of `bytes`.
    ///
    /// Returns the message and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is shorter than the header, the tag is
    /// unknown, the claimed length exceeds [`Self::MAX_BODY`], the body is
    /// truncated, or a text body is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: Self::HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let tag = bytes[0];
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;

        if len > Self::MAX_BODY {
            return Err(ProtocolError::BodyTooLarge { size: len, max: Self::MAX_BODY });
        }

        let total = Self::HEADER_SIZE + len;
        if bytes.len() < total {
            return Err(ProtocolError::Truncated {
                expected: len,
                actual: bytes.len() - Self::HEADER_SIZE,
            });
        }

        let body = &bytes[Self::HEADER_SIZE..total];

        let message = match tag {
            TAG_TEXT => {
                let text =
                    std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8)?;
                Self::Line(text.to_string())
            },
            TAG_BLOB => Self::Blob(Bytes::copy_from_slice(body)),
            other => return Err(ProtocolError::InvalidTag(other)),
        };

        Ok((message, total))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn line_round_trip(text in "[ -~]{0,512}") {
            let message = WireMessage::Line(text);
            let mut wire = Vec::new();
            message.encode(&mut wire).expect("should encode");

            let (parsed, consumed) = WireMessage::decode(&wire).expect("should decode");
            prop_assert_eq!(message, parsed);
            prop_assert_eq!(consumed, wire.len());
        }

        #[test]
        fn blob_round_trip(body in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let message = WireMessage::Blob(Bytes::from(body));
            let mut wire = Vec::new();
            message.encode(&mut wire).expect("should encode");

            let (parsed, consumed) = WireMessage::decode(&wire).expect("should decode");
            prop_assert_eq!(message, parsed);
            prop_assert_eq!(consumed, wire.len());
        }
    }

    #[test]
    fn decode_leaves_trailing_bytes() {
        let mut wire = Vec::new();
        WireMessage::Line("OK".to_string()).encode(&mut wire).expect("encode");
        let boundary = wire.len();
        WireMessage::Blob(Bytes::from_static(b"next")).encode(&mut wire).expect("encode");

        let (first, consumed) = WireMessage::decode(&wire).expect("decode");
        assert_eq!(first, WireMessage::Line("OK".to_string()));
        assert_eq!(consumed, boundary);

        let (second, _) = WireMessage::decode(&wire[consumed..]).expect("decode");
        assert_eq!(second, WireMessage::Blob(Bytes::from_static(b"next")));
    }

    #[test]
    fn reject_oversized_length_claim() {
        let mut wire = vec![TAG_BLOB];
        wire.extend_from_slice(&(WireMessage::MAX_BODY as u32 + 1).to_be_bytes());

        let result = WireMessage::decode(&wire);
        assert!(matches!(result, Err(ProtocolError::BodyTooLarge { .. })));
    }

    #[test]
    fn reject_truncated_body() {
        let mut wire = vec![TAG_TEXT];
        wire.extend_from_slice(&100u32.to_be_bytes());
        wire.extend_from_slice(b"short");

        let result = WireMessage::decode(&wire);
        assert!(matches!(result, Err(ProtocolError::Truncated { expected: 100, actual: 5 })));
    }

    #[test]
    fn reject_unknown_tag() {
        let mut wire = vec![0x7F];
        wire.extend_from_slice(&0u32.to_be_bytes());

        assert!(matches!(WireMessage::decode(&wire), Err(ProtocolError::InvalidTag(0x7F))));
    }

    #[test]
    fn reject_invalid_utf8_line() {
        let mut wire = vec![TAG_TEXT];
        wire.extend_from_slice(&2u32.to_be_bytes());
        wire.extend_from_slice(&[0xFF, 0xFE]);

        assert!(matches!(WireMessage::decode(&wire), Err(ProtocolError::InvalidUtf8)));
    }
}

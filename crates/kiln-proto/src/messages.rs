//! CBOR-encoded structured payloads.
//!
//! These are the blobs with internal structure: the certificate binding an
//! identity to its public keys, the signed challenge answering the server's
//! nonce, and the attestation proof over the device executable. Wrapped keys
//! and telemetry ciphertexts stay opaque byte strings and never appear here.
//!
//! # Design Rationale
//!
//! The signed challenge is an explicit schema carrying payload bytes,
//! signature bytes, an algorithm identifier, and an optional certificate,
//! decoded field-by-field. This replaces the language-native signed-object
//! serialization of earlier designs, which coupled the wire format to one
//! runtime's object graph.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Signature algorithm identifier for Ed25519.
pub const ALG_ED25519: &str = "ed25519";

/// Identity certificate: a subject name bound to its public keys.
///
/// Not a general PKI certificate. The server treats these as pre-provisioned
/// identity material: it stores the certificate supplied at first
/// authentication and pins it for every later session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Identity the keys belong to (email-shaped)
    pub subject: String,
    /// Ed25519 verifying key (32 bytes)
    pub verifying_key: Vec<u8>,
    /// X25519 public key used for key wrapping (32 bytes)
    pub wrap_key: Vec<u8>,
}

/// Client answer to the server's authentication nonce.
///
/// # Security
///
/// - **Debug Redaction**: the `Debug` impl elides the signature bytes so
///   session logs never carry signature material verbatim.
/// - The `certificate` field is only consulted when the server has no stored
///   certificate for the claimed identity; known users are verified against
///   the pinned certificate regardless of what this field carries.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedChallenge {
    /// Signed payload: the decimal string of the server nonce, as bytes
    pub payload: Vec<u8>,
    /// Detached signature over `payload`
    pub signature: Vec<u8>,
    /// Signing algorithm identifier (see [`ALG_ED25519`])
    pub algorithm: String,
    /// Certificate for first-contact identities
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub certificate: Option<Certificate>,
}

impl std::fmt::Debug for SignedChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedChallenge")
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("signature", &format!("<{} bytes>", self.signature.len()))
            .field("algorithm", &self.algorithm)
            .field("certificate", &self.certificate.as_ref().map(|c| c.subject.as_str()))
            .finish()
    }
}

/// Device attestation answer.
///
/// The digest is a keyed hash of the client's executable image, keyed with
/// the attestation nonce the server issued. The server recomputes the same
/// digest over its reference copy; a tampered or substituted binary cannot
/// produce a matching value without the reference bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationProof {
    /// Name of the executable the client claims to run
    pub binary_name: String,
    /// HMAC-SHA256 over the executable image, keyed with the nonce
    pub digest: Vec<u8>,
}

/// Encode a payload to CBOR bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::CborEncode`] if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Decode a payload from CBOR bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::CborDecode`] if the bytes are not a valid
/// encoding of `T`.
pub fn from_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

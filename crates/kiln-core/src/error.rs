//! Server-side error types.

use crate::crypto::CryptoError;
use crate::storage::StorageError;
use kiln_proto::ProtocolError;

/// Errors from server-side session and store operations.
///
/// Protocol-visible failures (bad credentials, missing permissions) are not
/// errors: they travel to the peer as status lines. This type covers the
/// failures the server keeps to itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Persistence backend failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Cryptographic operation failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Wire or payload codec failure
    #[error(transparent)]
    Proto(#[from] ProtocolError),

    /// Persisted state failed its integrity check
    #[error("integrity check failed: {0}")]
    IntegrityViolation(&'static str),

    /// A persisted ledger could not be decoded
    #[error("corrupt ledger: {0}")]
    CorruptLedger(String),

    /// The peer closed or broke the connection
    #[error("connection error: {0}")]
    Connection(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

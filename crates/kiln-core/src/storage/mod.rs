//! Persistence abstraction for server state.
//!
//! The [`Storage`] trait captures the persisted layout as typed operations
//! rather than raw paths: an encrypted user ledger, a domain ledger, a
//! device ledger, one wrapped-key blob per (domain, member), one temperature
//! ledger per domain, one image ciphertext per (domain, device), the
//! integrity ledger with its detached signature, and the reference
//! executable image used for attestation.
//!
//! Two implementations exist:
//!
//! - [`MemoryStorage`]: `HashMap`-backed, for tests and simulation.
//! - [`FsStorage`]: one file per artifact under a root directory. Rewrites
//!   are read-old → write-new → overwrite and are **not** crash-atomic; the
//!   in-memory stores stay authoritative during a session and the files are
//!   a durable mirror consulted at startup.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

/// Errors from persistence backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Underlying I/O failure
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A required pre-provisioned artifact is missing
    #[error("missing artifact: {0}")]
    Missing(&'static str),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Typed persistence operations over the server's durable state.
///
/// All blobs are opaque to the backend: encryption and encoding are the
/// callers' concern. Implementations must be safe to share across
/// connection tasks.
pub trait Storage: Send + Sync + 'static {
    /// Load the encrypted user ledger, if one has been written.
    fn load_users(&self) -> Result<Option<Vec<u8>>, StorageError>;
    /// Overwrite the encrypted user ledger.
    fn store_users(&self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Load the domain ledger, if one has been written.
    fn load_domains(&self) -> Result<Option<Vec<u8>>, StorageError>;
    /// Overwrite the domain ledger.
    fn store_domains(&self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Load the device ledger, if one has been written.
    fn load_devices(&self) -> Result<Option<Vec<u8>>, StorageError>;
    /// Overwrite the device ledger.
    fn store_devices(&self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Load the wrapped domain key for one member.
    fn load_wrapped_key(&self, domain: &str, member: &str)
        -> Result<Option<Vec<u8>>, StorageError>;
    /// Store the wrapped domain key for one member.
    fn store_wrapped_key(
        &self,
        domain: &str,
        member: &str,
        blob: &[u8],
    ) -> Result<(), StorageError>;
    /// Remove a wrapped key (rollback path only; keys are never rotated).
    fn remove_wrapped_key(&self, domain: &str, member: &str) -> Result<(), StorageError>;

    /// Load a domain's temperature ledger.
    fn load_temperatures(&self, domain: &str) -> Result<Option<Vec<u8>>, StorageError>;
    /// Overwrite a domain's temperature ledger.
    fn store_temperatures(&self, domain: &str, bytes: &[u8]) -> Result<(), StorageError>;
    /// List the domains that have a temperature ledger on disk.
    fn temperature_domains(&self) -> Result<Vec<String>, StorageError>;

    /// Load the image ciphertext a device submitted into a domain.
    fn load_image(
        &self,
        domain: &str,
        user: &str,
        device_id: u32,
    ) -> Result<Option<Vec<u8>>, StorageError>;
    /// Store the image ciphertext a device submitted into a domain.
    fn store_image(
        &self,
        domain: &str,
        user: &str,
        device_id: u32,
        blob: &[u8],
    ) -> Result<(), StorageError>;

    /// Load the integrity ledger and its detached signature.
    fn load_integrity(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError>;
    /// Overwrite the integrity ledger and its detached signature.
    fn store_integrity(&self, ledger: &[u8], signature: &[u8]) -> Result<(), StorageError>;

    /// The reference copy of the device executable used for attestation.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Missing`] when no reference image has been
    /// provisioned; attestation cannot run without one.
    fn reference_image(&self) -> Result<Vec<u8>, StorageError>;
    /// Provision or replace the reference executable image.
    fn store_reference_image(&self, bytes: &[u8]) -> Result<(), StorageError>;
}

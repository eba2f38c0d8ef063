//! Shared server context.
//!
//! All stores are constructed once at startup and passed by reference into
//! each session. Nothing here is a process-wide singleton: tests build a
//! fresh context per case over in-memory storage.

use std::sync::Arc;

use ed25519_dalek::SigningKey;

use crate::crypto;
use crate::error::Result;
use crate::identity::UserDirectory;
use crate::integrity::{Artifact, IntegrityVerifier};
use crate::registry::DomainRegistry;
use crate::storage::{Storage, StorageError};
use crate::telemetry::TelemetryStore;
use crate::vault::KeyVault;

/// HKDF context for the integrity-ledger MAC key.
const INTEGRITY_CONTEXT: &str = "kiln-integrity-v1";

/// Everything a session needs: stores, vault, and the integrity verifier.
pub struct ServerContext {
    /// Known identities and their pinned certificates
    pub users: UserDirectory,
    /// Domains, devices, and the connected-device set
    pub registry: DomainRegistry,
    /// Wrapped domain keys
    pub vault: KeyVault,
    /// Encrypted telemetry
    pub telemetry: TelemetryStore,
    integrity: IntegrityVerifier,
    storage: Arc<dyn Storage>,
}

impl ServerContext {
    /// Open all stores and verify persisted state against the integrity
    /// ledger.
    ///
    /// `signing` is the server's own keypair, used only to sign the
    /// integrity ledger. `passphrase` and `salt` derive the at-rest keys
    /// for the user ledger and the integrity MAC.
    ///
    /// # Errors
    ///
    /// Fails on storage errors, a user ledger that does not decrypt, or any
    /// integrity violation. Startup must not proceed past a failure here.
    pub fn open(
        storage: Arc<dyn Storage>,
        signing: SigningKey,
        passphrase: &str,
        salt: &[u8],
    ) -> Result<Arc<Self>> {
        let users = UserDirectory::open(storage.clone(), passphrase, salt)?;
        let registry = DomainRegistry::open(storage.clone())?;
        let telemetry = TelemetryStore::open(storage.clone())?;
        let vault = KeyVault::new(storage.clone());

        let mac_key = crypto::derive_key(passphrase.as_bytes(), salt, INTEGRITY_CONTEXT);
        let artifacts = artifacts(&registry, &storage)?;
        let integrity = IntegrityVerifier::bootstrap(storage.clone(), mac_key, signing, &artifacts)?;

        Ok(Arc::new(Self { users, registry, vault, telemetry, integrity, storage }))
    }

    /// Re-sign the integrity ledger over current state. Every mutation of a
    /// tracked artifact must be followed by this before it counts as
    /// durable.
    pub fn refresh_integrity(&self) -> Result<()> {
        self.integrity.refresh(&artifacts(&self.registry, &self.storage)?)
    }

    /// Check current state against the stored integrity ledger.
    pub fn verify_integrity(&self) -> Result<()> {
        self.integrity.verify(&artifacts(&self.registry, &self.storage)?)
    }

    /// The reference executable image used for attestation.
    pub fn reference_image(&self) -> Result<Vec<u8>> {
        Ok(self.storage.reference_image()?)
    }
}

fn artifacts(registry: &DomainRegistry, storage: &Arc<dyn Storage>) -> Result<Vec<Artifact>> {
    let reference = match storage.reference_image() {
        Ok(bytes) => Some(bytes),
        Err(StorageError::Missing(_)) => None,
        Err(e) => return Err(e.into()),
    };

    Ok(vec![
        Artifact::new("domains", Some(registry.domain_ledger())),
        Artifact::new("devices", Some(registry.device_ledger())),
        Artifact::new("reference", reference),
    ])
}

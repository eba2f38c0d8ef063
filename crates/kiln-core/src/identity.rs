//! User directory: pinned identity certificates, encrypted at rest.
//!
//! The first time an identity authenticates, its certificate is stored and
//! pinned; every later session must answer the challenge with the pinned
//! keys. The directory persists as a CBOR vector sealed under a key derived
//! from the server passphrase, so user identities and public keys are never
//! written in the clear.

use std::sync::{Arc, Mutex};

use kiln_proto::messages::{from_cbor, to_cbor, Certificate};

use crate::crypto::{self, SymmetricKey};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::storage::Storage;

/// HKDF context for the at-rest user ledger key.
const USERS_CONTEXT: &str = "kiln-users-v1";

/// Directory of known identities and their pinned certificates.
pub struct UserDirectory {
    storage: Arc<dyn Storage>,
    key: SymmetricKey,
    users: Mutex<Vec<Certificate>>,
}

impl UserDirectory {
    /// Load the directory from storage, decrypting with a key derived from
    /// the server passphrase.
    ///
    /// # Errors
    ///
    /// Fails if the backend errors, the ledger does not decrypt (wrong
    /// passphrase or tampering), or the plaintext is not a valid CBOR vector.
    pub fn open(storage: Arc<dyn Storage>, passphrase: &str, salt: &[u8]) -> Result<Self> {
        let key = crypto::derive_key(passphrase.as_bytes(), salt, USERS_CONTEXT);

        let users = match storage.load_users()? {
            Some(blob) => {
                let plaintext = crypto::open(&key, &blob)?;
                from_cbor(&plaintext).map_err(|e| Error::CorruptLedger(e.to_string()))?
            }
            None => Vec::new(),
        };

        Ok(Self { storage, key, users: Mutex::new(users) })
    }

    /// Look up the pinned certificate for an identity.
    pub fn lookup(&self, name: &str) -> Option<Certificate> {
        self.lock().iter().find(|c| c.subject == name).cloned()
    }

    /// Whether the identity has authenticated before.
    pub fn is_known(&self, name: &str) -> bool {
        self.lock().iter().any(|c| c.subject == name)
    }

    /// Pin a certificate for a first-contact identity and persist.
    ///
    /// A certificate already pinned for the subject is left untouched:
    /// re-registration never overwrites identity material.
    ///
    /// # Errors
    ///
    /// Fails if encoding, sealing, or the storage write fails. The in-memory
    /// directory is rolled back on persistence failure.
    pub fn register(&self, certificate: Certificate, env: &impl Environment) -> Result<()> {
        let mut users = self.lock();
        if users.iter().any(|c| c.subject == certificate.subject) {
            return Ok(());
        }
        users.push(certificate);

        match self.persist(&users, env) {
            Ok(()) => Ok(()),
            Err(e) => {
                users.pop();
                Err(e)
            }
        }
    }

    /// Number of pinned identities.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn persist(&self, users: &[Certificate], env: &impl Environment) -> Result<()> {
        let plaintext = to_cbor(&users.to_vec())?;
        let blob = crypto::seal(&self.key, &plaintext, env)?;
        self.storage.store_users(&blob)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Certificate>> {
        self.users.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

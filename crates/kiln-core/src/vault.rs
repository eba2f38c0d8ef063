//! Per-domain key vault.
//!
//! One symmetric key exists per domain, but the server never sees it in the
//! clear: members wrap it under each other's public keys and the vault
//! stores the resulting blobs keyed by (domain, member). The vault is a
//! relay for key material, not a keyholder; it cannot open anything it
//! stores.

use std::sync::Arc;

use crate::error::Result;
use crate::storage::Storage;

/// Store of wrapped domain keys, one blob per (domain, member).
pub struct KeyVault {
    storage: Arc<dyn Storage>,
}

impl KeyVault {
    /// Wrap a storage handle.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Persist a member's wrapped copy of a domain key.
    ///
    /// Keys are never re-wrapped: a blob already present for this
    /// (domain, member) is left untouched.
    pub fn store(&self, domain: &str, member: &str, blob: &[u8]) -> Result<()> {
        if self.storage.load_wrapped_key(domain, member)?.is_some() {
            return Ok(());
        }
        self.storage.store_wrapped_key(domain, member, blob)?;
        Ok(())
    }

    /// Fetch a member's wrapped copy of a domain key.
    pub fn fetch(&self, domain: &str, member: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.storage.load_wrapped_key(domain, member)?)
    }

    /// Remove a wrapped key. Only used to undo a store when the membership
    /// update that should have followed it failed.
    pub fn remove(&self, domain: &str, member: &str) -> Result<()> {
        self.storage.remove_wrapped_key(domain, member)?;
        Ok(())
    }
}

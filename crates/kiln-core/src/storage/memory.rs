//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Storage, StorageError};

#[derive(Default)]
struct Inner {
    users: Option<Vec<u8>>,
    domains: Option<Vec<u8>>,
    devices: Option<Vec<u8>>,
    wrapped_keys: HashMap<(String, String), Vec<u8>>,
    temperatures: HashMap<String, Vec<u8>>,
    images: HashMap<(String, String, u32), Vec<u8>>,
    integrity: Option<(Vec<u8>, Vec<u8>)>,
    reference_image: Option<Vec<u8>>,
}

/// `HashMap`-backed storage for tests and simulation.
///
/// Clones share the same underlying state, matching the sharing semantics
/// of a filesystem root.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a holder panicked mid-write; the byte maps
        // are still structurally valid, so keep serving them.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn load_users(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().users.clone())
    }

    fn store_users(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.lock().users = Some(bytes.to_vec());
        Ok(())
    }

    fn load_domains(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().domains.clone())
    }

    fn store_domains(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.lock().domains = Some(bytes.to_vec());
        Ok(())
    }

    fn load_devices(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().devices.clone())
    }

    fn store_devices(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.lock().devices = Some(bytes.to_vec());
        Ok(())
    }

    fn load_wrapped_key(
        &self,
        domain: &str,
        member: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let key = (domain.to_string(), member.to_string());
        Ok(self.lock().wrapped_keys.get(&key).cloned())
    }

    fn store_wrapped_key(
        &self,
        domain: &str,
        member: &str,
        blob: &[u8],
    ) -> Result<(), StorageError> {
        let key = (domain.to_string(), member.to_string());
        self.lock().wrapped_keys.insert(key, blob.to_vec());
        Ok(())
    }

    fn remove_wrapped_key(&self, domain: &str, member: &str) -> Result<(), StorageError> {
        let key = (domain.to_string(), member.to_string());
        self.lock().wrapped_keys.remove(&key);
        Ok(())
    }

    fn load_temperatures(&self, domain: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().temperatures.get(domain).cloned())
    }

    fn store_temperatures(&self, domain: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.lock().temperatures.insert(domain.to_string(), bytes.to_vec());
        Ok(())
    }

    fn temperature_domains(&self) -> Result<Vec<String>, StorageError> {
        let mut domains: Vec<String> = self.lock().temperatures.keys().cloned().collect();
        domains.sort();
        Ok(domains)
    }

    fn load_image(
        &self,
        domain: &str,
        user: &str,
        device_id: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let key = (domain.to_string(), user.to_string(), device_id);
        Ok(self.lock().images.get(&key).cloned())
    }

    fn store_image(
        &self,
        domain: &str,
        user: &str,
        device_id: u32,
        blob: &[u8],
    ) -> Result<(), StorageError> {
        let key = (domain.to_string(), user.to_string(), device_id);
        self.lock().images.insert(key, blob.to_vec());
        Ok(())
    }

    fn load_integrity(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self.lock().integrity.clone())
    }

    fn store_integrity(&self, ledger: &[u8], signature: &[u8]) -> Result<(), StorageError> {
        self.lock().integrity = Some((ledger.to_vec(), signature.to_vec()));
        Ok(())
    }

    fn reference_image(&self) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .reference_image
            .clone()
            .ok_or(StorageError::Missing("reference image"))
    }

    fn store_reference_image(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.lock().reference_image = Some(bytes.to_vec());
        Ok(())
    }
}

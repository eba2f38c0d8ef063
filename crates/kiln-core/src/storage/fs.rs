//! Filesystem storage backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! users.db                      encrypted user ledger
//! domains.db                    domain ledger
//! devices.db                    device ledger
//! integrity.ledger              integrity ledger
//! integrity.sig                 detached signature over the ledger
//! reference.img                 reference executable for attestation
//! keys/<domain>/<member>.key    wrapped domain key per member
//! temps/<domain>.log            temperature ledger per domain
//! images/<domain>/<user>.<id>   image ciphertext per device
//! ```
//!
//! Domain and identity names become path components; anything outside a
//! conservative character set is hex-encoded so ledger names can never
//! escape the root.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{Storage, StorageError};

/// One-file-per-artifact storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Open (creating if needed) a storage root.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory tree cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(root.join("keys"))?;
        fs::create_dir_all(root.join("temps"))?;
        fs::create_dir_all(root.join("images"))?;
        Ok(Self { root })
    }

    fn read_optional(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn key_path(&self, domain: &str, member: &str) -> PathBuf {
        self.root
            .join("keys")
            .join(component(domain))
            .join(format!("{}.key", component(member)))
    }

    fn temp_path(&self, domain: &str) -> PathBuf {
        self.root.join("temps").join(format!("{}.log", component(domain)))
    }

    fn image_path(&self, domain: &str, user: &str, device_id: u32) -> PathBuf {
        self.root
            .join("images")
            .join(component(domain))
            .join(format!("{}.{}", component(user), device_id))
    }
}

/// Encode a ledger name as a single safe path component.
fn component(name: &str) -> String {
    let safe = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-'));
    if safe && !name.is_empty() && name != "." && name != ".." {
        name.to_string()
    } else {
        format!("x-{}", hex::encode(name.as_bytes()))
    }
}

impl Storage for FsStorage {
    fn load_users(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_optional(&self.root.join("users.db"))
    }

    fn store_users(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.write(&self.root.join("users.db"), bytes)
    }

    fn load_domains(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_optional(&self.root.join("domains.db"))
    }

    fn store_domains(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.write(&self.root.join("domains.db"), bytes)
    }

    fn load_devices(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_optional(&self.root.join("devices.db"))
    }

    fn store_devices(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.write(&self.root.join("devices.db"), bytes)
    }

    fn load_wrapped_key(
        &self,
        domain: &str,
        member: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_optional(&self.key_path(domain, member))
    }

    fn store_wrapped_key(
        &self,
        domain: &str,
        member: &str,
        blob: &[u8],
    ) -> Result<(), StorageError> {
        self.write(&self.key_path(domain, member), blob)
    }

    fn remove_wrapped_key(&self, domain: &str, member: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.key_path(domain, member)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_temperatures(&self, domain: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_optional(&self.temp_path(domain))
    }

    fn store_temperatures(&self, domain: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.write(&self.temp_path(domain), bytes)
    }

    fn temperature_domains(&self) -> Result<Vec<String>, StorageError> {
        let mut domains = Vec::new();
        for entry in fs::read_dir(self.root.join("temps"))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".log") {
                if let Some(encoded) = stem.strip_prefix("x-") {
                    if let Ok(raw) = hex::decode(encoded) {
                        if let Ok(original) = String::from_utf8(raw) {
                            domains.push(original);
                            continue;
                        }
                    }
                }
                domains.push(stem.to_string());
            }
        }
        domains.sort();
        Ok(domains)
    }

    fn load_image(
        &self,
        domain: &str,
        user: &str,
        device_id: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_optional(&self.image_path(domain, user, device_id))
    }

    fn store_image(
        &self,
        domain: &str,
        user: &str,
        device_id: u32,
        blob: &[u8],
    ) -> Result<(), StorageError> {
        self.write(&self.image_path(domain, user, device_id), blob)
    }

    fn load_integrity(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        let ledger = self.read_optional(&self.root.join("integrity.ledger"))?;
        let signature = self.read_optional(&self.root.join("integrity.sig"))?;
        match (ledger, signature) {
            (Some(l), Some(s)) => Ok(Some((l, s))),
            _ => Ok(None),
        }
    }

    fn store_integrity(&self, ledger: &[u8], signature: &[u8]) -> Result<(), StorageError> {
        self.write(&self.root.join("integrity.ledger"), ledger)?;
        self.write(&self.root.join("integrity.sig"), signature)
    }

    fn reference_image(&self) -> Result<Vec<u8>, StorageError> {
        self.read_optional(&self.root.join("reference.img"))?
            .ok_or(StorageError::Missing("reference image"))
    }

    fn store_reference_image(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.write(&self.root.join("reference.img"), bytes)
    }
}

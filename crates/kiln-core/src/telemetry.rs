//! Telemetry storage: temperature ledgers and images.
//!
//! All payloads arrive already encrypted under the relevant domain key and
//! are stored as ciphertext; this module never decrypts anything.
//!
//! Temperatures keep one entry per device per domain, replaced on each new
//! reading. The ledger is rendered as text lines of `user:id,<hex>` so a
//! member holding the domain key can decrypt each entry after fetching the
//! aggregate. Images are one opaque blob per (domain, device), replaced on
//! each new submission.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::registry::DeviceKey;
use crate::storage::Storage;

type Ledgers = HashMap<String, Vec<(DeviceKey, Vec<u8>)>>;

/// Store of encrypted telemetry, shared across connection tasks.
pub struct TelemetryStore {
    storage: Arc<dyn Storage>,
    ledgers: Mutex<Ledgers>,
}

impl TelemetryStore {
    /// Load all persisted temperature ledgers.
    ///
    /// # Errors
    ///
    /// Fails if the backend errors or a ledger line does not parse.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let mut ledgers = Ledgers::new();
        for domain in storage.temperature_domains()? {
            if let Some(bytes) = storage.load_temperatures(&domain)? {
                ledgers.insert(domain, parse_ledger(&bytes)?);
            }
        }
        Ok(Self { storage, ledgers: Mutex::new(ledgers) })
    }

    /// Record a device's temperature ciphertext in a domain, replacing any
    /// previous reading from the same device.
    ///
    /// # Errors
    ///
    /// Fails on persistence errors; the in-memory entry is rolled back.
    pub fn record_temperature(
        &self,
        domain: &str,
        device: &DeviceKey,
        ciphertext: &[u8],
    ) -> Result<()> {
        let mut ledgers = self.lock();
        let entries = ledgers.entry(domain.to_string()).or_default();

        let previous = match entries.iter_mut().find(|(d, _)| d == device) {
            Some((_, existing)) => Some(std::mem::replace(existing, ciphertext.to_vec())),
            None => {
                entries.push((device.clone(), ciphertext.to_vec()));
                None
            }
        };

        if let Err(e) = self.storage.store_temperatures(domain, &render_ledger(entries)) {
            match previous {
                Some(old) => {
                    if let Some((_, entry)) = entries.iter_mut().find(|(d, _)| d == device) {
                        *entry = old;
                    }
                }
                None => {
                    entries.retain(|(d, _)| d != device);
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// The aggregated temperature ledger for a domain, or `None` if no
    /// device has reported into it yet.
    pub fn temperature_ledger(&self, domain: &str) -> Option<Vec<u8>> {
        let ledgers = self.lock();
        let entries = ledgers.get(domain)?;
        if entries.is_empty() {
            return None;
        }
        Some(render_ledger(entries))
    }

    /// Store a device's image ciphertext in a domain, replacing any
    /// previous one.
    pub fn store_image(&self, domain: &str, device: &DeviceKey, blob: &[u8]) -> Result<()> {
        self.storage.store_image(domain, &device.user, device.id, blob)?;
        Ok(())
    }

    /// Fetch a device's image ciphertext from a domain.
    pub fn fetch_image(&self, domain: &str, device: &DeviceKey) -> Result<Option<Vec<u8>>> {
        Ok(self.storage.load_image(domain, &device.user, device.id)?)
    }

    fn lock(&self) -> MutexGuard<'_, Ledgers> {
        self.ledgers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn render_ledger(entries: &[(DeviceKey, Vec<u8>)]) -> Vec<u8> {
    let mut out = String::new();
    for (device, ciphertext) in entries {
        out.push_str(&format!("{},{}\n", device, hex::encode(ciphertext)));
    }
    out.into_bytes()
}

fn parse_ledger(bytes: &[u8]) -> Result<Vec<(DeviceKey, Vec<u8>)>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::CorruptLedger("temperature ledger is not UTF-8".to_string()))?;

    text.lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            let (device, hex_ct) = line
                .split_once(',')
                .ok_or_else(|| Error::CorruptLedger(format!("bad temperature line: {line}")))?;
            let device = device
                .parse()
                .map_err(|()| Error::CorruptLedger(format!("bad device key: {line}")))?;
            let ciphertext = hex::decode(hex_ct)
                .map_err(|_| Error::CorruptLedger(format!("bad ciphertext hex: {line}")))?;
            Ok((device, ciphertext))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn store() -> TelemetryStore {
        TelemetryStore::open(Arc::new(MemoryStorage::new())).expect("open")
    }

    #[test]
    fn empty_domain_has_no_ledger() {
        let telemetry = store();
        assert_eq!(telemetry.temperature_ledger("lab"), None);
    }

    #[test]
    fn readings_replace_per_device() {
        let telemetry = store();
        let a1 = DeviceKey::new("alice", 1);
        let b2 = DeviceKey::new("bob", 2);

        telemetry.record_temperature("lab", &a1, b"ct-one").unwrap();
        telemetry.record_temperature("lab", &b2, b"ct-two").unwrap();
        telemetry.record_temperature("lab", &a1, b"ct-three").unwrap();

        let ledger = telemetry.temperature_ledger("lab").unwrap();
        let text = String::from_utf8(ledger).unwrap();
        assert_eq!(
            text,
            format!("alice:1,{}\nbob:2,{}\n", hex::encode(b"ct-three"), hex::encode(b"ct-two"))
        );
    }

    #[test]
    fn ledgers_survive_reload() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let device = DeviceKey::new("alice", 1);
        {
            let telemetry = TelemetryStore::open(storage.clone()).unwrap();
            telemetry.record_temperature("lab", &device, b"ciphertext").unwrap();
        }

        let telemetry = TelemetryStore::open(storage).unwrap();
        let text = String::from_utf8(telemetry.temperature_ledger("lab").unwrap()).unwrap();
        assert!(text.starts_with("alice:1,"));
    }

    #[test]
    fn images_replace_per_device_and_domain() {
        let telemetry = store();
        let device = DeviceKey::new("alice", 1);

        assert_eq!(telemetry.fetch_image("lab", &device).unwrap(), None);
        telemetry.store_image("lab", &device, b"img-a").unwrap();
        telemetry.store_image("lab", &device, b"img-b").unwrap();
        assert_eq!(telemetry.fetch_image("lab", &device).unwrap(), Some(b"img-b".to_vec()));
        assert_eq!(telemetry.fetch_image("home", &device).unwrap(), None);
    }
}

//! Domain and device registry.
//!
//! Owns all `Domain` and device records behind a single lock. Every
//! authorization decision a session makes (ownership, membership, device
//! registration) consults the in-memory index here; the persisted ledgers
//! are a durable mirror consulted only at startup.
//!
//! # Invariants
//!
//! - The connected flag is the sole guard against two live sessions for one
//!   device identity. Check-then-set happens under the registry lock, so of
//!   two racing validations exactly one observes "not connected".
//! - Mutations persist before they are reported applied; on a persistence
//!   failure the in-memory change is rolled back so index and ledger never
//!   diverge in the success direction.
//! - Membership only grows. No removal or rotation path exists.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::storage::Storage;

/// Device identity: owning user plus a small integer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    /// Owning user's identity
    pub user: String,
    /// Per-user device number
    pub id: u32,
}

impl DeviceKey {
    /// Build a device key from its parts.
    pub fn new(user: impl Into<String>, id: u32) -> Self {
        Self { user: user.into(), id }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.id)
    }
}

impl FromStr for DeviceKey {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (user, id) = s.rsplit_once(':').ok_or(())?;
        if user.is_empty() {
            return Err(());
        }
        let id = id.parse().map_err(|_| ())?;
        Ok(Self::new(user, id))
    }
}

/// A named group of users and devices sharing one confidentiality key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    /// Unique domain name
    pub name: String,
    /// Creating user; immutable, always also a member
    pub owner: String,
    /// Member users, owner included
    pub members: Vec<String>,
    /// Devices reporting into this domain
    pub devices: Vec<DeviceKey>,
}

/// Outcome of a device-id validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceValidation {
    /// Device accepted and now marked connected
    Accepted,
    /// Another live session already holds this device identity
    AlreadyConnected,
}

/// Outcome of adding a member to a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMember {
    /// Membership recorded and persisted
    Added,
    /// No domain with that name
    NoSuchDomain,
    /// Caller is not the domain owner
    NotOwner,
    /// Target is already a member
    AlreadyMember,
}

/// Outcome of adding a device to a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddDevice {
    /// Device recorded and persisted (or already present)
    Added,
    /// No domain with that name
    NoSuchDomain,
    /// Caller is neither owner nor member
    NotMember,
}

#[derive(Default)]
struct Inner {
    domains: Vec<Domain>,
    devices: Vec<DeviceKey>,
    connected: HashSet<DeviceKey>,
}

/// Registry of domains and devices, shared across all connection tasks.
pub struct DomainRegistry {
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
}

impl DomainRegistry {
    /// Load the registry from the persisted domain and device ledgers.
    ///
    /// # Errors
    ///
    /// Fails if the backend errors or a ledger line does not parse.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let domains = match storage.load_domains()? {
            Some(bytes) => parse_domains(&bytes)?,
            None => Vec::new(),
        };
        let devices = match storage.load_devices()? {
            Some(bytes) => parse_devices(&bytes)?,
            None => Vec::new(),
        };

        let inner = Inner { domains, devices, connected: HashSet::new() };
        Ok(Self { storage, inner: Mutex::new(inner) })
    }

    /// Validate a device identity and claim its connected slot.
    ///
    /// Unknown (user, id) pairs are created and persisted; known pairs are
    /// reused. The check and the connected mark happen under one lock
    /// acquisition.
    ///
    /// # Errors
    ///
    /// Fails only on persistence errors; the new record and the connected
    /// mark are rolled back in that case.
    pub fn validate_device(&self, device: &DeviceKey) -> Result<DeviceValidation> {
        let mut inner = self.lock();

        if inner.connected.contains(device) {
            return Ok(DeviceValidation::AlreadyConnected);
        }

        let known = inner.devices.contains(device);
        if !known {
            inner.devices.push(device.clone());
            if let Err(e) = self.persist_devices(&inner) {
                inner.devices.pop();
                return Err(e);
            }
        }

        inner.connected.insert(device.clone());
        Ok(DeviceValidation::Accepted)
    }

    /// Release a device's connected slot at session end.
    pub fn disconnect_device(&self, device: &DeviceKey) {
        self.lock().connected.remove(device);
    }

    /// Create a domain owned (and membered) by `owner`.
    ///
    /// Returns `false` if the name is taken.
    ///
    /// # Errors
    ///
    /// Fails on persistence errors; the domain is rolled back.
    pub fn create_domain(&self, name: &str, owner: &str) -> Result<bool> {
        let mut inner = self.lock();
        if inner.domains.iter().any(|d| d.name == name) {
            return Ok(false);
        }

        inner.domains.push(Domain {
            name: name.to_string(),
            owner: owner.to_string(),
            members: vec![owner.to_string()],
            devices: Vec::new(),
        });

        if let Err(e) = self.persist_domains(&inner) {
            inner.domains.pop();
            return Err(e);
        }
        Ok(true)
    }

    /// Add a user to a domain's membership, gated on the caller owning it.
    ///
    /// The caller is responsible for persisting the member's wrapped key
    /// *before* calling this; on persistence failure here the membership is
    /// rolled back and the caller must remove the orphaned key.
    pub fn add_member(&self, domain: &str, caller: &str, member: &str) -> Result<AddMember> {
        let mut inner = self.lock();
        let Some(index) = inner.domains.iter().position(|d| d.name == domain) else {
            return Ok(AddMember::NoSuchDomain);
        };
        if inner.domains[index].owner != caller {
            return Ok(AddMember::NotOwner);
        }
        if inner.domains[index].members.iter().any(|m| m == member) {
            return Ok(AddMember::AlreadyMember);
        }

        inner.domains[index].members.push(member.to_string());
        if let Err(e) = self.persist_domains(&inner) {
            inner.domains[index].members.pop();
            return Err(e);
        }
        Ok(AddMember::Added)
    }

    /// Add a device to a domain, gated on its owner being a member.
    pub fn add_device(&self, domain: &str, device: &DeviceKey) -> Result<AddDevice> {
        let mut inner = self.lock();
        let Some(index) = inner.domains.iter().position(|d| d.name == domain) else {
            return Ok(AddDevice::NoSuchDomain);
        };
        if !inner.domains[index].members.iter().any(|m| *m == device.user) {
            return Ok(AddDevice::NotMember);
        }
        if inner.domains[index].devices.contains(device) {
            return Ok(AddDevice::Added);
        }

        inner.domains[index].devices.push(device.clone());
        if let Err(e) = self.persist_domains(&inner) {
            inner.domains[index].devices.pop();
            return Err(e);
        }
        Ok(AddDevice::Added)
    }

    /// Whether `user` is a member of `domain`. `None` if the domain does
    /// not exist.
    pub fn is_member(&self, domain: &str, user: &str) -> Option<bool> {
        let inner = self.lock();
        let d = inner.domains.iter().find(|d| d.name == domain)?;
        Some(d.members.iter().any(|m| m == user))
    }

    /// Whether any registered device has this identity.
    pub fn device_exists(&self, device: &DeviceKey) -> bool {
        self.lock().devices.contains(device)
    }

    /// Names of the domains a device reports into.
    pub fn domains_of_device(&self, device: &DeviceKey) -> Vec<String> {
        self.lock()
            .domains
            .iter()
            .filter(|d| d.devices.contains(device))
            .map(|d| d.name.clone())
            .collect()
    }

    /// A domain containing the target device that the caller is a member of.
    pub fn shared_domain(&self, caller: &str, device: &DeviceKey) -> Option<String> {
        let inner = self.lock();
        inner
            .domains
            .iter()
            .find(|d| d.devices.contains(device) && d.members.iter().any(|m| m == caller))
            .map(|d| d.name.clone())
    }

    /// Snapshot of one domain.
    pub fn domain(&self, name: &str) -> Option<Domain> {
        self.lock().domains.iter().find(|d| d.name == name).cloned()
    }

    /// Current domain-ledger bytes, as persisted. Integrity tracking hashes
    /// these.
    pub fn domain_ledger(&self) -> Vec<u8> {
        render_domains(&self.lock().domains)
    }

    /// Current device-ledger bytes, as persisted.
    pub fn device_ledger(&self) -> Vec<u8> {
        render_devices(&self.lock().devices)
    }

    fn persist_domains(&self, inner: &Inner) -> Result<()> {
        self.storage.store_domains(&render_domains(&inner.domains))?;
        Ok(())
    }

    fn persist_devices(&self, inner: &Inner) -> Result<()> {
        self.storage.store_devices(&render_devices(&inner.devices))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ledger line: `name,owner,[member member],[user:id user:id]`.
fn render_domains(domains: &[Domain]) -> Vec<u8> {
    let mut out = String::new();
    for d in domains {
        let devices: Vec<String> = d.devices.iter().map(DeviceKey::to_string).collect();
        out.push_str(&format!(
            "{},{},[{}],[{}]\n",
            d.name,
            d.owner,
            d.members.join(" "),
            devices.join(" "),
        ));
    }
    out.into_bytes()
}

fn parse_domains(bytes: &[u8]) -> Result<Vec<Domain>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::CorruptLedger("domain ledger is not UTF-8".to_string()))?;

    let mut domains = Vec::new();
    for line in text.lines().filter(|l| !l.is_empty()) {
        let mut parts = line.splitn(4, ',');
        let (name, owner, members, devices) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(n), Some(o), Some(m), Some(d)) => (n, o, m, d),
                _ => return Err(Error::CorruptLedger(format!("bad domain line: {line}"))),
            };

        let members = bracket_list(members)
            .ok_or_else(|| Error::CorruptLedger(format!("bad member list: {line}")))?
            .map(str::to_string)
            .collect();
        let devices = bracket_list(devices)
            .ok_or_else(|| Error::CorruptLedger(format!("bad device list: {line}")))?
            .map(DeviceKey::from_str)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|()| Error::CorruptLedger(format!("bad device key: {line}")))?;

        domains.push(Domain {
            name: name.to_string(),
            owner: owner.to_string(),
            members,
            devices,
        });
    }
    Ok(domains)
}

fn bracket_list(s: &str) -> Option<impl Iterator<Item = &str>> {
    let inner = s.strip_prefix('[')?.strip_suffix(']')?;
    Some(inner.split_whitespace())
}

fn render_devices(devices: &[DeviceKey]) -> Vec<u8> {
    let mut out = String::new();
    for d in devices {
        out.push_str(&d.to_string());
        out.push('\n');
    }
    out.into_bytes()
}

fn parse_devices(bytes: &[u8]) -> Result<Vec<DeviceKey>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::CorruptLedger("device ledger is not UTF-8".to_string()))?;

    text.lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            DeviceKey::from_str(line)
                .map_err(|()| Error::CorruptLedger(format!("bad device line: {line}")))
        })
        .collect()
}

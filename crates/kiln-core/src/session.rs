//! Per-connection protocol state machine.
//!
//! # Architecture: Action-Based State Machine
//!
//! The session never touches a socket. Each input produces a list of
//! [`SessionAction`]s for the driver to execute: send a line, send a blob,
//! dispatch a one-time code through the out-of-band channel, or close. This
//! keeps the protocol logic pure and lets tests drive a whole session
//! without I/O.
//!
//! # State Machine
//!
//! ```text
//! AwaitIdentity → AwaitChallenge → AwaitCode → AwaitDeviceId
//!       → AwaitAttestation → Ready ⇄ (command sub-states) → Closed
//! ```
//!
//! Handshake-phase failures are fatal: the peer gets a generic status and
//! the connection closes without revealing which check failed. After the
//! session reaches `Ready`, authorization failures are ordinary replies and
//! the command loop continues.

use std::collections::VecDeque;
use std::sync::Arc;

use kiln_proto::messages::{from_cbor, AttestationProof, SignedChallenge, ALG_ED25519};
use kiln_proto::{Command, Status};

use crate::context::ServerContext;
use crate::crypto;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::registry::{AddDevice, AddMember, DeviceKey, DeviceValidation};

/// Actions returned by the session state machine.
///
/// The driver (production server or test harness) executes these in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send a text line to the peer
    SendLine(String),

    /// Send a length-prefixed binary blob to the peer
    SendBlob(Vec<u8>),

    /// Dispatch a one-time code through the out-of-band channel
    DeliverCode {
        /// Identity the code is addressed to
        recipient: String,
        /// The 5-digit code
        code: String,
    },

    /// Close the connection with this reason (driver-side only, never sent)
    Close {
        /// Reason for closing
        reason: String,
    },
}

/// One unit of peer input, already framed by the wire layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A text line
    Line(String),
    /// A binary blob
    Blob(Vec<u8>),
}

/// What kind of telemetry a submission round is collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelemetryKind {
    Temperature,
    Image,
}

#[derive(Debug)]
enum SessionState {
    /// Waiting for the peer's identity line
    AwaitIdentity,
    /// Nonce issued, waiting for the signed challenge
    AwaitChallenge { known: bool, nonce: u64 },
    /// One-time code dispatched, waiting for it to come back
    AwaitCode { code: String },
    /// Authenticated, waiting for the device id
    AwaitDeviceId,
    /// Device accepted, attestation nonce issued
    AwaitAttestation { nonce: u64 },
    /// Command loop
    Ready,
    /// CREATE accepted, waiting for the owner's wrapped domain key
    AwaitSeedKey { domain: String },
    /// ADD accepted, waiting for the wrapped key for the new member
    AwaitMemberKey { domain: String, target: String },
    /// ET/EI in progress, collecting one ciphertext per domain
    AwaitTelemetry { kind: TelemetryKind, current: String, pending: VecDeque<String> },
    /// Terminal
    Closed,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Executable name devices must attest as
    pub device_binary: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { device_binary: "kiln-device".to_string() }
    }
}

/// Per-connection protocol state machine.
///
/// Holds only transient references: the authenticated user and the
/// validated device, both scoped to this connection. All durable state
/// lives in the shared [`ServerContext`].
pub struct Session<E: Environment> {
    context: Arc<ServerContext>,
    env: E,
    config: SessionConfig,
    state: SessionState,
    user: Option<String>,
    device: Option<DeviceKey>,
}

impl<E: Environment> Session<E> {
    /// Create a session in its initial state.
    pub fn new(context: Arc<ServerContext>, env: E, config: SessionConfig) -> Self {
        Self {
            context,
            env,
            config,
            state: SessionState::AwaitIdentity,
            user: None,
            device: None,
        }
    }

    /// Whether the session has terminated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    /// The authenticated user, once the handshake completed.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// The validated device, once device validation completed.
    #[must_use]
    pub fn device(&self) -> Option<&DeviceKey> {
        self.device.as_ref()
    }

    /// The peer disconnected or the driver hit an I/O error; release the
    /// device's connected slot.
    pub fn on_disconnect(&mut self) {
        self.close();
    }

    /// Feed one unit of peer input through the state machine.
    ///
    /// # Errors
    ///
    /// Only internal failures (storage, corrupt state) surface as errors;
    /// protocol-visible failures come back as actions. The driver should
    /// close the connection on `Err` after calling [`Session::on_disconnect`].
    pub fn on_input(&mut self, input: Input) -> Result<Vec<SessionAction>> {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        match (state, input) {
            (SessionState::AwaitIdentity, Input::Line(identity)) => self.on_identity(identity),
            (SessionState::AwaitChallenge { known, nonce }, Input::Blob(blob)) => {
                self.on_challenge(known, nonce, &blob)
            },
            (SessionState::AwaitCode { code }, Input::Line(entered)) => {
                self.on_code(&code, &entered)
            },
            (SessionState::AwaitDeviceId, Input::Line(id)) => self.on_device_id(&id),
            (SessionState::AwaitAttestation { nonce }, Input::Blob(blob)) => {
                self.on_attestation(nonce, &blob)
            },
            (SessionState::Ready, Input::Line(line)) => self.on_command(&line),
            (SessionState::Ready, Input::Blob(_)) => {
                // A stray blob outside any submission round is recoverable.
                self.state = SessionState::Ready;
                Ok(vec![line(Status::Nok)])
            },
            (SessionState::AwaitSeedKey { domain }, Input::Blob(blob)) => {
                self.on_seed_key(&domain, &blob)
            },
            (SessionState::AwaitMemberKey { domain, target }, Input::Blob(blob)) => {
                self.on_member_key(&domain, &target, &blob)
            },
            (SessionState::AwaitTelemetry { kind, current, pending }, Input::Blob(blob)) => {
                self.on_telemetry(kind, &current, pending, &blob)
            },
            (SessionState::Closed, _) => Ok(Vec::new()),
            // Wrong input type for the current state.
            _ => Ok(self.reject("unexpected input type")),
        }
    }

    // ---- handshake ----

    fn on_identity(&mut self, identity: String) -> Result<Vec<SessionAction>> {
        if !identity_is_valid(&identity) {
            return Ok(self.reject("malformed identity"));
        }

        let known = self.context.users.is_known(&identity);
        let nonce = self.env.random_u64();
        let status = if known { Status::FoundUser } else { Status::NewUser };

        tracing::debug!(identity = %identity, known, "handshake: identity received");
        self.user = Some(identity);
        self.state = SessionState::AwaitChallenge { known, nonce };
        Ok(vec![SessionAction::SendLine(format!("{status};{nonce}"))])
    }

    fn on_challenge(&mut self, known: bool, nonce: u64, blob: &[u8]) -> Result<Vec<SessionAction>> {
        let identity = self.transient_user()?;

        let Ok(challenge) = from_cbor::<SignedChallenge>(blob) else {
            return Ok(self.reject("undecodable challenge"));
        };
        if challenge.algorithm != ALG_ED25519 {
            return Ok(self.reject("unsupported signature algorithm"));
        }
        if challenge.payload != nonce.to_string().into_bytes() {
            return Ok(self.reject("nonce mismatch"));
        }

        // Known users verify against their pinned certificate; the one on
        // the wire is only consulted at first contact.
        let certificate = if known {
            match self.context.users.lookup(&identity) {
                Some(c) => c,
                None => return Ok(self.reject("identity vanished")),
            }
        } else {
            match challenge.certificate {
                Some(c) if c.subject == identity => c,
                _ => return Ok(self.reject("certificate missing or for another subject")),
            }
        };

        if crypto::verify(&certificate.verifying_key, &challenge.payload, &challenge.signature)
            .is_err()
        {
            return Ok(self.reject("bad challenge signature"));
        }

        let status = if known {
            Status::OkUser
        } else {
            self.context.users.register(certificate, &self.env)?;
            Status::OkNewUser
        };

        let code = self.env.one_time_code();
        let deliver = SessionAction::DeliverCode { recipient: identity, code: code.clone() };
        self.state = SessionState::AwaitCode { code };
        Ok(vec![line(status), deliver])
    }

    fn on_code(&mut self, expected: &str, entered: &str) -> Result<Vec<SessionAction>> {
        if entered != expected {
            return Ok(self.reject("one-time code mismatch"));
        }
        tracing::debug!(user = self.user.as_deref(), "handshake: authenticated");
        self.state = SessionState::AwaitDeviceId;
        Ok(vec![line(Status::Ok2fa)])
    }

    fn on_device_id(&mut self, id: &str) -> Result<Vec<SessionAction>> {
        let user = self.transient_user()?;
        let Ok(id) = id.parse::<u32>() else {
            return Ok(self.close_with(Status::NokDevId, "non-numeric device id"));
        };

        let device = DeviceKey::new(user, id);
        match self.context.registry.validate_device(&device)? {
            DeviceValidation::AlreadyConnected => {
                Ok(self.close_with(Status::NokDevId, "device already connected"))
            },
            DeviceValidation::Accepted => {
                tracing::debug!(device = %device, "device validated");
                // A first-contact device just mutated the device ledger.
                self.context.refresh_integrity()?;
                self.device = Some(device);
                let nonce = self.env.random_u64();
                self.state = SessionState::AwaitAttestation { nonce };
                Ok(vec![line(Status::OkDevId), SessionAction::SendLine(nonce.to_string())])
            },
        }
    }

    fn on_attestation(&mut self, nonce: u64, blob: &[u8]) -> Result<Vec<SessionAction>> {
        let Ok(proof) = from_cbor::<AttestationProof>(blob) else {
            return Ok(self.close_with(Status::NokTested, "undecodable attestation proof"));
        };

        let Ok(reference) = self.context.reference_image() else {
            return Ok(self.close_with(Status::NokTested, "no reference image provisioned"));
        };
        let expected = crypto::keyed_hash(&nonce.to_be_bytes(), &reference);

        if proof.binary_name != self.config.device_binary || proof.digest != expected {
            return Ok(self.close_with(Status::NokTested, "attestation mismatch"));
        }

        tracing::info!(
            user = self.user.as_deref(),
            device = %self.device.as_ref().map(ToString::to_string).unwrap_or_default(),
            "session ready"
        );
        self.state = SessionState::Ready;
        Ok(vec![line(Status::OkTested)])
    }

    // ---- command loop ----

    fn on_command(&mut self, input: &str) -> Result<Vec<SessionAction>> {
        self.state = SessionState::Ready;

        let Ok(command) = Command::parse(input) else {
            return Ok(vec![line(Status::Nok)]);
        };

        tracing::debug!(user = self.user.as_deref(), command = input, "command");
        match command {
            Command::Create { domain } => self.cmd_create(&domain),
            Command::Add { user, domain } => self.cmd_add(&user, &domain),
            Command::RegisterDevice { domain } => self.cmd_register_device(&domain),
            Command::MyDomains => self.cmd_my_domains(),
            Command::EncryptTemperature { .. } => self.cmd_submit(TelemetryKind::Temperature),
            Command::EncryptImage { .. } => self.cmd_submit(TelemetryKind::Image),
            Command::ReadTemperatures { domain } => self.cmd_read_temperatures(&domain),
            Command::ReadImage { user, device_id } => self.cmd_read_image(&user, device_id),
        }
    }

    fn cmd_create(&mut self, domain: &str) -> Result<Vec<SessionAction>> {
        if self.context.registry.domain(domain).is_some() {
            return Ok(vec![line(Status::Nok)]);
        }

        // Nothing is claimed yet: the domain only comes into existence once
        // the owner's wrapped seed key arrives. An abandoned CREATE leaves
        // the name free.
        self.state = SessionState::AwaitSeedKey { domain: domain.to_string() };
        Ok(vec![line(Status::Ok)])
    }

    fn on_seed_key(&mut self, domain: &str, blob: &[u8]) -> Result<Vec<SessionAction>> {
        let owner = self.transient_user()?;
        self.state = SessionState::Ready;

        // Key first, domain second: a domain must never exist without its
        // owner's wrapped key. A racing CREATE can take the name between
        // the availability check and here; losing that race removes the
        // orphaned key again, as does a failed domain persist.
        self.context.vault.store(domain, &owner, blob)?;
        let created = match self.context.registry.create_domain(domain, &owner) {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(error = %e, domain, "domain persist failed, rolling back key");
                self.context.vault.remove(domain, &owner)?;
                return Ok(vec![line(Status::Nok)]);
            },
        };
        if !created {
            self.context.vault.remove(domain, &owner)?;
            return Ok(vec![line(Status::Nok)]);
        }
        self.context.refresh_integrity()?;
        Ok(vec![line(Status::Ok)])
    }

    fn cmd_add(&mut self, target: &str, domain: &str) -> Result<Vec<SessionAction>> {
        let caller = self.transient_user()?;

        let Some(snapshot) = self.context.registry.domain(domain) else {
            return Ok(vec![line(Status::NoDomain)]);
        };
        if snapshot.owner != caller {
            return Ok(vec![line(Status::NoPermission)]);
        }
        let Some(target_cert) = self.context.users.lookup(target) else {
            return Ok(vec![line(Status::NoUser)]);
        };
        if snapshot.members.iter().any(|m| m == target) {
            return Ok(vec![line(Status::Nok)]);
        }
        let Some(own_wrapped) = self.context.vault.fetch(domain, &caller)? else {
            return Ok(vec![line(Status::Nok)]);
        };

        // The caller recovers the domain key from its own wrapped copy,
        // re-wraps it under the target's public key, and sends the result.
        self.state =
            SessionState::AwaitMemberKey { domain: domain.to_string(), target: target.to_string() };
        Ok(vec![
            line(Status::Ok),
            SessionAction::SendBlob(own_wrapped),
            SessionAction::SendBlob(target_cert.wrap_key),
        ])
    }

    fn on_member_key(
        &mut self,
        domain: &str,
        target: &str,
        blob: &[u8],
    ) -> Result<Vec<SessionAction>> {
        let caller = self.transient_user()?;
        self.state = SessionState::Ready;

        // Key first, membership second: a failed membership update must
        // remove the orphaned key so the user is never half-added.
        self.context.vault.store(domain, target, blob)?;
        let outcome = match self.context.registry.add_member(domain, &caller, target) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, domain, target, "membership update failed, rolling back key");
                self.context.vault.remove(domain, target)?;
                return Ok(vec![line(Status::Nok)]);
            },
        };

        match outcome {
            AddMember::Added => {
                self.context.refresh_integrity()?;
                Ok(vec![line(Status::Ok)])
            },
            AddMember::NoSuchDomain => {
                self.context.vault.remove(domain, target)?;
                Ok(vec![line(Status::NoDomain)])
            },
            AddMember::NotOwner => {
                self.context.vault.remove(domain, target)?;
                Ok(vec![line(Status::NoPermission)])
            },
            AddMember::AlreadyMember => Ok(vec![line(Status::Nok)]),
        }
    }

    fn cmd_register_device(&mut self, domain: &str) -> Result<Vec<SessionAction>> {
        let device = self.session_device()?;
        match self.context.registry.add_device(domain, &device)? {
            AddDevice::NoSuchDomain => Ok(vec![line(Status::NoDomain)]),
            AddDevice::NotMember => Ok(vec![line(Status::NoPermission)]),
            AddDevice::Added => {
                self.context.refresh_integrity()?;
                Ok(vec![line(Status::Ok)])
            },
        }
    }

    fn cmd_my_domains(&mut self) -> Result<Vec<SessionAction>> {
        let device = self.session_device()?;
        let domains = self.context.registry.domains_of_device(&device);
        if domains.is_empty() {
            return Ok(vec![line(Status::Nrd)]);
        }
        Ok(vec![line(Status::Ok), SessionAction::SendLine(domains.join(","))])
    }

    fn cmd_submit(&mut self, kind: TelemetryKind) -> Result<Vec<SessionAction>> {
        let caller = self.transient_user()?;
        let device = self.session_device()?;

        let mut pending: VecDeque<String> =
            self.context.registry.domains_of_device(&device).into();
        let Some(current) = pending.pop_front() else {
            return Ok(vec![line(Status::Nrd)]);
        };

        let Some(wrapped) = self.context.vault.fetch(&current, &caller)? else {
            return Ok(vec![line(Status::Nok)]);
        };

        let actions = vec![
            line(Status::Ok),
            SessionAction::SendLine(current.clone()),
            SessionAction::SendBlob(wrapped),
        ];
        self.state = SessionState::AwaitTelemetry { kind, current, pending };
        Ok(actions)
    }

    fn on_telemetry(
        &mut self,
        kind: TelemetryKind,
        current: &str,
        mut pending: VecDeque<String>,
        ciphertext: &[u8],
    ) -> Result<Vec<SessionAction>> {
        let caller = self.transient_user()?;
        let device = self.session_device()?;
        self.state = SessionState::Ready;

        let stored = match kind {
            TelemetryKind::Temperature => {
                self.context.telemetry.record_temperature(current, &device, ciphertext)
            },
            TelemetryKind::Image => self.context.telemetry.store_image(current, &device, ciphertext),
        };
        if let Err(e) = stored {
            tracing::warn!(error = %e, domain = current, "telemetry store failed");
            return Ok(vec![line(Status::Nok)]);
        }

        let Some(next) = pending.pop_front() else {
            return Ok(vec![line(Status::Ok)]);
        };
        let Some(wrapped) = self.context.vault.fetch(&next, &caller)? else {
            return Ok(vec![line(Status::Nok)]);
        };

        let actions =
            vec![SessionAction::SendLine(next.clone()), SessionAction::SendBlob(wrapped)];
        self.state = SessionState::AwaitTelemetry { kind, current: next, pending };
        Ok(actions)
    }

    fn cmd_read_temperatures(&mut self, domain: &str) -> Result<Vec<SessionAction>> {
        let caller = self.transient_user()?;
        match self.context.registry.is_member(domain, &caller) {
            None => return Ok(vec![line(Status::NoDomain)]),
            Some(false) => return Ok(vec![line(Status::NoPermission)]),
            Some(true) => {},
        }

        let Some(wrapped) = self.context.vault.fetch(domain, &caller)? else {
            return Ok(vec![line(Status::Nok)]);
        };
        let Some(ledger) = self.context.telemetry.temperature_ledger(domain) else {
            return Ok(vec![line(Status::NoData)]);
        };

        Ok(vec![
            line(Status::Ok),
            SessionAction::SendBlob(wrapped),
            SessionAction::SendBlob(ledger),
        ])
    }

    fn cmd_read_image(&mut self, user: &str, device_id: u32) -> Result<Vec<SessionAction>> {
        let caller = self.transient_user()?;
        let target = DeviceKey::new(user, device_id);

        if !self.context.registry.device_exists(&target) {
            return Ok(vec![line(Status::NoDevice)]);
        }
        let Some(domain) = self.context.registry.shared_domain(&caller, &target) else {
            return Ok(vec![line(Status::NoPermission)]);
        };

        let Some(wrapped) = self.context.vault.fetch(&domain, &caller)? else {
            return Ok(vec![line(Status::Nok)]);
        };
        let Some(image) = self.context.telemetry.fetch_image(&domain, &target)? else {
            return Ok(vec![line(Status::NoData)]);
        };

        Ok(vec![
            line(Status::Ok),
            SessionAction::SendBlob(wrapped),
            SessionAction::SendBlob(image),
        ])
    }

    // ---- helpers ----

    fn reject(&mut self, reason: &str) -> Vec<SessionAction> {
        self.close_with(Status::Nok, reason)
    }

    fn close_with(&mut self, status: Status, reason: &str) -> Vec<SessionAction> {
        tracing::debug!(user = self.user.as_deref(), reason, "session rejected");
        self.close();
        vec![line(status), SessionAction::Close { reason: reason.to_string() }]
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            self.context.registry.disconnect_device(&device);
        }
        self.state = SessionState::Closed;
    }

    fn transient_user(&self) -> Result<String> {
        self.user.clone().ok_or_else(|| Error::Connection("no user bound to session".to_string()))
    }

    fn session_device(&self) -> Result<DeviceKey> {
        self.device
            .clone()
            .ok_or_else(|| Error::Connection("no device bound to session".to_string()))
    }
}

fn line(status: Status) -> SessionAction {
    SessionAction::SendLine(status.as_str().to_string())
}

/// Email-shaped identity check.
///
/// The delimiters of the ledgers and the command grammar (`;`, `,`, `:`,
/// whitespace) are reserved, so identities containing them are rejected
/// outright.
fn identity_is_valid(identity: &str) -> bool {
    let Some((local, host)) = identity.split_once('@') else {
        return false;
    };
    if local.is_empty() || host.is_empty() {
        return false;
    }
    if !host.contains('.') || host.starts_with('.') || host.ends_with('.') || host.contains('@') {
        return false;
    }
    identity
        .chars()
        .all(|c| c.is_ascii_graphic() && !matches!(c, ';' | ',' | ':' | '[' | ']'))
}

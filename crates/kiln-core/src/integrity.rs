//! Tamper-detection ledger over critical persisted state.
//!
//! A keyed hash (HMAC-SHA256) is kept for each tracked artifact: the domain
//! ledger, the device ledger, and the reference executable image. The full
//! map serializes to text lines of `name,<hex digest>` (or `name,absent`)
//! and carries a detached Ed25519 signature under the server's own key.
//! Self-signed: this detects offline tampering between runs, not a
//! compromised server process.
//!
//! Policy is fail-closed: a bad signature or a digest mismatch at startup is
//! a fatal error, not a warning. Every mutation of a tracked artifact must
//! be followed by [`IntegrityVerifier::refresh`] before it counts as
//! durable.

use ed25519_dalek::SigningKey;

use std::sync::Arc;

use crate::crypto::{self, SymmetricKey};
use crate::error::{Error, Result};
use crate::storage::Storage;

/// One tracked artifact: a stable name and its current bytes, if any.
pub struct Artifact {
    /// Stable ledger name
    pub name: &'static str,
    /// Current content; `None` records the artifact as absent
    pub bytes: Option<Vec<u8>>,
}

impl Artifact {
    /// Build an artifact snapshot.
    pub fn new(name: &'static str, bytes: Option<Vec<u8>>) -> Self {
        Self { name, bytes }
    }
}

/// Signed keyed-hash ledger over tracked artifacts.
pub struct IntegrityVerifier {
    storage: Arc<dyn Storage>,
    mac_key: SymmetricKey,
    signing: SigningKey,
}

impl std::fmt::Debug for IntegrityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityVerifier").finish_non_exhaustive()
    }
}

impl IntegrityVerifier {
    /// Open the verifier and check persisted state against the stored
    /// ledger.
    ///
    /// A missing ledger means first run: one is written over the supplied
    /// artifacts. An existing ledger must carry a valid signature and match
    /// every artifact's current digest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityViolation`] on a bad signature or any
    /// digest mismatch. Startup must not proceed past this.
    pub fn bootstrap(
        storage: Arc<dyn Storage>,
        mac_key: SymmetricKey,
        signing: SigningKey,
        artifacts: &[Artifact],
    ) -> Result<Self> {
        let verifier = Self { storage, mac_key, signing };
        match verifier.storage.load_integrity()? {
            Some((ledger, signature)) => {
                let verifying = verifier.signing.verifying_key();
                crypto::verify(verifying.as_bytes(), &ledger, &signature)
                    .map_err(|_| Error::IntegrityViolation("ledger signature"))?;
                verifier.check(&ledger, artifacts)?;
            }
            None => verifier.refresh(artifacts)?,
        }
        Ok(verifier)
    }

    /// Recompute all digests over current artifacts and compare against the
    /// stored ledger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityViolation`] naming the first mismatching
    /// artifact.
    pub fn verify(&self, artifacts: &[Artifact]) -> Result<()> {
        let (ledger, signature) = self
            .storage
            .load_integrity()?
            .ok_or(Error::IntegrityViolation("ledger missing"))?;

        let verifying = self.signing.verifying_key();
        crypto::verify(verifying.as_bytes(), &ledger, &signature)
            .map_err(|_| Error::IntegrityViolation("ledger signature"))?;

        self.check(&ledger, artifacts)
    }

    /// Recompute, re-sign, and persist the ledger. Call after every
    /// mutation of a tracked artifact.
    pub fn refresh(&self, artifacts: &[Artifact]) -> Result<()> {
        let ledger = self.render(artifacts);
        let signature = crypto::sign(&self.signing, &ledger);
        self.storage.store_integrity(&ledger, &signature)?;
        Ok(())
    }

    fn check(&self, stored: &[u8], artifacts: &[Artifact]) -> Result<()> {
        let stored = std::str::from_utf8(stored)
            .map_err(|_| Error::IntegrityViolation("ledger encoding"))?;

        for artifact in artifacts {
            let expected = stored
                .lines()
                .find_map(|line| line.strip_prefix(&format!("{},", artifact.name)))
                .ok_or(Error::IntegrityViolation("untracked artifact"))?;
            if expected != self.entry(artifact) {
                return Err(Error::IntegrityViolation(artifact.name));
            }
        }
        Ok(())
    }

    fn render(&self, artifacts: &[Artifact]) -> Vec<u8> {
        let mut out = String::new();
        for artifact in artifacts {
            out.push_str(&format!("{},{}\n", artifact.name, self.entry(artifact)));
        }
        out.into_bytes()
    }

    fn entry(&self, artifact: &Artifact) -> String {
        match &artifact.bytes {
            Some(bytes) => hex::encode(crypto::keyed_hash(self.mac_key.as_bytes(), bytes)),
            None => "absent".to_string(),
        }
    }
}

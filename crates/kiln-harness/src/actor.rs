//! Client-side protocol actor.
//!
//! A [`DeviceActor`] holds one identity's key material and performs the
//! cryptographic half of the client role: signing challenge nonces,
//! producing attestation proofs over an executable image, and generating,
//! wrapping, and unwrapping domain keys. Tests drive a server-side
//! [`Session`](kiln_core::Session) directly with the blobs an actor
//! produces.

use ed25519_dalek::SigningKey;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use x25519_dalek::{PublicKey as WrapPublicKey, StaticSecret};

use kiln_core::crypto::{self, SymmetricKey};
use kiln_core::{Environment, Error, Result};
use kiln_proto::messages::{to_cbor, AttestationProof, SignedChallenge, ALG_ED25519};
use kiln_proto::Certificate;

/// One identity's client-side key material and protocol operations.
pub struct DeviceActor {
    name: String,
    signing: SigningKey,
    wrap_secret: StaticSecret,
    image: Vec<u8>,
}

impl DeviceActor {
    /// Create an actor with keys derived from a seed, running the given
    /// executable image.
    pub fn new(name: &str, seed: u64, image: &[u8]) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let signing = SigningKey::generate(&mut rng);
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        Self {
            name: name.to_string(),
            signing,
            wrap_secret: StaticSecret::from(secret),
            image: image.to_vec(),
        }
    }

    /// The actor's identity.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The actor's identity certificate.
    #[must_use]
    pub fn certificate(&self) -> Certificate {
        Certificate {
            subject: self.name.clone(),
            verifying_key: self.signing.verifying_key().as_bytes().to_vec(),
            wrap_key: WrapPublicKey::from(&self.wrap_secret).as_bytes().to_vec(),
        }
    }

    /// Answer a challenge nonce: sign its decimal string and encode the
    /// signed challenge, attaching the certificate for first contact.
    ///
    /// # Errors
    ///
    /// Fails if CBOR encoding fails.
    pub fn answer_challenge(&self, nonce: &str, first_contact: bool) -> Result<Vec<u8>> {
        let payload = nonce.as_bytes().to_vec();
        let signature = crypto::sign(&self.signing, &payload);
        let challenge = SignedChallenge {
            payload,
            signature,
            algorithm: ALG_ED25519.to_string(),
            certificate: first_contact.then(|| self.certificate()),
        };
        Ok(to_cbor(&challenge)?)
    }

    /// Produce an attestation proof over this actor's executable image,
    /// keyed with the server's attestation nonce.
    ///
    /// # Errors
    ///
    /// Fails on a non-numeric nonce or a CBOR encoding failure.
    pub fn attestation_proof(&self, nonce: &str, binary_name: &str) -> Result<Vec<u8>> {
        let nonce: u64 = nonce
            .parse()
            .map_err(|_| Error::Connection(format!("non-numeric attestation nonce: {nonce}")))?;
        let proof = AttestationProof {
            binary_name: binary_name.to_string(),
            digest: crypto::keyed_hash(&nonce.to_be_bytes(), &self.image).to_vec(),
        };
        Ok(to_cbor(&proof)?)
    }

    /// Generate a fresh domain key and wrap it under this actor's own
    /// public key, as the owner does when seeding a new domain.
    ///
    /// # Errors
    ///
    /// Fails if the wrap operation fails.
    pub fn seed_domain_key(&self, env: &impl Environment) -> Result<(SymmetricKey, Vec<u8>)> {
        let key = SymmetricKey::generate(env);
        let own_public = WrapPublicKey::from(&self.wrap_secret);
        let blob = crypto::wrap_key(own_public.as_bytes(), &key, env)?;
        Ok((key, blob))
    }

    /// Recover a domain key from this actor's wrapped copy.
    ///
    /// # Errors
    ///
    /// Fails if the blob was not wrapped for this actor.
    pub fn unwrap_domain_key(&self, blob: &[u8]) -> Result<SymmetricKey> {
        Ok(crypto::unwrap_key(&self.wrap_secret, blob)?)
    }

    /// Re-wrap a domain key for another member: unwrap the own copy, wrap
    /// under the target's public key. This is the client side of `ADD`.
    ///
    /// # Errors
    ///
    /// Fails if the own copy does not unwrap or the target key is invalid.
    pub fn rewrap_for(
        &self,
        own_wrapped: &[u8],
        target_public: &[u8],
        env: &impl Environment,
    ) -> Result<Vec<u8>> {
        let key = self.unwrap_domain_key(own_wrapped)?;
        Ok(crypto::wrap_key(target_public, &key, env)?)
    }

    /// Encrypt a telemetry payload under a domain key.
    ///
    /// # Errors
    ///
    /// Fails if sealing fails.
    pub fn encrypt_payload(
        &self,
        key: &SymmetricKey,
        payload: &[u8],
        env: &impl Environment,
    ) -> Result<Vec<u8>> {
        Ok(crypto::seal(key, payload, env)?)
    }

    /// Decrypt a telemetry payload with a domain key.
    ///
    /// # Errors
    ///
    /// Fails on a wrong key or tampered ciphertext.
    pub fn decrypt_payload(&self, key: &SymmetricKey, blob: &[u8]) -> Result<Vec<u8>> {
        Ok(crypto::open(key, blob)?)
    }
}

//! Cryptographic primitives.
//!
//! Pure functions over key material supplied by callers. Nothing here holds
//! state, and all randomness (nonces, ephemeral keys) flows through the
//! [`Environment`] trait so operations replay deterministically in tests.
//!
//! # Operations
//!
//! - Key derivation: HKDF-SHA256 from a passphrase or shared secret.
//! - Symmetric sealing: ChaCha20-Poly1305, random 96-bit nonce prepended to
//!   the ciphertext.
//! - Key wrapping: ECIES over X25519: ephemeral keypair, Diffie-Hellman
//!   with the recipient's static public key, HKDF to an AEAD key, then
//!   ChaCha20-Poly1305. Blob layout: `eph_pub(32) ‖ nonce(12) ‖ ct`.
//! - Signing: Ed25519 detached signatures.
//! - Keyed hashing: HMAC-SHA256.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::{PublicKey as WrapPublicKey, StaticSecret as WrapSecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::env::Environment;

/// Symmetric key length in bytes.
pub const KEY_SIZE: usize = 32;
/// AEAD nonce length in bytes.
pub const NONCE_SIZE: usize = 12;
/// Keyed-hash output length in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Errors from cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// AEAD open failed (wrong key or tampered ciphertext)
    #[error("decryption failed")]
    OpenFailed,

    /// AEAD seal failed
    #[error("encryption failed")]
    SealFailed,

    /// Blob too short or structurally invalid
    #[error("malformed cryptographic blob")]
    MalformedBlob,

    /// Signature did not verify, or key bytes were invalid
    #[error("signature verification failed")]
    BadSignature,

    /// Public key bytes had the wrong length
    #[error("invalid key material")]
    InvalidKey,
}

/// A 256-bit symmetric key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Generate a fresh random key.
    pub fn generate(env: &impl Environment) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        env.random_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing key bytes. The input is zeroized after copying.
    pub fn from_bytes(mut bytes: [u8; KEY_SIZE]) -> Self {
        let key = Self(bytes);
        bytes.zeroize();
        key
    }

    /// Raw key bytes. Never log or persist these.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time comparison via HMAC would be overkill here: key
        // equality is only checked in tests, never on attacker-controlled
        // input paths.
        self.0 == other.0
    }
}

impl Eq for SymmetricKey {}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Derive a symmetric key from a secret with HKDF-SHA256.
///
/// `salt` separates deployments; `context` separates uses of the same secret
/// (at-rest encryption vs. integrity MAC vs. key wrapping).
#[must_use]
pub fn derive_key(secret: &[u8], salt: &[u8], context: &str) -> SymmetricKey {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(context.as_bytes(), &mut okm)
        .unwrap_or_else(|_| unreachable!("{KEY_SIZE} bytes is a valid HKDF-SHA256 output length"));
    SymmetricKey::from_bytes(okm)
}

/// Seal plaintext under a symmetric key: `nonce(12) ‖ ct`.
///
/// # Errors
///
/// Returns [`CryptoError::SealFailed`] if the AEAD rejects the input.
pub fn seal(
    key: &SymmetricKey,
    plaintext: &[u8],
    env: &impl Environment,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    env.random_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher.encrypt(&nonce, plaintext).map_err(|_| CryptoError::SealFailed)?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open a blob produced by [`seal`].
///
/// # Errors
///
/// Returns [`CryptoError::MalformedBlob`] for short input and
/// [`CryptoError::OpenFailed`] for a wrong key or tampered ciphertext.
pub fn open(key: &SymmetricKey, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_SIZE {
        return Err(CryptoError::MalformedBlob);
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher.decrypt(nonce, ciphertext).map_err(|_| CryptoError::OpenFailed)
}

/// Context string binding wrapped-key AEAD keys to this use.
const WRAP_CONTEXT: &str = "kiln-wrap-v1";

/// Wrap a symmetric key under a recipient's X25519 public key.
///
/// The recipient recovers the key with [`unwrap_key`] and their secret key;
/// nobody else can open it, including the server relaying the blob.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] for malformed recipient key bytes and
/// [`CryptoError::SealFailed`] if the AEAD rejects the input.
pub fn wrap_key(
    recipient: &[u8],
    key: &SymmetricKey,
    env: &impl Environment,
) -> Result<Vec<u8>, CryptoError> {
    let recipient_bytes: [u8; 32] = recipient.try_into().map_err(|_| CryptoError::InvalidKey)?;
    let recipient_pub = WrapPublicKey::from(recipient_bytes);

    let mut eph_bytes = [0u8; 32];
    env.random_bytes(&mut eph_bytes);
    let ephemeral = WrapSecretKey::from(eph_bytes);
    eph_bytes.zeroize();
    let ephemeral_pub = WrapPublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&recipient_pub);
    let aead_key = derive_key(shared.as_bytes(), ephemeral_pub.as_bytes(), WRAP_CONTEXT);

    let sealed = seal(&aead_key, key.as_bytes(), env)?;

    let mut blob = Vec::with_capacity(32 + sealed.len());
    blob.extend_from_slice(ephemeral_pub.as_bytes());
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Unwrap a blob produced by [`wrap_key`].
///
/// # Errors
///
/// Returns [`CryptoError::MalformedBlob`] for structurally invalid blobs and
/// [`CryptoError::OpenFailed`] if the blob was not wrapped for this key.
pub fn unwrap_key(secret: &WrapSecretKey, blob: &[u8]) -> Result<SymmetricKey, CryptoError> {
    if blob.len() < 32 + NONCE_SIZE {
        return Err(CryptoError::MalformedBlob);
    }

    let (eph_bytes, sealed) = blob.split_at(32);
    let eph_array: [u8; 32] = eph_bytes.try_into().map_err(|_| CryptoError::MalformedBlob)?;
    let ephemeral_pub = WrapPublicKey::from(eph_array);

    let shared = secret.diffie_hellman(&ephemeral_pub);
    let aead_key = derive_key(shared.as_bytes(), ephemeral_pub.as_bytes(), WRAP_CONTEXT);

    let key_bytes = open(&aead_key, sealed)?;
    let key_array: [u8; KEY_SIZE] =
        key_bytes.as_slice().try_into().map_err(|_| CryptoError::MalformedBlob)?;
    Ok(SymmetricKey::from_bytes(key_array))
}

/// Sign a message with an Ed25519 signing key, returning the detached
/// signature bytes.
#[must_use]
pub fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    key.sign(message).to_bytes().to_vec()
}

/// Verify a detached Ed25519 signature.
///
/// # Errors
///
/// Returns [`CryptoError::BadSignature`] if the key bytes are invalid, the
/// signature bytes are malformed, or verification fails. All three collapse
/// into one error so callers cannot leak which check failed.
pub fn verify(verifying_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key_bytes: [u8; 32] = verifying_key.try_into().map_err(|_| CryptoError::BadSignature)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::BadSignature)?;

    let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| CryptoError::BadSignature)?;
    let sig = Signature::from_bytes(&sig_bytes);

    key.verify(message, &sig).map_err(|_| CryptoError::BadSignature)
}

/// HMAC-SHA256 over `data`, keyed with `key`.
#[must_use]
pub fn keyed_hash(key: &[u8], data: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::env::OsEnv;

    fn wrap_keypair(seed: u8) -> (WrapSecretKey, WrapPublicKey) {
        let secret = WrapSecretKey::from([seed; 32]);
        let public = WrapPublicKey::from(&secret);
        (secret, public)
    }

    #[test]
    fn seal_open_round_trip() {
        let env = OsEnv;
        let key = SymmetricKey::generate(&env);
        let plaintext = b"21.5";

        let blob = seal(&key, plaintext, &env).expect("seal");
        assert_ne!(&blob[NONCE_SIZE..], plaintext.as_slice());

        let recovered = open(&key, &blob).expect("open");
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let env = OsEnv;
        let key = SymmetricKey::generate(&env);
        let other = SymmetricKey::generate(&env);

        let blob = seal(&key, b"secret", &env).expect("seal");
        assert_eq!(open(&other, &blob), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn open_tampered_blob_fails() {
        let env = OsEnv;
        let key = SymmetricKey::generate(&env);

        let mut blob = seal(&key, b"secret", &env).expect("seal");
        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        assert_eq!(open(&key, &blob), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let env = OsEnv;
        let (secret, public) = wrap_keypair(7);
        let domain_key = SymmetricKey::generate(&env);

        let blob = wrap_key(public.as_bytes(), &domain_key, &env).expect("wrap");
        let recovered = unwrap_key(&secret, &blob).expect("unwrap");

        assert_eq!(domain_key, recovered);
    }

    #[test]
    fn unwrap_with_wrong_secret_fails() {
        let env = OsEnv;
        let (_, public) = wrap_keypair(7);
        let (other_secret, _) = wrap_keypair(8);
        let domain_key = SymmetricKey::generate(&env);

        let blob = wrap_key(public.as_bytes(), &domain_key, &env).expect("wrap");
        assert_eq!(unwrap_key(&other_secret, &blob), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn wrap_rejects_malformed_recipient() {
        let env = OsEnv;
        let key = SymmetricKey::generate(&env);
        assert_eq!(wrap_key(&[0u8; 16], &key, &env), Err(CryptoError::InvalidKey));
    }

    #[test]
    fn sign_verify_round_trip() {
        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(1);
        let signing = SigningKey::generate(&mut rng);
        let verifying = signing.verifying_key();

        let message = b"8811223344";
        let signature = sign(&signing, message);

        assert!(verify(verifying.as_bytes(), message, &signature).is_ok());
        assert_eq!(
            verify(verifying.as_bytes(), b"other message", &signature),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn derive_key_contexts_are_independent() {
        let a = derive_key(b"passphrase", b"salt", "at-rest");
        let b = derive_key(b"passphrase", b"salt", "integrity");
        assert_ne!(a, b);

        // Same inputs, same key.
        let c = derive_key(b"passphrase", b"salt", "at-rest");
        assert_eq!(a, c);
    }

    #[test]
    fn keyed_hash_is_key_dependent() {
        let data = b"executable image bytes";
        let a = keyed_hash(&1u64.to_be_bytes(), data);
        let b = keyed_hash(&2u64.to_be_bytes(), data);
        assert_ne!(a, b);
        assert_eq!(a, keyed_hash(&1u64.to_be_bytes(), data));
    }
}

//! Environment abstraction for deterministic testing.
//!
//! Protocol logic in `kiln-core` never reaches for system entropy directly:
//! every nonce, one-time code, and ephemeral key comes through this trait.
//! The harness supplies a seeded implementation so handshakes replay
//! byte-for-byte; production uses OS entropy.
//!
//! Time is deliberately absent. The session protocol defines no timeouts,
//! so nothing in the core needs a clock.

use rand::RngCore;

/// Source of randomness for protocol logic.
///
/// # Invariants
///
/// - Determinism in tests: given the same seed, implementations used by the
///   harness produce the same byte sequence.
/// - Unpredictability in production: [`OsEnv`] draws from the OS entropy
///   pool and is suitable for nonces and key material.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fill the buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generate a random `u64`, used for handshake and attestation nonces.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generate a 5-decimal-digit one-time code, zero-padded.
    fn one_time_code(&self) -> String {
        format!("{:05}", self.random_u64() % 100_000)
    }
}

/// Production environment backed by the OS entropy pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEnv;

impl Environment for OsEnv {
    fn random_bytes(&self, buffer: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buffer);
    }
}

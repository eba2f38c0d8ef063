//! Deterministic test harness for the Kiln protocol.
//!
//! Provides a seeded [`Environment`](kiln_core::Environment) implementation
//! so whole handshakes replay byte-for-byte, and a [`DeviceActor`] that
//! performs the client side of the protocol: answering signed challenges,
//! producing attestation proofs, and handling domain keys.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod actor;
pub mod sim_env;

pub use actor::DeviceActor;
pub use sim_env::SimEnv;

//! # Kiln Core: Secure Telemetry Server
//!
//! Server-side core of the Kiln protocol: per-connection session state
//! machines, the identity/domain/device stores they consult, the wrapped-key
//! vault, the tamper-detection integrity ledger, and the dispatcher that
//! drives sessions over accepted connections.
//!
//! ## Architecture
//!
//! The session layer is a sans-IO action machine: it consumes framed inputs
//! and returns actions (send a line, send a blob, deliver a one-time code,
//! close) for a driver to execute. All randomness flows through the
//! [`Environment`] trait, so every handshake replays deterministically under
//! a seeded environment.
//!
//! Durable state lives behind the [`storage::Storage`] trait. Stores are
//! plain objects constructed once at startup into a [`ServerContext`] and
//! shared by reference across connection tasks; nothing is a process-wide
//! singleton.
//!
//! ## Security Model
//!
//! - Authentication binds a signed nonce challenge to a pinned certificate,
//!   plus an out-of-band one-time code.
//! - Device attestation compares a nonce-keyed hash of the client's binary
//!   against a server-held reference copy.
//! - Telemetry is only ever stored as ciphertext under per-domain keys the
//!   server cannot open; the vault relays wrapped blobs.
//! - An Ed25519-signed keyed-hash ledger over the persisted registries
//!   fails the server closed on offline tampering.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod crypto;
pub mod env;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod vault;

pub use context::ServerContext;
pub use env::{Environment, OsEnv};
pub use error::{Error, Result};
pub use registry::DeviceKey;
pub use server::{read_message, write_message, CodeDelivery, Server};
pub use session::{Input, Session, SessionAction, SessionConfig};

//! # Kiln Protocol: Wire Format
//!
//! This crate implements the wire layer for the Kiln secure telemetry
//! protocol: the framing codec, the status token vocabulary, the command
//! grammar, and the CBOR message payloads exchanged during authentication
//! and attestation.
//!
//! ## Protocol Design
//!
//! The protocol is a request/response conversation over an already-secured
//! stream. Two kinds of messages cross the wire:
//!
//! - **Text lines**: status tokens, commands, and short listings. Encoded as
//!   UTF-8 with a one-byte tag and a Big Endian `u32` length prefix.
//! - **Binary blobs**: wrapped keys, certificates, signed challenges, and
//!   telemetry ciphertexts. Same framing, different tag.
//!
//! Structured blobs (certificates, signed challenges, attestation proofs)
//! are CBOR-encoded with explicit schemas. The signed challenge carries
//! `{payload, signature, algorithm, certificate}` field-by-field rather
//! than relying on any language-native object graph.
//!
//! ## Security Properties
//!
//! - **Size Limits**: message bodies are capped at 1 MiB. Oversized frames
//!   are rejected before any allocation happens.
//!
//! - **Explicit Validation**: all parsing functions validate invariants and
//!   return `Result` types. Unknown status tokens and commands are errors,
//!   never silently ignored.
//!
//! - **No Code Execution**: CBOR is a pure data format; every payload has an
//!   explicit Rust struct definition.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod errors;
pub mod messages;
pub mod status;
pub mod wire;

pub use command::Command;
pub use errors::{ProtocolError, Result};
pub use messages::{AttestationProof, Certificate, SignedChallenge};
pub use status::Status;
pub use wire::WireMessage;

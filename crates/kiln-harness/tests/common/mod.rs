//! Shared fixtures for harness tests.

#![allow(dead_code)]

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use kiln_core::storage::{MemoryStorage, Storage};
use kiln_core::{Input, ServerContext, Session, SessionAction, SessionConfig};
use kiln_harness::{DeviceActor, SimEnv};

/// The reference device executable every well-behaved actor runs.
pub const REFERENCE_IMAGE: &[u8] = b"\x7fELF kiln-device reference build";
/// Expected binary name in attestation proofs.
pub const DEVICE_BINARY: &str = "kiln-device";
pub const PASSPHRASE: &str = "correct horse battery staple";
pub const SALT: &[u8] = b"kiln-test-deployment";

pub fn server_signing_key() -> SigningKey {
    SigningKey::generate(&mut ChaCha20Rng::seed_from_u64(0x5E17))
}

/// Fresh context over in-memory storage with the reference image provisioned.
pub fn new_context() -> (Arc<ServerContext>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    storage.store_reference_image(REFERENCE_IMAGE).unwrap();
    let context =
        ServerContext::open(storage.clone(), server_signing_key(), PASSPHRASE, SALT).unwrap();
    (context, storage)
}

pub fn new_session(context: &Arc<ServerContext>, seed: u64) -> Session<SimEnv> {
    Session::new(context.clone(), SimEnv::with_seed(seed), SessionConfig::default())
}

pub fn actor(name: &str, seed: u64) -> DeviceActor {
    DeviceActor::new(name, seed, REFERENCE_IMAGE)
}

pub fn sent_line(action: &SessionAction) -> &str {
    match action {
        SessionAction::SendLine(line) => line,
        other => panic!("expected SendLine, got {other:?}"),
    }
}

pub fn sent_blob(action: &SessionAction) -> &[u8] {
    match action {
        SessionAction::SendBlob(blob) => blob,
        other => panic!("expected SendBlob, got {other:?}"),
    }
}

/// Drive a session through the full handshake, device validation, and
/// attestation for this actor.
pub fn authenticate(session: &mut Session<SimEnv>, actor: &DeviceActor, device_id: u32) {
    let actions = session.on_input(Input::Line(actor.name().to_string())).unwrap();
    let (status, nonce) = sent_line(&actions[0]).split_once(';').unwrap();
    let first_contact = status == "NEW-USER";

    let answer = actor.answer_challenge(nonce, first_contact).unwrap();
    let actions = session.on_input(Input::Blob(answer)).unwrap();
    assert!(matches!(sent_line(&actions[0]), "OK-NEW-USER" | "OK-USER"));
    let SessionAction::DeliverCode { code, .. } = &actions[1] else {
        panic!("expected DeliverCode, got {:?}", actions[1]);
    };

    let actions = session.on_input(Input::Line(code.clone())).unwrap();
    assert_eq!(sent_line(&actions[0]), "OK-2FA");

    let actions = session.on_input(Input::Line(device_id.to_string())).unwrap();
    assert_eq!(sent_line(&actions[0]), "OK-DEVID");
    let nonce = sent_line(&actions[1]).to_string();

    let proof = actor.attestation_proof(&nonce, DEVICE_BINARY).unwrap();
    let actions = session.on_input(Input::Blob(proof)).unwrap();
    assert_eq!(sent_line(&actions[0]), "OK-TESTED");
}

/// Seed a domain: `CREATE`, then the owner's wrapped copy of a fresh key.
/// Returns the raw domain key held client-side.
pub fn create_domain(
    session: &mut Session<SimEnv>,
    owner: &DeviceActor,
    env: &SimEnv,
    domain: &str,
) -> kiln_core::crypto::SymmetricKey {
    let actions = session.on_input(Input::Line(format!("CREATE;{domain}"))).unwrap();
    assert_eq!(sent_line(&actions[0]), "OK");

    let (key, blob) = owner.seed_domain_key(env).unwrap();
    let actions = session.on_input(Input::Blob(blob)).unwrap();
    assert_eq!(sent_line(&actions[0]), "OK");
    key
}

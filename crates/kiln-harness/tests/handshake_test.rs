//! Authentication handshake behavior over real client-side crypto.

mod common;

use common::*;
use kiln_core::{Input, SessionAction};

#[test]
fn full_handshake_with_real_keys() {
    let (context, _) = new_context();
    let alice = actor("alice@example.com", 1);
    let mut session = new_session(&context, 10);

    authenticate(&mut session, &alice, 1);
    assert_eq!(session.user(), Some("alice@example.com"));
    assert!(context.users.is_known("alice@example.com"));
}

#[test]
fn handshake_is_deterministic_under_a_seeded_environment() {
    let run = |seed: u64| -> Vec<String> {
        let (context, _) = new_context();
        let alice = actor("alice@example.com", 1);
        let mut session = new_session(&context, seed);

        let mut transcript = Vec::new();
        let actions = session.on_input(Input::Line(alice.name().to_string())).unwrap();
        transcript.push(sent_line(&actions[0]).to_string());

        let (_, nonce) = transcript[0].split_once(';').unwrap();
        let answer = alice.answer_challenge(nonce, true).unwrap();
        let actions = session.on_input(Input::Blob(answer)).unwrap();
        transcript.push(sent_line(&actions[0]).to_string());
        if let SessionAction::DeliverCode { code, .. } = &actions[1] {
            transcript.push(code.clone());
        }
        transcript
    };

    assert_eq!(run(42), run(42));
    assert_ne!(run(42)[0], run(43)[0], "different seeds must issue different nonces");
}

#[test]
fn second_session_verifies_against_the_pinned_certificate() {
    let (context, _) = new_context();
    let alice = actor("alice@example.com", 1);
    let mut first = new_session(&context, 10);
    authenticate(&mut first, &alice, 1);
    first.on_disconnect();

    // Same identity, different key material. The wire certificate must be
    // ignored in favor of the pinned one.
    let impostor = actor("alice@example.com", 666);
    let mut second = new_session(&context, 11);
    let actions = second.on_input(Input::Line(impostor.name().to_string())).unwrap();
    let (status, nonce) = sent_line(&actions[0]).split_once(';').unwrap();
    assert_eq!(status, "FOUND-USER");

    let answer = impostor.answer_challenge(nonce, true).unwrap();
    let actions = second.on_input(Input::Blob(answer)).unwrap();
    assert_eq!(sent_line(&actions[0]), "NOK");
    assert!(second.is_closed());
}

#[test]
fn replayed_challenge_answer_is_rejected() {
    let (context, _) = new_context();
    let alice = actor("alice@example.com", 1);

    let mut first = new_session(&context, 10);
    let actions = first.on_input(Input::Line(alice.name().to_string())).unwrap();
    let (_, nonce) = sent_line(&actions[0]).split_once(';').unwrap();
    let recorded_answer = alice.answer_challenge(nonce, true).unwrap();
    let actions = first.on_input(Input::Blob(recorded_answer.clone())).unwrap();
    assert!(matches!(sent_line(&actions[0]), "OK-NEW-USER"));
    first.on_disconnect();

    // A fresh session issues a fresh nonce; the recorded answer no longer
    // matches it.
    let mut second = new_session(&context, 11);
    second.on_input(Input::Line(alice.name().to_string())).unwrap();
    let actions = second.on_input(Input::Blob(recorded_answer)).unwrap();
    assert_eq!(sent_line(&actions[0]), "NOK");
    assert!(second.is_closed());
}

#[test]
fn tampered_attestation_image_fails() {
    let (context, _) = new_context();
    // Valid identity keys, different binary bytes.
    let tampered =
        kiln_harness::DeviceActor::new("alice@example.com", 1, b"\x7fELF trojaned build");

    let mut session = new_session(&context, 10);
    let actions = session.on_input(Input::Line(tampered.name().to_string())).unwrap();
    let (_, nonce) = sent_line(&actions[0]).split_once(';').unwrap();
    let answer = tampered.answer_challenge(nonce, true).unwrap();
    let actions = session.on_input(Input::Blob(answer)).unwrap();
    let SessionAction::DeliverCode { code, .. } = &actions[1] else { panic!() };
    session.on_input(Input::Line(code.clone())).unwrap();

    let actions = session.on_input(Input::Line("1".to_string())).unwrap();
    assert_eq!(sent_line(&actions[0]), "OK-DEVID");
    let nonce = sent_line(&actions[1]).to_string();

    // The proof is honestly computed, but over the wrong image.
    let proof = tampered.attestation_proof(&nonce, DEVICE_BINARY).unwrap();
    let actions = session.on_input(Input::Blob(proof)).unwrap();
    assert_eq!(sent_line(&actions[0]), "NOK-TESTED");
    assert!(session.is_closed());
}

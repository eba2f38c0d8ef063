//! Full protocol run over a real TCP connection through the dispatcher.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use common::*;
use kiln_core::{read_message, write_message, CodeDelivery, Result, Server, SessionConfig};
use kiln_harness::SimEnv;
use kiln_proto::WireMessage;

/// Captures one-time codes in a channel instead of a notification service.
struct ChannelDelivery(mpsc::UnboundedSender<(String, String)>);

#[async_trait]
impl CodeDelivery for ChannelDelivery {
    async fn deliver(&self, recipient: &str, code: &str) -> Result<()> {
        self.0
            .send((recipient.to_string(), code.to_string()))
            .map_err(|e| kiln_core::Error::Connection(e.to_string()))
    }
}

async fn read_line(stream: &mut TcpStream) -> String {
    match read_message(stream).await.unwrap() {
        WireMessage::Line(line) => line,
        WireMessage::Blob(_) => panic!("expected line, got blob"),
    }
}

async fn read_blob(stream: &mut TcpStream) -> Vec<u8> {
    match read_message(stream).await.unwrap() {
        WireMessage::Blob(blob) => blob.to_vec(),
        WireMessage::Line(line) => panic!("expected blob, got line {line:?}"),
    }
}

async fn send_line(stream: &mut TcpStream, line: &str) {
    write_message(stream, &WireMessage::Line(line.to_string())).await.unwrap();
}

async fn send_blob(stream: &mut TcpStream, blob: Vec<u8>) {
    write_message(stream, &WireMessage::Blob(Bytes::from(blob))).await.unwrap();
}

#[tokio::test]
async fn full_session_over_tcp() {
    let (context, _) = new_context();
    let (tx, mut codes) = mpsc::unbounded_channel();
    let server = Arc::new(Server::new(
        context,
        SimEnv::with_seed(1),
        SessionConfig::default(),
        Arc::new(ChannelDelivery(tx)),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = server.clone();
    tokio::spawn(async move {
        let _ = acceptor.serve(listener).await;
    });

    let env = SimEnv::with_seed(2);
    let alice = actor("alice@example.com", 1);
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Handshake.
    send_line(&mut stream, alice.name()).await;
    let reply = read_line(&mut stream).await;
    let (status, nonce) = reply.split_once(';').unwrap();
    assert_eq!(status, "NEW-USER");

    send_blob(&mut stream, alice.answer_challenge(nonce, true).unwrap()).await;
    assert_eq!(read_line(&mut stream).await, "OK-NEW-USER");

    let (recipient, code) = codes.recv().await.unwrap();
    assert_eq!(recipient, "alice@example.com");
    send_line(&mut stream, &code).await;
    assert_eq!(read_line(&mut stream).await, "OK-2FA");

    // Device validation and attestation.
    send_line(&mut stream, "1").await;
    assert_eq!(read_line(&mut stream).await, "OK-DEVID");
    let nonce = read_line(&mut stream).await;
    send_blob(&mut stream, alice.attestation_proof(&nonce, DEVICE_BINARY).unwrap()).await;
    assert_eq!(read_line(&mut stream).await, "OK-TESTED");

    assert_eq!(server.live_sessions(), 1);

    // Domain setup.
    send_line(&mut stream, "CREATE;lab").await;
    assert_eq!(read_line(&mut stream).await, "OK");
    let (domain_key, seed_blob) = alice.seed_domain_key(&env).unwrap();
    send_blob(&mut stream, seed_blob).await;
    assert_eq!(read_line(&mut stream).await, "OK");

    send_line(&mut stream, "RD;lab").await;
    assert_eq!(read_line(&mut stream).await, "OK");

    send_line(&mut stream, "MYDOMAINS").await;
    assert_eq!(read_line(&mut stream).await, "OK");
    assert_eq!(read_line(&mut stream).await, "lab");

    // Submit a reading.
    send_line(&mut stream, "ET;21.5").await;
    assert_eq!(read_line(&mut stream).await, "OK");
    assert_eq!(read_line(&mut stream).await, "lab");
    let wrapped = read_blob(&mut stream).await;
    let key = alice.unwrap_domain_key(&wrapped).unwrap();
    assert_eq!(key, domain_key);
    send_blob(&mut stream, alice.encrypt_payload(&key, b"21.5", &env).unwrap()).await;
    assert_eq!(read_line(&mut stream).await, "OK");

    // Read it back and decrypt.
    send_line(&mut stream, "RT;lab").await;
    assert_eq!(read_line(&mut stream).await, "OK");
    let key = alice.unwrap_domain_key(&read_blob(&mut stream).await).unwrap();
    let ledger = String::from_utf8(read_blob(&mut stream).await).unwrap();
    let (device, hex_ct) = ledger.trim_end().split_once(',').unwrap();
    assert_eq!(device, "alice@example.com:1");
    let reading = alice.decrypt_payload(&key, &hex::decode(hex_ct).unwrap()).unwrap();
    assert_eq!(reading, b"21.5");
}

#[tokio::test]
async fn duplicate_device_over_tcp_is_turned_away() {
    let (context, _) = new_context();
    let (tx, mut codes) = mpsc::unbounded_channel();
    let server = Arc::new(Server::new(
        context,
        SimEnv::with_seed(3),
        SessionConfig::default(),
        Arc::new(ChannelDelivery(tx)),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = server.clone();
    tokio::spawn(async move {
        let _ = acceptor.serve(listener).await;
    });

    let alice = actor("alice@example.com", 1);

    let (status, _first_stream) =
        authenticate_to_devid(addr, &alice, &mut codes, true).await;
    assert_eq!(status, "OK-DEVID");

    let (status, _second_stream) =
        authenticate_to_devid(addr, &alice, &mut codes, false).await;
    assert_eq!(status, "NOK-DEVID");
}

/// Run one connection up to the device-id reply.
async fn authenticate_to_devid(
    addr: std::net::SocketAddr,
    alice: &kiln_harness::DeviceActor,
    codes: &mut mpsc::UnboundedReceiver<(String, String)>,
    first_contact: bool,
) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_line(&mut stream, alice.name()).await;
    let reply = read_line(&mut stream).await;
    let (_, nonce) = reply.split_once(';').unwrap();
    send_blob(&mut stream, alice.answer_challenge(nonce, first_contact).unwrap()).await;
    read_line(&mut stream).await;
    let (_, code) = codes.recv().await.unwrap();
    send_line(&mut stream, &code).await;
    assert_eq!(read_line(&mut stream).await, "OK-2FA");
    send_line(&mut stream, "1").await;
    (read_line(&mut stream).await, stream)
}

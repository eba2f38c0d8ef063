//! Session dispatcher: accept loop, per-connection tasks, wire I/O.
//!
//! One task per accepted connection, all running against the shared
//! [`ServerContext`]. The task reads framed messages, feeds them through the
//! [`Session`] state machine, and executes the returned actions. The secure
//! transport itself (certificate-authenticated, encrypted stream) is the
//! listener's concern: the dispatcher works over any stream handed to it
//! and assumes channel confidentiality is already established.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use kiln_proto::{ProtocolError, WireMessage};

use crate::context::ServerContext;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::session::{Input, Session, SessionAction, SessionConfig};

/// Out-of-band one-time-code delivery.
///
/// Production implementations talk to an external notification service;
/// tests capture codes in a channel.
#[async_trait]
pub trait CodeDelivery: Send + Sync + 'static {
    /// Deliver a one-time code to an identity through the secondary channel.
    async fn deliver(&self, recipient: &str, code: &str) -> Result<()>;
}

/// Read one framed message from a stream.
///
/// # Errors
///
/// Fails on stream errors, an oversized length claim, an unknown tag, or a
/// text body that is not UTF-8.
pub async fn read_message<R>(reader: &mut R) -> Result<WireMessage>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; WireMessage::HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > WireMessage::MAX_BODY {
        return Err(ProtocolError::BodyTooLarge { size: len, max: WireMessage::MAX_BODY }.into());
    }

    let mut frame = header.to_vec();
    frame.resize(WireMessage::HEADER_SIZE + len, 0);
    reader
        .read_exact(&mut frame[WireMessage::HEADER_SIZE..])
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;

    let (message, _) = WireMessage::decode(&frame)?;
    Ok(message)
}

/// Write one framed message to a stream.
///
/// # Errors
///
/// Fails on stream errors or an oversized body.
pub async fn write_message<W>(writer: &mut W, message: &WireMessage) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut wire = Vec::with_capacity(WireMessage::HEADER_SIZE + message.body_len());
    message.encode(&mut wire)?;
    writer.write_all(&wire).await.map_err(|e| Error::Connection(e.to_string()))?;
    writer.flush().await.map_err(|e| Error::Connection(e.to_string()))?;
    Ok(())
}

/// Session dispatcher.
pub struct Server<E: Environment> {
    context: Arc<ServerContext>,
    env: E,
    config: SessionConfig,
    delivery: Arc<dyn CodeDelivery>,
    live: Arc<AtomicUsize>,
}

impl<E: Environment> Server<E> {
    /// Build a dispatcher over a shared context.
    pub fn new(
        context: Arc<ServerContext>,
        env: E,
        config: SessionConfig,
        delivery: Arc<dyn CodeDelivery>,
    ) -> Self {
        Self { context, env, config, delivery, live: Arc::new(AtomicUsize::new(0)) }
    }

    /// Number of currently live sessions.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Accept connections forever, one task per session.
    ///
    /// # Errors
    ///
    /// Only fails if the listener itself breaks; per-connection failures are
    /// logged and end that session only.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| Error::Connection(e.to_string()))?;
            tracing::info!(%peer, "connection accepted");

            let session =
                Session::new(self.context.clone(), self.env.clone(), self.config.clone());
            let delivery = self.delivery.clone();
            let live = self.live.clone();

            live.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Err(e) = drive_session(stream, session, delivery).await {
                    tracing::warn!(%peer, error = %e, "session ended with error");
                }
                live.fetch_sub(1, Ordering::SeqCst);
                tracing::info!(%peer, "connection closed");
            });
        }
    }
}

/// Drive one session over a stream until it closes.
async fn drive_session<E, S>(
    mut stream: S,
    mut session: Session<E>,
    delivery: Arc<dyn CodeDelivery>,
) -> Result<()>
where
    E: Environment,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let result = async {
        while !session.is_closed() {
            let input = match read_message(&mut stream).await? {
                WireMessage::Line(text) => Input::Line(text),
                WireMessage::Blob(bytes) => Input::Blob(bytes.to_vec()),
            };

            for action in session.on_input(input)? {
                match action {
                    SessionAction::SendLine(text) => {
                        write_message(&mut stream, &WireMessage::Line(text)).await?;
                    },
                    SessionAction::SendBlob(bytes) => {
                        write_message(&mut stream, &WireMessage::Blob(Bytes::from(bytes))).await?;
                    },
                    SessionAction::DeliverCode { recipient, code } => {
                        delivery.deliver(&recipient, &code).await?;
                    },
                    SessionAction::Close { reason } => {
                        tracing::debug!(reason, "closing session");
                    },
                }
            }
        }
        Ok(())
    }
    .await;

    // Always release the device's connected slot, whatever ended the loop.
    session.on_disconnect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_round_trip_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_message(&mut client, &WireMessage::Line("CREATE;lab".to_string())).await.unwrap();
        write_message(&mut client, &WireMessage::Blob(Bytes::from_static(b"wrapped"))).await.unwrap();

        let first = read_message(&mut server).await.unwrap();
        assert_eq!(first, WireMessage::Line("CREATE;lab".to_string()));
        let second = read_message(&mut server).await.unwrap();
        assert_eq!(second, WireMessage::Blob(Bytes::from_static(b"wrapped")));
    }

    #[tokio::test]
    async fn oversized_length_claim_is_rejected_before_reading_the_body() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let mut hostile = vec![kiln_proto::wire::TAG_BLOB];
        hostile.extend_from_slice(&u32::MAX.to_be_bytes());
        client.write_all(&hostile).await.unwrap();

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(Error::Proto(ProtocolError::BodyTooLarge { .. }))));
    }

    #[tokio::test]
    async fn peer_disconnect_surfaces_as_connection_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }
}

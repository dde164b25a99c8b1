//! Transport: one client's message pipe.
//!
//! Reception is pull-based: the handler calls [`Transport::arm`] and the
//! transport then yields at most one event. Until the handler re-arms,
//! [`Transport::next_event`] stays pending, so a slow handler throttles
//! its own peer instead of buffering unbounded input.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(Bytes),
    Closed,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
    #[error("transport closed")]
    Closed,
}

pub trait Transport: Send {
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Allow exactly one more inbound event.
    fn arm(&mut self);

    /// Cancel-safe. Pending forever while not armed; disarms on return.
    fn next_event(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Write one message and flush it.
    fn send(&mut self, message: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

// ── TCP ───────────────────────────────────────────────────────────────────────

/// Messages framed by a 4-byte big-endian length prefix.
pub struct TcpTransport {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    armed: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_message_bytes: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_message_bytes)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
            armed: false,
        }
    }
}

impl Transport for TcpTransport {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.framed.get_ref().peer_addr()
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    async fn next_event(&mut self) -> TransportEvent {
        if !self.armed {
            return std::future::pending().await;
        }
        // Framed keeps partial reads in its own buffer, so dropping this
        // future mid-frame loses nothing.
        let event = match self.framed.next().await {
            Some(Ok(frame)) => TransportEvent::Message(frame.freeze()),
            Some(Err(e)) => TransportEvent::Error(e.to_string()),
            None => TransportEvent::Closed,
        };
        self.armed = false;
        event
    }

    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        self.framed.send(message).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(e) = SinkExt::<Bytes>::close(&mut self.framed).await {
            tracing::debug!(error = %e, "transport shutdown failed");
        }
    }
}

// ── Scripted transport for tests ──────────────────────────────────────────────

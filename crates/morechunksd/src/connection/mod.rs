//! Connection handler: one task per client, one event at a time.
//!
//! The task waits on three things: the next inbound message (only while
//! armed), the dispatcher's send timer, and server shutdown. Whichever
//! fires is handled to completion before anything else is looked at.
//! After each inbound message the transport is re-armed for exactly one
//! more; a kick skips the re-arm and holds for its grace period instead.

pub mod dispatcher;
pub mod transport;

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::broadcast;

use morechunks_core::{wire, ChunkPosition, InboundPacket, InfoMessage};
use morechunks_services::policy::{self, Decision, Ignored, Kick};
use morechunks_services::{
    ConnectionId, ConnectionSnapshot, ConnectionTable, DisconnectReason, LiveLimits, Phase,
    SharedStore,
};

use dispatcher::{ChunkDispatcher, Pacing};
use transport::{Transport, TransportError, TransportEvent};

/// Shared collaborators handed to every connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub store: SharedStore,
    pub limits: LiveLimits,
    pub table: ConnectionTable,
}

/// Failures before a connection is considered established.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to resolve peer address: {0}")]
    PeerAddress(#[source] std::io::Error),
    #[error("failed to send handshake: {0}")]
    Handshake(#[source] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectionState {
    pub peer_addr: SocketAddr,
    /// Chunks per second the client asked for. The server cap is applied
    /// separately at send time.
    pub requested_rate: u32,
    pub chunks_uploaded: u64,
}

pub const DEFAULT_REQUESTED_RATE: u32 = 1;

enum Flow {
    Continue,
    Kick(Kick),
    Terminate(DisconnectReason),
}

pub struct Connection<T: Transport> {
    id: ConnectionId,
    transport: T,
    ctx: ConnectionContext,
    state: ConnectionState,
    dispatcher: ChunkDispatcher,
    shutdown: broadcast::Receiver<()>,
}

impl<T: Transport> Connection<T> {
    /// Resolve the peer, send the handshake and arm for the first message.
    pub async fn establish(
        id: ConnectionId,
        mut transport: T,
        ctx: ConnectionContext,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self, ConnectionError> {
        let peer_addr = transport.peer_addr().map_err(ConnectionError::PeerAddress)?;
        transport
            .send(wire::encode_info_frame(wire::HANDSHAKE_TEXT))
            .await
            .map_err(ConnectionError::Handshake)?;
        transport.arm();

        let conn = Self {
            id,
            transport,
            ctx,
            state: ConnectionState {
                peer_addr,
                requested_rate: DEFAULT_REQUESTED_RATE,
                chunks_uploaded: 0,
            },
            dispatcher: ChunkDispatcher::new(),
            shutdown,
        };
        conn.publish(Phase::Active);
        tracing::info!(id, peer = %peer_addr, "connection established");
        Ok(conn)
    }

    /// Process events until the connection ends. Returns why it ended.
    pub async fn run(mut self) -> DisconnectReason {
        let reason = loop {
            let flow = tokio::select! {
                _ = self.shutdown.recv() => Flow::Terminate(DisconnectReason::Shutdown),
                event = self.transport.next_event() => self.on_transport_event(event).await,
                _ = self.dispatcher.timer_fired() => self.dispatch_next().await,
            };

            match flow {
                Flow::Continue => self.publish(Phase::Active),
                Flow::Kick(kick) => break self.kick(kick).await,
                Flow::Terminate(reason) => break reason,
            }
        };

        self.dispatcher.cancel();
        self.ctx.table.remove(&self.id);
        self.transport.shutdown().await;
        tracing::info!(
            id = self.id,
            peer = %self.state.peer_addr,
            delivered = self.dispatcher.delivered(),
            uploaded = self.state.chunks_uploaded,
            %reason,
            "connection terminated"
        );
        reason
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Message(message) => {
                let flow = self.on_message(message).await;
                if matches!(flow, Flow::Continue) {
                    self.transport.arm();
                }
                flow
            }
            TransportEvent::Closed => Flow::Terminate(DisconnectReason::TransportClosed),
            TransportEvent::Error(e) => Flow::Terminate(DisconnectReason::TransportError(e)),
        }
    }

    async fn on_message(&mut self, message: Bytes) -> Flow {
        let packet = match wire::decode_message(message) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(
                    id = self.id,
                    peer = %self.state.peer_addr,
                    error = %e,
                    "malformed packet, ignoring"
                );
                return Flow::Continue;
            }
        };

        match packet {
            InboundPacket::Upload { position, blob } => {
                self.on_upload(position, blob);
                Flow::Continue
            }
            InboundPacket::Info(info) => self.on_info(info),
            InboundPacket::ChunksRequest {
                positions,
                trailing_bytes,
            } => {
                if trailing_bytes > 0 && positions.is_empty() {
                    // Nothing but a partial position: leave the current queue alone.
                    tracing::warn!(
                        id = self.id,
                        trailing_bytes,
                        "chunks request shorter than one position, ignoring"
                    );
                    return Flow::Continue;
                }
                if trailing_bytes > 0 {
                    tracing::warn!(
                        id = self.id,
                        trailing_bytes,
                        "chunks request has a partial position, dropping the remainder"
                    );
                }
                tracing::debug!(id = self.id, count = positions.len(), "chunks requested");
                self.submit(positions).await
            }
            InboundPacket::Unknown { tag, payload } => {
                tracing::debug!(
                    id = self.id,
                    tag,
                    len = payload.len(),
                    head = %hex::encode(&payload[..payload.len().min(16)]),
                    "unknown packet tag, ignoring"
                );
                Flow::Continue
            }
        }
    }

    fn on_upload(&mut self, position: ChunkPosition, blob: Bytes) {
        let len = blob.len();
        match self.ctx.store.store(position, blob) {
            Ok(()) => {
                self.state.chunks_uploaded += 1;
                tracing::trace!(id = self.id, %position, len, "chunk uploaded");
            }
            Err(e) => tracing::warn!(id = self.id, %position, error = %e, "failed to store chunk"),
        }
    }

    fn on_info(&mut self, info: InfoMessage) -> Flow {
        match policy::evaluate(&info, &self.ctx.limits) {
            Decision::Accept => {
                tracing::debug!(id = self.id, ?info, "info accepted");
                Flow::Continue
            }
            Decision::SetRate(rate) => {
                tracing::debug!(
                    id = self.id,
                    from = self.state.requested_rate,
                    to = rate,
                    "requested rate changed"
                );
                self.state.requested_rate = rate;
                Flow::Continue
            }
            Decision::Ignore(Ignored::InvalidRate(value)) => {
                tracing::warn!(
                    id = self.id,
                    value = %value,
                    "invalid chunksPerSecond, keeping current rate"
                );
                Flow::Continue
            }
            Decision::Ignore(Ignored::UnknownKey(text)) => {
                tracing::debug!(id = self.id, text = %text, "unknown info key, ignoring");
                Flow::Continue
            }
            Decision::Kick(kick) => Flow::Kick(kick),
        }
    }

    async fn submit(&mut self, positions: Vec<ChunkPosition>) -> Flow {
        let pacing = Pacing {
            store: &*self.ctx.store,
            requested_rate: self.state.requested_rate,
            limits: &self.ctx.limits,
        };
        let result = self
            .dispatcher
            .submit(positions, &mut self.transport, pacing)
            .await;
        Self::after_send(result)
    }

    async fn dispatch_next(&mut self) -> Flow {
        let pacing = Pacing {
            store: &*self.ctx.store,
            requested_rate: self.state.requested_rate,
            limits: &self.ctx.limits,
        };
        let result = self
            .dispatcher
            .on_timer_fired(&mut self.transport, pacing)
            .await;
        Self::after_send(result)
    }

    fn after_send(result: Result<Option<ChunkPosition>, TransportError>) -> Flow {
        match result {
            Ok(_) => Flow::Continue,
            Err(e) => Flow::Terminate(DisconnectReason::TransportError(e.to_string())),
        }
    }

    /// Send the notices, then hold without reading or sending until the
    /// grace period is over. Only shutdown cuts the hold short.
    async fn kick(&mut self, kick: Kick) -> DisconnectReason {
        tracing::warn!(
            id = self.id,
            peer = %self.state.peer_addr,
            reason = %kick.reason,
            grace_ms = kick.grace.as_millis() as u64,
            "kicking client"
        );
        for notice in &kick.notices {
            if let Err(e) = self.transport.send(wire::encode_info_frame(notice)).await {
                return DisconnectReason::TransportError(e.to_string());
            }
        }

        self.dispatcher.cancel();
        self.publish(Phase::Kicked {
            reason: kick.reason.clone(),
        });

        tokio::select! {
            _ = tokio::time::sleep(kick.grace) => {}
            _ = self.shutdown.recv() => {
                tracing::debug!(id = self.id, "shutdown during kick hold");
            }
        }
        kick.reason
    }

    /// Cheap regardless of queue length: `pending` shares the dispatcher's
    /// request rather than copying it.
    fn snapshot_in(&self, phase: Phase) -> ConnectionSnapshot {
        let pending = self.dispatcher.pending();
        ConnectionSnapshot {
            id: self.id,
            peer_addr: self.state.peer_addr,
            requested_rate: self.state.requested_rate,
            pending_len: pending.len(),
            pending,
            timer_armed: self.dispatcher.has_timer(),
            phase,
            chunks_delivered: self.dispatcher.delivered(),
            chunks_uploaded: self.state.chunks_uploaded,
        }
    }

    fn publish(&self, phase: Phase) {
        self.ctx.table.insert(self.id, self.snapshot_in(phase));
    }
}

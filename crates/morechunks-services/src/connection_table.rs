//! Connection table: live snapshots of every connected client.
//!
//! Each handler publishes a fresh snapshot after every event it processes
//! and removes its entry when it terminates. Reads are synchronous and
//! never touch the handler itself.
//!
//! Publishing is O(1) in the queue length: the pending queue is shared
//! with the dispatcher and only copied out when a reader lists it.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Serialize, Serializer};

use morechunks_core::ChunkPosition;

use crate::policy::DisconnectReason;

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Phase {
    Active,
    /// Notices sent, waiting out the grace period before disconnecting.
    Kicked { reason: DisconnectReason },
}

/// The part of a chunk request still waiting to be sent.
///
/// Cloning shares the request's allocation with the dispatcher. Positions
/// are copied only by [`PendingQueue::to_vec`] or when serialised.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    request: Arc<[ChunkPosition]>,
    next: usize,
}

impl PendingQueue {
    /// `next` is the index of the first unsent position in `request`.
    pub fn new(request: Arc<[ChunkPosition]>, next: usize) -> Self {
        let next = next.min(request.len());
        Self { request, next }
    }

    pub fn as_slice(&self) -> &[ChunkPosition] {
        &self.request[self.next..]
    }

    pub fn len(&self) -> usize {
        self.request.len() - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<ChunkPosition> {
        self.as_slice().to_vec()
    }

    /// True when both views point into the same request allocation.
    pub fn shares_request_with(&self, other: &PendingQueue) -> bool {
        Arc::ptr_eq(&self.request, &other.request)
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(Arc::from(Vec::new()), 0)
    }
}

impl PartialEq for PendingQueue {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for PendingQueue {}

impl Serialize for PendingQueue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.as_slice())
    }
}

/// One connection's state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub requested_rate: u32,
    pub pending_len: usize,
    pub pending: PendingQueue,
    pub timer_armed: bool,
    pub phase: Phase,
    pub chunks_delivered: u64,
    pub chunks_uploaded: u64,
}

pub type ConnectionTable = Arc<DashMap<ConnectionId, ConnectionSnapshot>>;

/// Create a new empty connection table.
pub fn new_connection_table() -> ConnectionTable {
    Arc::new(DashMap::new())
}

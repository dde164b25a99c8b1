//! Chunk dispatcher: drains a connection's request queue at a bounded rate.
//!
//! One queue, one timer. A send arms the timer; the next send waits for it
//! to fire. Positions the store does not have are skipped on the spot and
//! cost nothing, so a request full of misses drains immediately.
//!
//! The queue is the request as received plus a cursor. It is never copied
//! while draining, so handing it to the connection table is cheap.

use std::pin::Pin;
use std::sync::Arc;

use tokio::time::Sleep;

use morechunks_core::{wire, ChunkPosition};
use morechunks_services::{rate, ChunkStore, LiveLimits, PendingQueue};

use super::transport::{Transport, TransportError};

/// Everything a dispatch step reads but does not own.
pub struct Pacing<'a> {
    pub store: &'a dyn ChunkStore,
    pub requested_rate: u32,
    pub limits: &'a LiveLimits,
}

pub struct ChunkDispatcher {
    request: Arc<[ChunkPosition]>,
    /// Index of the next position in `request` to try.
    next: usize,
    /// The only pending send timer. Replacing or clearing it cancels it.
    timer: Option<Pin<Box<Sleep>>>,
    delivered: u64,
}

impl Default for ChunkDispatcher {
    fn default() -> Self {
        Self {
            request: Arc::from(Vec::new()),
            next: 0,
            timer: None,
            delivered: 0,
        }
    }
}

impl ChunkDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending send, install `positions` as the whole queue and
    /// send the first available chunk right away.
    pub async fn submit<T: Transport>(
        &mut self,
        positions: Vec<ChunkPosition>,
        transport: &mut T,
        pacing: Pacing<'_>,
    ) -> Result<Option<ChunkPosition>, TransportError> {
        self.cancel();
        self.request = positions.into();
        self.next = 0;
        self.step(transport, pacing).await
    }

    /// Called once the timer from the previous send has elapsed.
    pub async fn on_timer_fired<T: Transport>(
        &mut self,
        transport: &mut T,
        pacing: Pacing<'_>,
    ) -> Result<Option<ChunkPosition>, TransportError> {
        self.step(transport, pacing).await
    }

    /// Completes when the pending timer elapses, and clears it. Pending
    /// forever when no timer is set. Cancel-safe.
    pub async fn timer_fired(&mut self) {
        match self.timer.as_mut() {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
        self.timer = None;
    }

    pub fn cancel(&mut self) {
        self.timer = None;
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// A view of the unsent positions that shares the request allocation.
    pub fn pending(&self) -> PendingQueue {
        PendingQueue::new(self.request.clone(), self.next)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Send the next stored chunk in the queue and arm the timer.
    /// Returns the delivered position, or `None` once the queue is empty.
    async fn step<T: Transport>(
        &mut self,
        transport: &mut T,
        pacing: Pacing<'_>,
    ) -> Result<Option<ChunkPosition>, TransportError> {
        while let Some(&position) = self.request.get(self.next) {
            self.next += 1;
            let blob = match pacing.store.retrieve(position) {
                Ok(Some(blob)) => blob,
                Ok(None) => {
                    tracing::trace!(%position, "chunk not stored, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%position, error = %e, "chunk retrieve failed, skipping");
                    continue;
                }
            };

            transport.send(wire::encode_chunk_frame(&blob)).await?;
            self.delivered += 1;

            // Cap is re-read on every send so operator changes apply at once.
            let interval = rate::send_interval(
                pacing.requested_rate,
                pacing.limits.max_chunks_per_second(),
            );
            self.timer = Some(Box::pin(tokio::time::sleep(interval)));
            tracing::trace!(%position, interval_ms = interval.as_millis() as u64, "chunk sent");
            return Ok(Some(position));
        }
        if !self.request.is_empty() {
            self.request = Arc::from(Vec::new());
            self.next = 0;
        }
        Ok(None)
    }
}

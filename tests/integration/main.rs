//! MoreChunks integration test harness.
//!
//! Every test starts its own in-process server on an ephemeral loopback
//! port and talks to it over real TCP with length-prefixed frames:
//!
//!   cargo test --test integration
//!
//! Servers use the memory store, so tests share nothing.

mod infra;
mod lifecycle;
mod protocol;

pub use infra::*;

use morechunks_core::wire::{self, ServerFrame};

// ── Smoke tests ───────────────────────────────────────────────────────────────

/// A fresh connection is greeted with the render distance notice.
#[tokio::test]
async fn test_handshake_received() {
    let server = Server::start().await.unwrap();
    let mut client = server.connect_raw().await.unwrap();

    let frame = client.recv().await.unwrap();
    assert_eq!(frame, ServerFrame::Info(wire::HANDSHAKE_TEXT.to_string()));
}

/// The handler appears in the connection table once established.
#[tokio::test]
async fn test_connection_listed_in_table() {
    let server = Server::start().await.unwrap();
    let _client = server.connect().await.unwrap();

    assert!(server.wait_for(|t| t.len() == 1).await, "connection never published");
    let snap = server.table.iter().next().map(|e| e.value().clone()).unwrap();
    assert_eq!(snap.id, 1);
    assert_eq!(snap.requested_rate, 1);
    assert!(snap.peer_addr.ip().is_loopback());
}

/// Ids increase per accepted connection.
#[tokio::test]
async fn test_connection_ids_increase() {
    let server = Server::start().await.unwrap();
    let _a = server.connect().await.unwrap();
    let _b = server.connect().await.unwrap();

    assert!(server.wait_for(|t| t.len() == 2).await);
    let mut ids: Vec<u64> = server.table.iter().map(|e| *e.key()).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2]);
}

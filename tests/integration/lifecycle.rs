use bytes::Bytes;

use crate::*;

/// Closing the client removes its entry from the connection table.
#[tokio::test]
async fn test_client_close_removes_entry() {
    let server = Server::start().await.unwrap();
    let client = server.connect().await.unwrap();
    assert!(server.wait_for(|t| t.len() == 1).await);

    client.close().await.unwrap();
    assert!(
        server.wait_for(|t| t.is_empty()).await,
        "entry left behind after client close"
    );
}

/// Server shutdown closes every live connection and stops accepting.
#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = Server::start().await.unwrap();
    let mut a = server.connect().await.unwrap();
    let mut b = server.connect().await.unwrap();
    assert!(server.wait_for(|t| t.len() == 2).await);

    let table = server.table.clone();
    let addr = server.addr;
    server.shutdown().await.unwrap();

    a.expect_closed().await.unwrap();
    b.expect_closed().await.unwrap();
    assert!(table.is_empty());
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

/// Shutdown ends a kick hold early instead of waiting out the minute.
#[tokio::test]
async fn test_shutdown_during_kick_hold() {
    let server = Server::start().await.unwrap();
    let mut client = server.connect().await.unwrap();

    client.info("game.dimension=-1").await.unwrap();
    client.recv().await.unwrap();
    client.recv().await.unwrap();

    server.shutdown().await.unwrap();
    client.expect_closed().await.unwrap();
}

/// A frame over the size limit is a transport error and ends the connection.
#[tokio::test]
async fn test_oversize_frame_terminates() {
    let server = Server::start().await.unwrap();
    let mut client = server.connect().await.unwrap();
    assert!(server.wait_for(|t| t.len() == 1).await);

    let huge = vec![0u8; MAX_MESSAGE_BYTES + 1];
    // The server may reset before the whole frame is written.
    let _ = client.send(Bytes::from(huge)).await;

    assert!(server.wait_for(|t| t.is_empty()).await);
}

/// Lowering the server cap at runtime slows a client that asked for more.
#[tokio::test]
async fn test_live_cap_applies_without_reconnect() {
    use morechunks_core::wire;
    use morechunks_core::ChunkPosition;
    use morechunks_services::ChunkStore;
    use std::time::{Duration, Instant};

    let server = Server::start().await.unwrap();
    let positions: Vec<ChunkPosition> = (0..3).map(|i| ChunkPosition::new(0, i)).collect();
    for &p in &positions {
        let mut blob = p.cx.to_be_bytes().to_vec();
        blob.extend_from_slice(&p.cz.to_be_bytes());
        server.store.store(p, Bytes::from(blob)).unwrap();
    }

    let mut client = server.connect().await.unwrap();
    client.info("mod.chunksPerSecond=1000").await.unwrap();
    server.limits.set_max_chunks_per_second(5);
    client
        .send(wire::encode_chunks_request(&positions))
        .await
        .unwrap();

    client.recv().await.unwrap();
    let started = Instant::now();
    for _ in &positions[1..] {
        client.recv().await.unwrap();
    }
    // Two 200ms gaps after the first send at the lowered cap.
    assert!(started.elapsed() >= Duration::from_millis(380));
}

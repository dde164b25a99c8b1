use std::time::{Duration, Instant};

use bytes::Bytes;
use morechunks_core::wire::{self, ServerFrame};
use morechunks_core::ChunkPosition;
use morechunks_services::ChunkStore;

use crate::*;

const QUIET: Duration = Duration::from_millis(200);

/// A stored blob as clients upload it: position first, then chunk data.
fn blob(p: ChunkPosition, data: &[u8]) -> Bytes {
    let mut v = p.cx.to_be_bytes().to_vec();
    v.extend_from_slice(&p.cz.to_be_bytes());
    v.extend_from_slice(data);
    Bytes::from(v)
}

fn chunk_body(frame: &ServerFrame) -> &[u8] {
    match frame {
        ServerFrame::Chunk(blob) => &blob[8..],
        ServerFrame::Info(text) => panic!("expected chunk, got info {text:?}"),
    }
}

/// A chunk uploaded by one client is served to another.
#[tokio::test]
async fn test_upload_then_request_from_another_client() {
    let server = Server::start().await.unwrap();
    let pos = ChunkPosition::new(12, -40);

    let mut uploader = server.connect().await.unwrap();
    uploader
        .send(wire::encode_upload(1_700_000_000, pos, b"terrain"))
        .await
        .unwrap();
    assert!(
        server.wait_for(|_| server.store.count() == 1).await,
        "upload never stored"
    );

    let mut reader = server.connect().await.unwrap();
    reader.send(wire::encode_chunks_request(&[pos])).await.unwrap();
    let frame = reader.recv().await.unwrap();
    assert_eq!(frame.position(), Some(pos));
    assert_eq!(chunk_body(&frame), b"terrain");
}

/// Missing positions are skipped silently; present ones are sent in order.
#[tokio::test]
async fn test_request_skips_missing_chunks() {
    let server = Server::start().await.unwrap();
    let (a, b) = (ChunkPosition::new(0, 0), ChunkPosition::new(3, 3));
    for p in [a, b] {
        server.store.store(p, blob(p, b"x")).unwrap();
    }

    let mut client = server.connect().await.unwrap();
    client.info("mod.chunksPerSecond=50").await.unwrap();
    client
        .send(wire::encode_chunks_request(&[
            ChunkPosition::new(9, 9),
            a,
            ChunkPosition::new(8, 8),
            b,
        ]))
        .await
        .unwrap();

    assert_eq!(client.recv().await.unwrap().position(), Some(a));
    assert_eq!(client.recv().await.unwrap().position(), Some(b));
    client.expect_silence(QUIET).await.unwrap();
}

/// Deliveries respect the requested rate over a real socket.
#[tokio::test]
async fn test_deliveries_are_paced() {
    let server = Server::start().await.unwrap();
    let positions: Vec<ChunkPosition> = (0..3).map(|i| ChunkPosition::new(i, 0)).collect();
    for &p in &positions {
        server.store.store(p, blob(p, b"")).unwrap();
    }

    let mut client = server.connect().await.unwrap();
    client.info("mod.chunksPerSecond=10").await.unwrap();
    client
        .send(wire::encode_chunks_request(&positions))
        .await
        .unwrap();

    assert_eq!(client.recv().await.unwrap().position(), Some(positions[0]));
    let started = Instant::now();
    for &p in &positions[1..] {
        assert_eq!(client.recv().await.unwrap().position(), Some(p));
    }
    // Two 100ms gaps after the first send.
    assert!(started.elapsed() >= Duration::from_millis(180));
}

/// Unknown tags and malformed uploads leave the connection usable.
#[tokio::test]
async fn test_bad_messages_are_tolerated() {
    let server = Server::start().await.unwrap();
    let pos = ChunkPosition::new(1, 2);
    server.store.store(pos, blob(pos, b"")).unwrap();

    let mut client = server.connect().await.unwrap();
    client
        .send(Bytes::from_static(&[9, 1, 2, 3]))
        .await
        .unwrap();
    client
        .send(Bytes::from_static(&[wire::tag::CHUNK, 0, 0, 0]))
        .await
        .unwrap();
    client.expect_silence(QUIET).await.unwrap();

    client.send(wire::encode_chunks_request(&[pos])).await.unwrap();
    assert_eq!(client.recv().await.unwrap().position(), Some(pos));
    assert_eq!(server.store.count(), 1);
}

/// A request with a partial trailing position still serves the whole ones.
#[tokio::test]
async fn test_truncated_request_is_lenient() {
    let server = Server::start().await.unwrap();
    let pos = ChunkPosition::new(-5, 7);
    server.store.store(pos, blob(pos, b"")).unwrap();

    let mut client = server.connect().await.unwrap();
    let mut message = wire::encode_chunks_request(&[pos]).to_vec();
    message.extend_from_slice(&[0, 0, 1]);
    client.send(Bytes::from(message)).await.unwrap();

    assert_eq!(client.recv().await.unwrap().position(), Some(pos));
}

/// Uploading the same position twice keeps only the newest blob.
#[tokio::test]
async fn test_upload_overwrites() {
    let server = Server::start().await.unwrap();
    let pos = ChunkPosition::new(4, 4);

    let mut client = server.connect().await.unwrap();
    client.send(wire::encode_upload(1, pos, b"old")).await.unwrap();
    client.send(wire::encode_upload(2, pos, b"new")).await.unwrap();
    assert!(
        server
            .wait_for(|t| t.iter().any(|c| c.chunks_uploaded == 2))
            .await
    );

    client.send(wire::encode_chunks_request(&[pos])).await.unwrap();
    let frame = client.recv().await.unwrap();
    assert_eq!(chunk_body(&frame), b"new");
    assert_eq!(server.store.count(), 1);
}

/// A wrong dimension draws both notices before the hold begins.
#[tokio::test]
async fn test_wrong_dimension_notices() {
    let server = Server::start().await.unwrap();
    let mut client = server.connect().await.unwrap();

    client.info("game.dimension=1").await.unwrap();
    assert_eq!(
        client.recv().await.unwrap(),
        ServerFrame::Info("i3 You're not in the overworld".into())
    );
    assert_eq!(
        client.recv().await.unwrap(),
        ServerFrame::Info("! kick ms=60000".into())
    );
    assert!(
        server
            .wait_for(|t| t
                .iter()
                .any(|c| matches!(c.phase, morechunks_services::Phase::Kicked { .. })))
            .await
    );
}

/// An allow-listed version is accepted and the connection keeps serving.
#[tokio::test]
async fn test_allowed_version_is_accepted() {
    let server = Server::start_with(morechunks_core::config::LimitsConfig {
        max_chunks_per_second: 80,
        allowed_versions: Some(vec!["1.0".into()]),
    })
    .await
    .unwrap();
    let mut client = server.connect().await.unwrap();

    client.info("mod.version=1.0").await.unwrap();
    client.expect_silence(QUIET).await.unwrap();
}

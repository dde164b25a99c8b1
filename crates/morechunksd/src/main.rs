//! morechunksd: MoreChunks chunk sharing daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use morechunks_core::config::{MoreChunksConfig, StorageBackend};
use morechunks_services::{
    new_connection_table, ChunkStore, DiskStore, LiveLimits, MemoryStore, SharedStore,
};

use morechunksd::connection::ConnectionContext;
use morechunksd::listener::{self, ServerContext};
use morechunksd::status::{self, StatusState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MoreChunksConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MoreChunksConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MoreChunksConfig::default()
    });
    tracing::info!(
        listen = %config.network.listen_addr,
        max_chunks_per_second = config.limits.max_chunks_per_second,
        allowed_versions = ?config.limits.allowed_versions,
        "morechunksd starting"
    );

    // Chunk store
    let store: SharedStore = match config.storage.backend {
        StorageBackend::Memory => {
            tracing::info!("chunk store: memory");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::Disk => {
            let disk = DiskStore::new(&config.storage.path)
                .context("failed to open chunk store")?;
            tracing::info!(
                root = %disk.root().display(),
                chunks = disk.count(),
                "chunk store: disk"
            );
            Arc::new(disk)
        }
    };

    // Shared state
    let limits = LiveLimits::new(&config.limits);
    let table = new_connection_table();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    #[cfg(unix)]
    {
        let limits = limits.clone();
        let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .context("failed to install SIGHUP handler")?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                match MoreChunksConfig::load() {
                    Ok(reloaded) => {
                        limits.apply(&reloaded.limits);
                        tracing::info!(
                            max_chunks_per_second = reloaded.limits.max_chunks_per_second,
                            allowed_versions = ?reloaded.limits.allowed_versions,
                            "limits reloaded"
                        );
                    }
                    Err(e) => tracing::warn!(error = %e, "config reload failed, keeping limits"),
                }
            }
        });
    }

    // Status HTTP endpoint
    let status_port = config.network.status_port;
    if status_port != 0 {
        let state = StatusState {
            table: table.clone(),
            store: store.clone(),
            limits: limits.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, status_port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let tcp = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    let ctx = ServerContext {
        connection: ConnectionContext {
            store: store.clone(),
            limits,
            table: table.clone(),
        },
        max_message_bytes: config.network.max_message_bytes,
    };
    let listener_task = tokio::spawn(listener::serve(tcp, ctx, shutdown_tx.clone()));

    let table_printer = {
        let table = table.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(
                    count = table.len(),
                    stored = store.count(),
                    "connection table snapshot"
                );
                for c in table.iter() {
                    tracing::debug!(
                        id = c.id,
                        peer = %c.peer_addr,
                        rate = c.requested_rate,
                        pending = c.pending_len,
                        delivered = c.chunks_delivered,
                        "  connection"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = listener_task      => tracing::error!("listener exited: {:?}", r),
        r = table_printer      => tracing::error!("table printer exited: {:?}", r),
    }

    // Give live connections a moment to release their transports.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !table.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}

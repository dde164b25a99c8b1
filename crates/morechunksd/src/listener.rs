//! TCP accept loop. Every accepted client gets its own connection task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::connection::transport::TcpTransport;
use crate::connection::{Connection, ConnectionContext};

#[derive(Clone)]
pub struct ServerContext {
    pub connection: ConnectionContext,
    pub max_message_bytes: usize,
}

/// Accept clients until shutdown is broadcast. Connection ids start at 1
/// and are never reused within one run.
pub async fn serve(
    listener: TcpListener,
    ctx: ServerContext,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let next_id = Arc::new(AtomicU64::new(1));
    let mut shutdown_rx = shutdown.subscribe();
    tracing::info!(addr = %listener.local_addr()?, "chunk listener ready");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("chunk listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(%peer, error = %e, "set_nodelay failed");
                }

                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let transport = TcpTransport::new(stream, ctx.max_message_bytes);
                let connection_ctx = ctx.connection.clone();
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move {
                    match Connection::establish(id, transport, connection_ctx, shutdown_rx).await {
                        Ok(conn) => {
                            conn.run().await;
                        }
                        Err(e) => {
                            tracing::warn!(id, %peer, error = %e, "connection not established")
                        }
                    }
                });
            }
        }
    }
}

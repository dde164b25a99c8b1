//! Shared helpers: an in-process server and a framed TCP client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use morechunks_core::config::LimitsConfig;
use morechunks_core::wire::{self, ServerFrame};
use morechunks_services::{new_connection_table, ConnectionTable, LiveLimits, MemoryStore};

use morechunksd::connection::ConnectionContext;
use morechunksd::listener::{self, ServerContext};

/// How long any single wait is allowed to take before a test fails.
pub const WAIT: Duration = Duration::from_secs(5);

pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

// ── Server ────────────────────────────────────────────────────────────────────

pub struct Server {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub limits: LiveLimits,
    pub table: ConnectionTable,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Server {
    pub async fn start() -> Result<Self> {
        Self::start_with(LimitsConfig::default()).await
    }

    pub async fn start_with(limits: LimitsConfig) -> Result<Self> {
        let tcp = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind loopback listener")?;
        let addr = tcp.local_addr()?;
        let store = Arc::new(MemoryStore::new());
        let limits = LiveLimits::new(&limits);
        let table = new_connection_table();
        let (shutdown, _) = broadcast::channel(1);

        let ctx = ServerContext {
            connection: ConnectionContext {
                store: store.clone(),
                limits: limits.clone(),
                table: table.clone(),
            },
            max_message_bytes: MAX_MESSAGE_BYTES,
        };
        let task = tokio::spawn(listener::serve(tcp, ctx, shutdown.clone()));

        Ok(Self {
            addr,
            store,
            limits,
            table,
            shutdown,
            task,
        })
    }

    /// Connect without reading anything.
    pub async fn connect_raw(&self) -> Result<Client> {
        let stream = TcpStream::connect(self.addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.addr))?;
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(MAX_MESSAGE_BYTES)
            .new_codec();
        Ok(Client {
            framed: Framed::new(stream, codec),
        })
    }

    /// Connect and consume the handshake.
    pub async fn connect(&self) -> Result<Client> {
        let mut client = self.connect_raw().await?;
        match client.recv().await? {
            ServerFrame::Info(text) if text == wire::HANDSHAKE_TEXT => Ok(client),
            other => bail!("unexpected first frame: {other:?}"),
        }
    }

    /// Broadcast shutdown and wait for the accept loop to return.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(WAIT, self.task)
            .await
            .context("listener did not stop")??
    }

    /// Poll the connection table until `check` holds or [`WAIT`] passes.
    pub async fn wait_for(&self, check: impl Fn(&ConnectionTable) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if check(&self.table) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(&self.table)
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct Client {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Client {
    pub async fn send(&mut self, message: Bytes) -> Result<()> {
        self.framed.send(message).await.context("send failed")
    }

    pub async fn info(&mut self, text: &str) -> Result<()> {
        self.send(wire::encode_info_frame(text)).await
    }

    /// Next server frame, failing on close or after [`WAIT`].
    pub async fn recv(&mut self) -> Result<ServerFrame> {
        match tokio::time::timeout(WAIT, self.framed.next()).await {
            Err(_) => bail!("timed out waiting for a frame"),
            Ok(None) => bail!("connection closed"),
            Ok(Some(frame)) => Ok(ServerFrame::decode(frame?.freeze())?),
        }
    }

    /// Expect no frame for `quiet`. Fails if one arrives or the peer closes.
    pub async fn expect_silence(&mut self, quiet: Duration) -> Result<()> {
        match tokio::time::timeout(quiet, self.framed.next()).await {
            Err(_) => Ok(()),
            Ok(None) => bail!("connection closed"),
            Ok(Some(frame)) => {
                bail!("unexpected frame: {:?}", ServerFrame::decode(frame?.freeze()))
            }
        }
    }

    /// Wait for the server to close the connection, skipping any frames.
    pub async fn expect_closed(&mut self) -> Result<()> {
        let closed = async {
            while let Some(frame) = self.framed.next().await {
                if frame.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(WAIT, closed)
            .await
            .context("server did not close the connection")
    }

    pub async fn close(mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.framed).await.context("close failed")
    }
}

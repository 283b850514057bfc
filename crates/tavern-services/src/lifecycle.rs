//! Client connection lifecycle.
//!
//! ```text
//! Disconnected → Connecting → Connected → Disconnecting → Disconnected
//!                    │            │
//!                    └─ failure ──┴─ involuntary loss → Disconnected
//! ```
//!
//! A connection is Connected only after the host accepted the handshake.
//! `disconnect` is the expected way out. Any other loss tears down the
//! replicated campaign and starts a standalone session instead; there is no
//! automatic reconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};

use tavern_core::wire::Channel;
use tavern_core::{AssetChunk, HandshakeRequest, HandshakeResponse, ServerPolicy};

use crate::connection::{
    recv_handshake, send_handshake, CloseReason, Connection, ConnectionError, ConnectionHandle,
    FrameHandler,
};
use crate::context::SessionContext;
use crate::dispatch::CommandDispatcher;
use crate::pump::ChunkPump;
use crate::qos::TokenBucket;
use crate::transfer::AssetTransferManager;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// Local, unshared campaign.
    Standalone,
    /// Replica of a host's campaign.
    Joined { host: String },
}

/// The application side of a fallback: owns the replicated campaign and can
/// replace it with a local one.
pub trait ReplicaHost: Send + Sync {
    /// Discard state replicated from the host.
    fn teardown_replica(&self);
    /// Bring up a local session the user can keep working in.
    fn start_standalone(&self) -> anyhow::Result<()>;
}

struct ActiveLink {
    handle: ConnectionHandle,
    pump_shutdown: broadcast::Sender<()>,
}

struct LifecycleInner {
    ctx: SessionContext,
    replica: Arc<dyn ReplicaHost>,
    expected: AtomicBool,
    generation: AtomicU64,
    active: Mutex<Option<ActiveLink>>,
    mode: watch::Sender<SessionMode>,
}

#[derive(Clone)]
pub struct ConnectionLifecycle {
    inner: Arc<LifecycleInner>,
}

impl ConnectionLifecycle {
    pub fn new(ctx: SessionContext, replica: Arc<dyn ReplicaHost>) -> Self {
        let (mode, _) = watch::channel(SessionMode::Standalone);
        Self {
            inner: Arc::new(LifecycleInner {
                ctx,
                replica,
                expected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                active: Mutex::new(None),
                mode,
            }),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.inner.ctx
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.ctx.state()
    }

    pub fn mode(&self) -> SessionMode {
        self.inner.mode.borrow().clone()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<SessionMode> {
        self.inner.mode.subscribe()
    }

    /// Open a TCP connection to `address` and join.
    pub async fn connect(&self, address: &str) -> Result<ServerPolicy, ConnectionError> {
        self.begin_connecting()?;
        let timeout = self.inner.ctx.config().network.handshake_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.inner.ctx.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
            Err(_) => {
                self.inner.ctx.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::HandshakeTimeout);
            }
        };
        let _ = stream.set_nodelay(true);
        self.join(stream, address.to_string()).await
    }

    /// Join over an already-open stream.
    pub async fn connect_stream<S>(&self, stream: S, peer: impl Into<String>) -> Result<ServerPolicy, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.begin_connecting()?;
        self.join(stream, peer.into()).await
    }

    fn begin_connecting(&self) -> Result<(), ConnectionError> {
        let ctx = &self.inner.ctx;
        if !ctx.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Err(ConnectionError::Protocol(format!(
                "cannot connect while {:?}",
                ctx.state()
            )));
        }
        Ok(())
    }

    async fn join<S>(&self, mut stream: S, peer: String) -> Result<ServerPolicy, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = &self.inner.ctx;
        let identity = &ctx.config().identity;
        let request = HandshakeRequest::new(identity.name.clone(), identity.role, identity.password.clone());

        tracing::info!(%peer, name = %request.name, role = %request.role, "joining host");
        let handshake = async {
            send_handshake(&mut stream, &request).await?;
            let response: HandshakeResponse = recv_handshake(&mut stream).await?;
            Ok::<_, ConnectionError>(response.into_result()?)
        };
        let policy = match tokio::time::timeout(ctx.config().network.handshake_timeout(), handshake).await {
            Ok(Ok(policy)) => policy,
            Ok(Err(e)) => {
                tracing::warn!(%peer, error = %e, "handshake failed");
                ctx.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(%peer, "handshake timed out");
                ctx.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::HandshakeTimeout);
            }
        };
        ctx.set_policy(policy.clone());

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (handle, connection) = Connection::new(stream, peer.clone(), ctx.activity().clone());
        let (pump_shutdown, pump_rx) = broadcast::channel(1);

        let transfer_cfg = &ctx.config().transfer;
        let pump = ChunkPump::new(
            ctx.transfers().clone(),
            handle.clone(),
            TokenBucket::new(
                Channel::Bulk,
                transfer_cfg.bulk_rate_bytes_per_sec,
                transfer_cfg.bulk_burst_bytes,
            ),
            transfer_cfg.effective_chunk_size(),
            transfer_cfg.stale_after(),
            pump_rx,
        );

        self.inner.expected.store(false, Ordering::Release);
        *self.inner.active.lock() = Some(ActiveLink {
            handle: handle.clone(),
            pump_shutdown,
        });
        ctx.dispatcher().attach(Some(handle));
        ctx.set_state(ConnectionState::Connected);
        self.inner.mode.send_replace(SessionMode::Joined { host: peer.clone() });
        ctx.coalescer().start();

        tokio::spawn(async move {
            if let Err(e) = pump.run().await {
                tracing::warn!(error = %e, "chunk pump failed");
            }
        });
        connection.start(Arc::new(ClientFrames {
            lifecycle: Arc::downgrade(&self.inner),
            generation,
            dispatcher: ctx.dispatcher().clone(),
            transfers: ctx.transfers().clone(),
        }));

        tracing::info!(%peer, "connected");
        Ok(policy)
    }

    /// Leave the host on purpose. No fallback session is started.
    pub async fn disconnect(&self) {
        self.inner.expected.store(true, Ordering::Release);
        let Some(link) = self.inner.active.lock().take() else {
            return;
        };
        let ctx = &self.inner.ctx;

        // Anything still pending in the coalescer goes out before the close.
        ctx.coalescer().flush();
        ctx.set_state(ConnectionState::Disconnecting);
        let handle = link.handle.clone();
        handle.close();
        self.inner.release(link);

        if tokio::time::timeout(CLOSE_TIMEOUT, handle.closed()).await.is_err() {
            tracing::warn!(peer = %handle.peer(), "connection did not close cleanly");
        }
        ctx.set_state(ConnectionState::Disconnected);
        tracing::info!(peer = %handle.peer(), "disconnected");
    }
}

impl LifecycleInner {
    /// Stop everything tied to the link except the connection itself.
    fn release(&self, link: ActiveLink) {
        let _ = link.pump_shutdown.send(());
        self.ctx.coalescer().stop();
        self.ctx.dispatcher().attach(None);
        self.ctx.transfers().flush();
    }

    fn handle_closed(&self, generation: u64, reason: &CloseReason) {
        if generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        let Some(link) = self.active.lock().take() else {
            // Already released by `disconnect`.
            return;
        };
        self.ctx.set_state(ConnectionState::Disconnected);
        self.release(link);

        if self.expected.load(Ordering::Acquire) {
            tracing::info!(?reason, "connection closed");
            return;
        }

        tracing::warn!(?reason, "connection to host lost, falling back to standalone session");
        self.replica.teardown_replica();
        if let Err(e) = self.replica.start_standalone() {
            tracing::error!(error = %e, "failed to start standalone session");
        }
        self.mode.send_replace(SessionMode::Standalone);
    }
}

/// Routes a client connection's inbound frames.
struct ClientFrames {
    lifecycle: Weak<LifecycleInner>,
    generation: u64,
    dispatcher: Arc<CommandDispatcher>,
    transfers: Arc<AssetTransferManager>,
}

impl FrameHandler for ClientFrames {
    fn on_command(&self, payload: Bytes) {
        self.dispatcher.dispatch(&payload);
    }

    fn on_chunk(&self, chunk: AssetChunk) {
        // Failures are already reported through transfer listeners.
        let _ = self.transfers.update(chunk);
    }

    fn on_closed(&self, reason: &CloseReason) {
        if let Some(inner) = self.lifecycle.upgrade() {
            inner.handle_closed(self.generation, reason);
        }
    }
}

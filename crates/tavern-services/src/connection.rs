//! Connection: one framed, ordered, bidirectional stream per peer.
//!
//! After the handshake the stream is split and driven by two tasks:
//!
//!   reader: decodes frames in arrival order and hands commands and asset
//!            chunks to a `FrameHandler` on the reading task itself
//!   writer: drains the Command queue before every Bulk frame, so an asset
//!            chunk can delay a command by at most one chunk
//!
//! When either side ends, the other is stopped and `FrameHandler::on_closed`
//! fires exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};
use zerocopy::FromBytes;

use tavern_core::wire::{
    encode_frame, Channel, FrameHeader, FrameKind, WireError, FRAME_HEADER_SIZE,
    MAX_FRAME_PAYLOAD,
};
use tavern_core::{AssetChunk, Command, CommandError, HandshakeError};

use crate::activity::{ActivityEvent, ActivityMonitor, Direction};

/// How long a closing writer may spend flushing queued commands.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("command encoding failed: {0}")]
    Command(#[from] CommandError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,
}

// ── Frames ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel: Channel,
    pub payload: Bytes,
}

/// Read the next valid frame.
///
/// Frames with an unknown version or kind are skipped. Returns `Ok(None)` on
/// a clean end of stream at a frame boundary. An oversized length is fatal:
/// framing can no longer be trusted.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        match reader.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::read_from(&header_buf[..]).ok_or(WireError::Truncated {
            need: FRAME_HEADER_SIZE,
            have: header_buf.len(),
        })?;

        let len = header.payload_len();
        if len > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(len).into());
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        match header.validate() {
            Ok((kind, channel)) => {
                return Ok(Some(Frame {
                    kind,
                    channel,
                    payload: Bytes::from(payload),
                }))
            }
            Err(e) => {
                tracing::warn!(error = %e, len, "skipping unreadable frame");
            }
        }
    }
}

pub async fn write_frame<W>(
    writer: &mut W,
    kind: FrameKind,
    channel: Channel,
    payload: &[u8],
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(kind, channel, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one JSON handshake message.
pub async fn send_handshake<W, T>(writer: &mut W, message: &T) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)
        .map_err(|e| ConnectionError::Protocol(format!("handshake encode: {e}")))?;
    write_frame(writer, FrameKind::Handshake, Channel::Command, &body).await
}

/// Read one JSON handshake message. Anything other than a Handshake frame
/// at this point is a protocol violation.
pub async fn recv_handshake<R, T>(reader: &mut R) -> Result<T, ConnectionError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let frame = read_frame(reader).await?.ok_or(ConnectionError::Closed)?;
    if frame.kind != FrameKind::Handshake {
        return Err(ConnectionError::Protocol(format!(
            "expected handshake frame, got {:?}",
            frame.kind
        )));
    }
    serde_json::from_slice(&frame.payload)
        .map_err(|e| HandshakeError::Malformed(e.to_string()).into())
}

// ── Handler ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `ConnectionHandle::close` was called.
    Local,
    /// The peer ended the stream.
    RemoteClosed,
    /// The stream failed.
    Error(String),
}

/// Receives everything the reader decodes. Called on the reader task, in
/// stream order.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_command(&self, payload: Bytes);
    fn on_chunk(&self, chunk: AssetChunk);
    fn on_closed(&self, reason: &CloseReason);
}

// ── Handle ────────────────────────────────────────────────────────────────────

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct Shared {
    id: u64,
    peer: String,
    commands: mpsc::UnboundedSender<Outbound>,
    bulk: mpsc::Sender<AssetChunk>,
    close_requested: AtomicBool,
    closed: watch::Sender<bool>,
    stop_reader: Notify,
    writer_error: Mutex<Option<String>>,
}

/// Cheap, cloneable sending side of a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn is_open(&self) -> bool {
        !self.shared.close_requested.load(Ordering::Acquire)
            && !*self.shared.closed.borrow()
    }

    /// Queue a command on the Command channel.
    pub fn send_command(&self, command: &Command) -> Result<(), ConnectionError> {
        let body = command.encode()?;
        self.send_command_bytes(&body)
    }

    /// Queue an already-encoded command body.
    pub fn send_command_bytes(&self, body: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        let frame = encode_frame(FrameKind::Command, Channel::Command, body)?;
        self.shared
            .commands
            .send(Outbound::Frame(frame))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Queue an asset chunk on the Bulk channel. Waits while the previous
    /// chunk is still queued.
    pub async fn send_chunk(&self, chunk: AssetChunk) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        self.shared
            .bulk
            .send(chunk)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Flush queued commands, then close. Idempotent.
    pub fn close(&self) {
        if self.shared.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(conn = self.shared.id, peer = %self.shared.peer, "closing connection");
        let _ = self.shared.commands.send(Outbound::Close);
        self.shared.stop_reader.notify_one();
    }

    /// Resolves once both tasks have finished.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        // The sender lives in `shared`, so the channel cannot close under us.
        let _ = closed.wait_for(|done| *done).await;
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// A handshaken stream whose tasks have not started yet.
///
/// Splitting creation from `start` lets the owner publish the handle (and
/// mark itself connected) before the first inbound frame is delivered.
pub struct Connection<S> {
    stream: S,
    shared: Arc<Shared>,
    command_rx: mpsc::UnboundedReceiver<Outbound>,
    bulk_rx: mpsc::Receiver<AssetChunk>,
    activity: ActivityMonitor,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>, activity: ActivityMonitor) -> (ConnectionHandle, Self) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (bulk_tx, bulk_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            commands: command_tx,
            bulk: bulk_tx,
            close_requested: AtomicBool::new(false),
            closed: watch::channel(false).0,
            stop_reader: Notify::new(),
            writer_error: Mutex::new(None),
        });
        let handle = ConnectionHandle {
            shared: shared.clone(),
        };
        let connection = Self {
            stream,
            shared,
            command_rx,
            bulk_rx,
            activity,
        };
        (handle, connection)
    }

    /// Start the reader and writer tasks. Commands queued on the handle
    /// before this point are sent first.
    pub fn start(self, handler: Arc<dyn FrameHandler>) {
        let Self {
            stream,
            shared,
            command_rx,
            bulk_rx,
            activity,
        } = self;
        let (reader, writer) = tokio::io::split(stream);

        let writer_task = tokio::spawn(write_loop(
            writer,
            command_rx,
            bulk_rx,
            shared.clone(),
            activity.clone(),
        ));

        tokio::spawn(async move {
            let reason = read_loop(reader, &shared, handler.as_ref(), &activity).await;

            let _ = shared.commands.send(Outbound::Close);
            if tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await.is_err() {
                tracing::warn!(conn = shared.id, "writer did not drain in time");
            }

            let writer_error = shared.writer_error.lock().take();
            let reason = if shared.close_requested.load(Ordering::Acquire) {
                CloseReason::Local
            } else if let Some(err) = writer_error {
                CloseReason::Error(err)
            } else {
                reason
            };

            tracing::info!(conn = shared.id, peer = %shared.peer, ?reason, "connection closed");
            handler.on_closed(&reason);
            shared.closed.send_replace(true);
        });
    }

    /// `new` followed by `start`.
    pub fn spawn(
        stream: S,
        peer: impl Into<String>,
        handler: Arc<dyn FrameHandler>,
        activity: ActivityMonitor,
    ) -> ConnectionHandle {
        let (handle, connection) = Self::new(stream, peer, activity);
        connection.start(handler);
        handle
    }
}

async fn read_loop<R>(
    mut reader: R,
    shared: &Shared,
    handler: &dyn FrameHandler,
    activity: &ActivityMonitor,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shared.stop_reader.notified() => return CloseReason::Local,
            frame = read_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => return CloseReason::RemoteClosed,
            Err(e) => return CloseReason::Error(e.to_string()),
        };

        match frame.kind {
            FrameKind::Command => {
                let len = frame.payload.len() as u64;
                activity.emit(ActivityEvent::for_progress(Direction::Inbound, len, len, len));
                tracing::trace!(conn = shared.id, len, "command frame received");
                handler.on_command(frame.payload);
            }
            FrameKind::AssetChunk => match AssetChunk::decode(frame.payload) {
                Ok(chunk) => {
                    activity.emit(ActivityEvent::for_progress(
                        Direction::Inbound,
                        chunk.data.len() as u64,
                        chunk.cumulative,
                        chunk.total_size,
                    ));
                    handler.on_chunk(chunk);
                }
                Err(e) => {
                    tracing::warn!(conn = shared.id, error = %e, "dropping malformed asset chunk");
                }
            },
            FrameKind::Handshake => {
                tracing::warn!(conn = shared.id, "unexpected handshake frame after session start, dropped");
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    mut bulk: mpsc::Receiver<AssetChunk>,
    shared: Arc<Shared>,
    activity: ActivityMonitor,
) where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = write_frames(&mut writer, &mut commands, &mut bulk, &activity).await {
        tracing::debug!(conn = shared.id, error = %e, "writer failed");
        *shared.writer_error.lock() = Some(e.to_string());
        shared.stop_reader.notify_one();
    }
}

async fn write_frames<W>(
    writer: &mut W,
    commands: &mut mpsc::UnboundedReceiver<Outbound>,
    bulk: &mut mpsc::Receiver<AssetChunk>,
    activity: &ActivityMonitor,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            msg = commands.recv() => match msg {
                Some(Outbound::Frame(frame)) => {
                    writer.write_all(&frame).await?;
                    writer.flush().await?;
                    let len = (frame.len() - FRAME_HEADER_SIZE) as u64;
                    activity.emit(ActivityEvent::for_progress(Direction::Outbound, len, len, len));
                }
                Some(Outbound::Close) | None => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            },

            Some(chunk) = bulk.recv() => {
                let payload = chunk.encode();
                let frame = encode_frame(FrameKind::AssetChunk, Channel::Bulk, &payload)?;
                writer.write_all(&frame).await?;
                writer.flush().await?;
                activity.emit(ActivityEvent::for_progress(
                    Direction::Outbound,
                    chunk.data.len() as u64,
                    chunk.cumulative,
                    chunk.total_size,
                ));
            }
        }
    }
}

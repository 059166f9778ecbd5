//! Multiplexed connection with sub-connection streams
//!
//! One reader task decodes frames and dispatches them to control or stream
//! channels, one writer task serializes outgoing frames. Each stream is backed
//! by an in-memory duplex pipe so callers get a plain `AsyncRead + AsyncWrite`.
//!
//! Streams are flow controlled with per-stream send credit. A sender never has
//! more than [`INITIAL_STREAM_WINDOW`] unacknowledged bytes in flight and the
//! receiver hands credit back once data has been written to the stream's pipe,
//! so the reader task never waits on a stream. A stream whose user stops
//! reading only stalls itself. Control, open, reset and window frames are
//! written ahead of queued stream data.

use burrow_proto::{
    ControlMessage, Frame, FrameCodec, FrameType, StreamId, INITIAL_STREAM_WINDOW,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf,
    WriteHalf,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{TransportError, TransportResult};

/// In-memory buffer between a stream's user and the mux pumps
const STREAM_BUFFER_SIZE: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 16 * 1024;
const FRAME_QUEUE_SIZE: usize = 256;
const ACCEPT_QUEUE_SIZE: usize = 64;

/// Which end of the control connection this is. Determines stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Agent side, opens odd stream ids
    Client,
    /// Gateway side, opens even stream ids
    Server,
}

enum Inbound {
    Data(Bytes),
    Fin,
}

#[derive(Clone)]
struct StreamEntry {
    inbound: mpsc::UnboundedSender<Inbound>,
    /// Received bytes not yet written to the pipe
    buffered: Arc<AtomicUsize>,
    /// Credit for sending data to the peer
    send_window: Arc<Semaphore>,
    token: CancellationToken,
}

type StreamMap = Arc<Mutex<HashMap<StreamId, StreamEntry>>>;

fn lock(streams: &StreamMap) -> MutexGuard<'_, HashMap<StreamId, StreamEntry>> {
    streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outgoing frame queues; the writer drains `priority` before `data`
#[derive(Clone)]
struct FrameSender {
    priority: mpsc::Sender<Frame>,
    data: mpsc::Sender<Frame>,
}

/// Connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_streams: usize,
    pub uptime_secs: u64,
}

/// A stream opened by the remote side, with the path it asked for
pub struct IncomingStream {
    pub path: String,
    pub stream: MuxStream,
}

/// Multiplexed connection
pub struct MuxConnection {
    connection_id: String,
    remote: String,
    frames: FrameSender,
    streams: StreamMap,
    control_rx: tokio::sync::Mutex<mpsc::Receiver<ControlMessage>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<IncomingStream>>,
    next_stream_id: AtomicU32,
    cancel: CancellationToken,
    created_at: Instant,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("connection_id", &self.connection_id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MuxConnection {
    /// Start multiplexing over `io`. Spawns the reader and writer tasks.
    pub fn new<IO>(io: IO, role: Role, remote: impl Into<String>) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection_id = format!("mux-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let remote = remote.into();

        let (read_half, write_half) = tokio::io::split(io);
        let frames_in = FramedRead::new(read_half, FrameCodec);
        let frames_out = FramedWrite::new(write_half, FrameCodec);

        let (priority_tx, priority_rx) = mpsc::channel::<Frame>(FRAME_QUEUE_SIZE);
        let (data_tx, data_rx) = mpsc::channel::<Frame>(FRAME_QUEUE_SIZE);
        let frames = FrameSender {
            priority: priority_tx,
            data: data_tx,
        };
        let (control_tx, control_rx) = mpsc::channel::<ControlMessage>(FRAME_QUEUE_SIZE);
        let (accept_tx, accept_rx) = mpsc::channel::<IncomingStream>(ACCEPT_QUEUE_SIZE);
        let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let bytes_sent = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        tokio::spawn(writer_task(WriterContext {
            sink: frames_out,
            priority_rx,
            data_rx,
            bytes_sent: bytes_sent.clone(),
            cancel: cancel.clone(),
            connection_id: connection_id.clone(),
        }));

        tokio::spawn(reader_task(ReaderContext {
            frames: frames_in,
            frame_tx: frames.clone(),
            streams: streams.clone(),
            control_tx,
            accept_tx,
            bytes_received: bytes_received.clone(),
            cancel: cancel.clone(),
            connection_id: connection_id.clone(),
        }));

        debug!("[{}] Multiplexed connection to {} started", connection_id, remote);

        Self {
            connection_id,
            remote,
            frames,
            streams,
            control_rx: tokio::sync::Mutex::new(control_rx),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            cancel,
            created_at: Instant::now(),
            bytes_sent,
            bytes_received,
        }
    }

    /// Send a control message on stream 0
    pub async fn send_control(&self, message: &ControlMessage) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = Frame::control(message)?;
        trace!("[{}] -> {}", self.connection_id, message.kind());
        self.frames
            .priority
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next control message. `None` once the connection is closed.
    pub async fn recv_control(&self) -> Option<ControlMessage> {
        self.control_rx.lock().await.recv().await
    }

    /// Open a stream towards `path` on the remote side
    pub async fn open_stream(&self, path: &str) -> TransportResult<MuxStream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let stream = attach_stream(stream_id, &self.frames, &self.streams, &self.cancel);

        // Queued ahead of any data the caller writes
        self.frames
            .priority
            .send(Frame::open(stream_id, path))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        debug!(
            "[{}] Opened stream {} to {}",
            self.connection_id, stream_id, path
        );
        Ok(stream)
    }

    /// Accept the next stream opened by the remote side
    pub async fn accept_stream(&self) -> Option<IncomingStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Close the connection. Queued frames are flushed before the socket closes.
    pub fn close(&self, reason: &str) {
        if !self.cancel.is_cancelled() {
            debug!("[{}] Closing connection: {}", self.connection_id, reason);
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed, by either side
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Token cancelled when the connection closes
    pub fn close_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_streams: lock(&self.streams).len(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One sub-connection of a [`MuxConnection`]
pub struct MuxStream {
    stream_id: StreamId,
    inner: DuplexStream,
    reset_tx: mpsc::Sender<Frame>,
    token: CancellationToken,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl MuxStream {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Abort the stream, telling the remote side why
    pub async fn reset(self, reason: &str) {
        let _ = self
            .reset_tx
            .send(Frame::reset(self.stream_id, reason))
            .await;
        self.token.cancel();
    }

    /// Like [`MuxStream::reset`] but never waits for queue space
    fn abort(self, reason: &str) {
        if self
            .reset_tx
            .try_send(Frame::reset(self.stream_id, reason))
            .is_err()
        {
            trace!("Stream {} reset not queued", self.stream_id);
        }
        self.token.cancel();
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn attach_stream(
    stream_id: StreamId,
    frames: &FrameSender,
    streams: &StreamMap,
    parent: &CancellationToken,
) -> MuxStream {
    let (user_end, mux_end) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    let (mux_read, mux_write) = tokio::io::split(mux_end);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let send_window = Arc::new(Semaphore::new(INITIAL_STREAM_WINDOW as usize));
    let token = parent.child_token();

    lock(streams).insert(
        stream_id,
        StreamEntry {
            inbound: inbound_tx,
            buffered: buffered.clone(),
            send_window: send_window.clone(),
            token: token.clone(),
        },
    );

    let inbound = inbound_pump(
        stream_id,
        inbound_rx,
        mux_write,
        buffered,
        frames.clone(),
        token.clone(),
    );
    let outbound = outbound_pump(
        stream_id,
        mux_read,
        send_window,
        frames.clone(),
        token.clone(),
    );
    // The entry stays until both directions are done so that window
    // updates keep arriving for a half-closed stream
    let registered = streams.clone();
    tokio::spawn(async move {
        tokio::join!(inbound, outbound);
        lock(&registered).remove(&stream_id);
    });

    MuxStream {
        stream_id,
        inner: user_end,
        reset_tx: frames.priority.clone(),
        token,
    }
}

/// Remote -> local: write received payloads into the stream's pipe and
/// return the credit they used
async fn inbound_pump(
    stream_id: StreamId,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    mut pipe: WriteHalf<DuplexStream>,
    buffered: Arc<AtomicUsize>,
    frames: FrameSender,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => None,
            message = rx.recv() => message,
        };

        match next {
            Some(Inbound::Data(data)) => {
                let written = tokio::select! {
                    _ = token.cancelled() => break,
                    written = pipe.write_all(&data) => written,
                };
                if let Err(e) = written {
                    trace!("Stream {} local end gone: {}", stream_id, e);
                    let _ = frames
                        .priority
                        .send(Frame::reset(stream_id, "stream dropped"))
                        .await;
                    token.cancel();
                    break;
                }

                buffered.fetch_sub(data.len(), Ordering::AcqRel);
                let credit = Frame::window_update(stream_id, data.len() as u32);
                if frames.priority.send(credit).await.is_err() {
                    break;
                }
            }
            Some(Inbound::Fin) | None => {
                let _ = pipe.shutdown().await;
                break;
            }
        }
    }
}

/// Local -> remote: frame whatever the stream's user writes, within the
/// credit granted by the peer
async fn outbound_pump(
    stream_id: StreamId,
    mut pipe: ReadHalf<DuplexStream>,
    send_window: Arc<Semaphore>,
    frames: FrameSender,
    token: CancellationToken,
) {
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = pipe.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                // Same queue as the data so the peer sees it last
                let _ = frames.data.send(Frame::close(stream_id)).await;
                break;
            }
            Ok(n) => {
                let credit = tokio::select! {
                    _ = token.cancelled() => break,
                    credit = send_window.acquire_many(n as u32) => credit,
                };
                match credit {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                }

                let frame = Frame::data(stream_id, Bytes::copy_from_slice(&buffer[..n]));
                if frames.data.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = frames
                    .priority
                    .send(Frame::reset(stream_id, &e.to_string()))
                    .await;
                break;
            }
        }
    }
}

struct WriterContext<W> {
    sink: FramedWrite<W, FrameCodec>,
    priority_rx: mpsc::Receiver<Frame>,
    data_rx: mpsc::Receiver<Frame>,
    bytes_sent: Arc<AtomicU64>,
    cancel: CancellationToken,
    connection_id: String,
}

async fn writer_task<W>(mut ctx: WriterContext<W>)
where
    W: AsyncWrite + Unpin,
{
    let conn_id = ctx.connection_id.clone();

    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            frame = ctx.priority_rx.recv() => frame,
            frame = ctx.data_rx.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let len = (Frame::HEADER_SIZE + frame.payload.len()) as u64;
        if let Err(e) = ctx.sink.send(frame).await {
            error!("[{}] Send error: {}", conn_id, e);
            ctx.cancel.cancel();
            return;
        }
        ctx.bytes_sent.fetch_add(len, Ordering::Relaxed);
    }

    // Flush control frames queued before the close (e.g. a Disconnect message)
    while let Ok(frame) = ctx.priority_rx.try_recv() {
        if ctx.sink.feed(frame).await.is_err() {
            break;
        }
    }
    let _ = ctx.sink.close().await;
    ctx.cancel.cancel();
    debug!("[{}] Writer task ended", conn_id);
}

struct ReaderContext<R> {
    frames: FramedRead<R, FrameCodec>,
    frame_tx: FrameSender,
    streams: StreamMap,
    control_tx: mpsc::Sender<ControlMessage>,
    accept_tx: mpsc::Sender<IncomingStream>,
    bytes_received: Arc<AtomicU64>,
    cancel: CancellationToken,
    connection_id: String,
}

impl<R> ReaderContext<R> {
    fn stream(&self, stream_id: StreamId) -> Option<StreamEntry> {
        lock(&self.streams).get(&stream_id).cloned()
    }

    /// Reset a stream from the reader without waiting for queue space
    fn reset_stream(&self, stream_id: StreamId, entry: &StreamEntry, reason: &str) {
        entry.token.cancel();
        if self
            .frame_tx
            .priority
            .try_send(Frame::reset(stream_id, reason))
            .is_err()
        {
            trace!(
                "[{}] Reset for stream {} not queued",
                self.connection_id,
                stream_id
            );
        }
    }
}

async fn reader_task<R>(mut ctx: ReaderContext<R>)
where
    R: AsyncRead + Unpin,
{
    let conn_id = ctx.connection_id.clone();
    let window = INITIAL_STREAM_WINDOW as usize;

    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            next = ctx.frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                error!("[{}] Read error: {}", conn_id, e);
                break;
            }
            None => {
                debug!("[{}] Connection closed by peer", conn_id);
                break;
            }
        };

        ctx.bytes_received.fetch_add(
            (Frame::HEADER_SIZE + frame.payload.len()) as u64,
            Ordering::Relaxed,
        );
        trace!(
            "[{}] Received frame: stream={}, type={:?}, len={}",
            conn_id,
            frame.stream_id,
            frame.frame_type,
            frame.payload.len()
        );

        let stream_id = frame.stream_id;
        match frame.frame_type {
            FrameType::Control => match frame.control_message() {
                Ok(message) => {
                    if ctx.control_tx.send(message).await.is_err() {
                        debug!("[{}] Control receiver dropped", conn_id);
                    }
                }
                Err(e) => warn!("[{}] Dropping control frame: {}", conn_id, e),
            },
            FrameType::Open => {
                let path = match frame.payload_str() {
                    Ok(path) => path.to_string(),
                    Err(e) => {
                        warn!("[{}] {}", conn_id, e);
                        let _ = ctx
                            .frame_tx
                            .priority
                            .try_send(Frame::reset(stream_id, "invalid path"));
                        continue;
                    }
                };

                if ctx.stream(stream_id).is_some() {
                    warn!("[{}] Stream {} opened twice", conn_id, stream_id);
                    let _ = ctx
                        .frame_tx
                        .priority
                        .try_send(Frame::reset(stream_id, "duplicate stream id"));
                    continue;
                }

                let stream = attach_stream(stream_id, &ctx.frame_tx, &ctx.streams, &ctx.cancel);
                if let Err(e) = ctx.accept_tx.try_send(IncomingStream { path, stream }) {
                    let incoming = match e {
                        TrySendError::Full(incoming) | TrySendError::Closed(incoming) => incoming,
                    };
                    warn!(
                        "[{}] Not accepting streams, rejecting {}",
                        conn_id, incoming.path
                    );
                    incoming.stream.abort("not accepting streams");
                }
            }
            FrameType::Data => {
                let Some(entry) = ctx.stream(stream_id) else {
                    trace!("[{}] Data for unknown stream {}", conn_id, stream_id);
                    continue;
                };

                let len = frame.payload.len();
                let buffered = entry.buffered.fetch_add(len, Ordering::AcqRel) + len;
                if buffered > window {
                    warn!(
                        "[{}] Stream {} sent past its window, resetting",
                        conn_id, stream_id
                    );
                    ctx.reset_stream(stream_id, &entry, "flow control violation");
                    continue;
                }
                if entry.inbound.send(Inbound::Data(frame.payload)).is_err() {
                    trace!("[{}] Stream {} receiver dropped", conn_id, stream_id);
                }
            }
            FrameType::Close => {
                if let Some(entry) = ctx.stream(stream_id) {
                    let _ = entry.inbound.send(Inbound::Fin);
                }
            }
            FrameType::Reset => {
                if let Some(entry) = ctx.stream(stream_id) {
                    debug!(
                        "[{}] Stream {} reset by peer: {}",
                        conn_id,
                        stream_id,
                        frame.payload_str().unwrap_or("")
                    );
                    entry.token.cancel();
                }
            }
            FrameType::WindowUpdate => {
                let Some(entry) = ctx.stream(stream_id) else {
                    continue;
                };
                match frame.window_increment() {
                    // Credit in hand can never exceed the initial window
                    Ok(increment)
                        if entry.send_window.available_permits() + increment as usize
                            <= window =>
                    {
                        entry.send_window.add_permits(increment as usize);
                    }
                    Ok(increment) => {
                        warn!(
                            "[{}] Stream {} granted {} bytes past its window, resetting",
                            conn_id, stream_id, increment
                        );
                        ctx.reset_stream(stream_id, &entry, "flow control violation");
                    }
                    Err(e) => {
                        warn!("[{}] {}", conn_id, e);
                        ctx.reset_stream(stream_id, &entry, "malformed window update");
                    }
                }
            }
        }
    }

    debug!("[{}] Reader task ended", conn_id);
    ctx.cancel.cancel();
    // Dropping the senders ends every stream's inbound pump
    lock(&ctx.streams).clear();
}

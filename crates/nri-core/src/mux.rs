//! Frame multiplexer (C1).
//!
//! Multiplexes many logical, bidirectional byte streams over one trunk
//! connection (a unix socketpair, a wasm host pipe, ...) using a simple
//! length-prefixed frame: `u32 length | u32 conn_id | payload`. `length`
//! covers the payload only and excludes the 8-byte header.
//!
//! Two connection ids are reserved for the ttrpc request/response streams
//! that run independently of per-call multiplexing:
//! [`RUNTIME_SERVICE_CONN`] carries the calls a plugin makes back into the
//! orchestrator's `Runtime` service (`RegisterPlugin`, `UpdateContainers`),
//! [`PLUGIN_SERVICE_CONN`] carries the calls the orchestrator makes into
//! the plugin's `Plugin` service (`Configure`, `Synchronize`,
//! `CreateContainer`, ...). Every other id is opened on demand by
//! [`Mux::open`].

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, FatalReason, Result};

pub const RUNTIME_SERVICE_CONN: u32 = 0;
pub const PLUGIN_SERVICE_CONN: u32 = 1;

const HEADER_LEN: usize = 8;
const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;
const DEFAULT_QUEUE_DEPTH: usize = 256;

type Trunk = Box<dyn AsyncReadWrite + Send + Unpin>;

/// Anything a [`Mux`] can run frames over: a plain socket, a socketpair
/// half, or (for the wasm backend) an in-process duplex pipe.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + ?Sized> AsyncReadWrite for T {}

struct Frame {
    conn_id: u32,
    payload: Vec<u8>,
}

enum WriterMsg {
    Frame(Frame),
    Shutdown,
}

struct Inner {
    receivers: Mutex<HashMap<u32, mpsc::Receiver<Vec<u8>>>>,
    senders: Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>,
    writer_tx: mpsc::Sender<WriterMsg>,
    /// Fires once the trunk reader observes EOF, a framing error, or an
    /// oversize frame.
    closed_tx: Mutex<Option<oneshot::Sender<FatalReason>>>,
    closed_rx: Mutex<Option<oneshot::Receiver<FatalReason>>>,
    /// Held while the mux should not yet deliver frames to logical
    /// streams, per `Block`/`Unblock` (registration-to-dispatch handoff).
    blocked: Mutex<bool>,
}

/// A multiplexer over one trunk connection.
///
/// Spawns a single reader task that demultiplexes incoming frames into
/// per-channel queues, and a single writer task that serializes outgoing
/// frames so concurrent [`LogicalStream`] writers never interleave a
/// header with another stream's payload.
pub struct Mux {
    inner: Arc<Inner>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Mux {
    pub fn new(trunk: impl AsyncReadWrite + Send + Unpin + 'static) -> Self {
        Self::with_queue_depth(trunk, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(trunk: impl AsyncReadWrite + Send + Unpin + 'static, depth: usize) -> Self {
        let (mut read_half, mut write_half) = tokio::io::split(trunk);
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterMsg>(depth);
        let (closed_tx, closed_rx) = oneshot::channel();

        let inner = Arc::new(Inner {
            receivers: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            writer_tx: writer_tx.clone(),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx: Mutex::new(Some(closed_rx)),
            blocked: Mutex::new(false),
        });

        let reader_inner = inner.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        // Block() delays delivery, not reading: the trunk
                        // must keep draining so a blocked registration
                        // stream doesn't wedge the plugin's writer.
                        while *reader_inner.blocked.lock().await {
                            tokio::task::yield_now().await;
                        }
                        deliver(&reader_inner, frame, depth).await;
                    }
                    Ok(None) => {
                        close(&reader_inner, FatalReason::TransportClosed).await;
                        break;
                    }
                    Err(_) => {
                        close(&reader_inner, FatalReason::ProtocolError).await;
                        break;
                    }
                }
            }
        });

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                match msg {
                    WriterMsg::Frame(frame) => {
                        if write_frame(&mut write_half, &frame).await.is_err() {
                            break;
                        }
                    }
                    WriterMsg::Shutdown => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        Mux {
            inner,
            reader_task,
            writer_task,
        }
    }

    /// Opens (or re-opens) a logical stream for `conn_id`. Safe to call
    /// before any frames for that id have arrived: the receive queue is
    /// created lazily and frames that arrive first are queued.
    pub async fn open(&self, conn_id: u32) -> Result<LogicalStream> {
        let mut receivers = self.inner.receivers.lock().await;
        let mut senders = self.inner.senders.lock().await;
        if !senders.contains_key(&conn_id) {
            let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_DEPTH);
            senders.insert(conn_id, tx);
            receivers.insert(conn_id, rx);
        }
        Ok(LogicalStream {
            conn_id,
            writer_tx: self.inner.writer_tx.clone(),
            rx: receivers.remove(&conn_id),
            inner: self.inner.clone(),
            pending: Vec::new(),
        })
    }

    /// Suspends delivery of newly-read frames to logical streams until
    /// [`Mux::unblock`] is called. Used while a plugin's registration is
    /// being validated on the dedicated runtime-service stream, so that
    /// per-call multiplexed traffic it might send early doesn't race
    /// ahead of acceptance.
    pub async fn block(&self) {
        *self.inner.blocked.lock().await = true;
    }

    pub async fn unblock(&self) {
        *self.inner.blocked.lock().await = false;
    }

    /// Resolves once the trunk closes, with the reason it closed for.
    pub async fn monitor_handle(&self) -> FatalReason {
        let rx = self.inner.closed_rx.lock().await.take();
        match rx {
            Some(rx) => rx.await.unwrap_or(FatalReason::TransportClosed),
            // Already observed by an earlier caller; the mux is closed by
            // definition at that point.
            None => FatalReason::TransportClosed,
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.writer_tx.send(WriterMsg::Shutdown).await;
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn deliver(inner: &Arc<Inner>, frame: Frame, depth: usize) {
    let mut senders = inner.senders.lock().await;
    let tx = senders.entry(frame.conn_id).or_insert_with(|| {
        let (tx, rx) = mpsc::channel(depth);
        // The matching receiver is handed out lazily by a later `open()`;
        // stash it where `open` expects to find it.
        tokio::spawn(stash_receiver(inner.clone(), frame.conn_id, rx));
        tx
    });
    // Backpressure: a full queue means the consumer is slow or gone;
    // drop rather than block the single reader task indefinitely.
    if tx.try_send(frame.payload).is_err() {
        log::warn!("mux: channel {} receive queue full, dropping frame", frame.conn_id);
    }
}

async fn stash_receiver(inner: Arc<Inner>, conn_id: u32, rx: mpsc::Receiver<Vec<u8>>) {
    inner.receivers.lock().await.insert(conn_id, rx);
}

async fn close(inner: &Arc<Inner>, reason: FatalReason) {
    if let Some(tx) = inner.closed_tx.lock().await.take() {
        let _ = tx.send(reason);
    }
    // Dropping the senders makes every open (or not-yet-opened)
    // `LogicalStream`'s `poll_recv` resolve `None` instead of hanging, and
    // tearing down the writer task makes subsequent writes hit the
    // `TrySendError::Closed` branch in `poll_write` instead of silently
    // queuing into a channel nobody drains.
    inner.senders.lock().await.clear();
    let _ = inner.writer_tx.try_send(WriterMsg::Shutdown);
}

async fn read_frame(r: &mut (impl AsyncRead + Unpin)) -> io::Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let conn_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if length > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload {length} exceeds {MAX_FRAME_PAYLOAD} byte cap"),
        ));
    }
    let mut payload = vec![0u8; length];
    r.read_exact(&mut payload).await?;
    Ok(Some(Frame { conn_id, payload }))
}

async fn write_frame(w: &mut (impl AsyncWrite + Unpin), frame: &Frame) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    header[4..8].copy_from_slice(&frame.conn_id.to_be_bytes());
    w.write_all(&header).await?;
    w.write_all(&frame.payload).await?;
    w.flush().await
}

/// One logical, bidirectional byte stream multiplexed over a [`Mux`]'s
/// trunk connection. Implements [`AsyncRead`]/[`AsyncWrite`] so it can be
/// wrapped directly as a ttrpc transport socket.
pub struct LogicalStream {
    conn_id: u32,
    writer_tx: mpsc::Sender<WriterMsg>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
    inner: Arc<Inner>,
    pending: Vec<u8>,
}

impl LogicalStream {
    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    async fn ensure_receiver(&mut self) {
        if self.rx.is_none() {
            self.rx = self.inner.receivers.lock().await.remove(&self.conn_id);
        }
    }
}

impl AsyncRead for LogicalStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.pending.is_empty() {
            let take = self.pending.len().min(buf.remaining());
            let drained: Vec<u8> = self.pending.drain(..take).collect();
            buf.put_slice(&drained);
            return Poll::Ready(Ok(()));
        }
        let Some(rx) = self.rx.as_mut() else {
            // Receiver not yet stashed by the reader task; register for a
            // wake and retry. This happens only in the brief window
            // between `open()` racing `stash_receiver`.
            cx.waker().wake_by_ref();
            return Poll::Pending;
        };
        match rx.poll_recv(cx) {
            Poll::Ready(Some(payload)) => {
                let take = payload.len().min(buf.remaining());
                buf.put_slice(&payload[..take]);
                if take < payload.len() {
                    self.pending = payload[take..].to_vec();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())), // EOF
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for LogicalStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let frame = Frame {
            conn_id: self.conn_id,
            payload: buf.to_vec(),
        };
        match self.writer_tx.clone().try_send(WriterMsg::Frame(frame)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "mux trunk closed")))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// `ensure_receiver` is exercised through `open()`'s lazy path; keep the
// helper reachable for streams constructed ahead of the first frame.
impl LogicalStream {
    #[allow(dead_code)]
    async fn prime(&mut self) {
        self.ensure_receiver().await;
    }
}

pub fn err_from_fatal(reason: FatalReason) -> Error {
    Error::fatal(reason, reason.shutdown_reason())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_single_frame() {
        let (a, b) = duplex(4096);
        let mux_a = Mux::new(a);
        let mux_b = Mux::new(b);

        let mut stream_a = mux_a.open(RUNTIME_SERVICE_CONN).await.unwrap();
        let mut stream_b = mux_b.open(RUNTIME_SERVICE_CONN).await.unwrap();

        stream_a.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        stream_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn distinct_conn_ids_do_not_cross_talk() {
        let (a, b) = duplex(4096);
        let mux_a = Mux::new(a);
        let mux_b = Mux::new(b);

        let mut a_runtime = mux_a.open(RUNTIME_SERVICE_CONN).await.unwrap();
        let mut a_plugin = mux_a.open(PLUGIN_SERVICE_CONN).await.unwrap();
        let mut b_runtime = mux_b.open(RUNTIME_SERVICE_CONN).await.unwrap();
        let mut b_plugin = mux_b.open(PLUGIN_SERVICE_CONN).await.unwrap();

        a_runtime.write_all(b"r").await.unwrap();
        a_plugin.write_all(b"p").await.unwrap();

        let mut r_buf = [0u8; 1];
        let mut p_buf = [0u8; 1];
        b_runtime.read_exact(&mut r_buf).await.unwrap();
        b_plugin.read_exact(&mut p_buf).await.unwrap();
        assert_eq!(&r_buf, b"r");
        assert_eq!(&p_buf, b"p");
    }

    #[tokio::test]
    async fn monitor_handle_fires_on_trunk_close() {
        let (a, b) = duplex(4096);
        let mux_a = Mux::new(a);
        drop(b);
        let reason = mux_a.monitor_handle().await;
        assert_eq!(reason, FatalReason::TransportClosed);
    }
}

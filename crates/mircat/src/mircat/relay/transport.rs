use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    net::TcpStream,
    sync::{Mutex, mpsc, watch},
};
use tokio_yamux::StreamHandle;

use crate::mircat::config::RelayTuning;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// One multiplexed connection between client and server.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self);
    /// Resolves once the underlying connection is gone, whoever closed it.
    async fn closed(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
}

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Inbound streams waiting for `accept_stream`.
const ACCEPT_BACKLOG: usize = 64;
/// Buffer between a bridged yamux stream and the end handed to callers.
const BRIDGE_BUFFER: usize = 64 * 1024;
const BRIDGE_CHUNK: usize = 16 * 1024;

fn yamux_config(tuning: &RelayTuning) -> tokio_yamux::Config {
    // connection_write_timeout stays at the yamux default; it guards the socket, not liveness.
    tokio_yamux::Config {
        enable_keepalive: true,
        keepalive_interval: tuning.heartbeat_interval,
        max_stream_window_size: tuning.stream_window_bytes,
        ..tokio_yamux::Config::default()
    }
}

/// yamux over a single TCP connection.
///
/// The session future is driven by a dedicated task, which is the only writer on the socket.
/// Inbound streams are handed over through a bounded queue; the pump never waits on it.
/// Every stream is bridged (see [`bridge`]) before it leaves this type.
pub struct YamuxSession {
    control: tokio_yamux::Control,
    incoming: Mutex<mpsc::Receiver<StreamHandle>>,
    closed: watch::Receiver<bool>,
    remote: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    pub fn server(c: TcpStream, tuning: &RelayTuning) -> Self {
        let remote = c.peer_addr().ok();
        let _ = c.set_nodelay(true);
        let session = tokio_yamux::Session::new_server(c, yamux_config(tuning));
        Self::from_session(session, remote)
    }

    pub fn client(c: TcpStream, tuning: &RelayTuning) -> Self {
        let remote = c.peer_addr().ok();
        let _ = c.set_nodelay(true);
        let session = tokio_yamux::Session::new_client(c, yamux_config(tuning));
        Self::from_session(session, remote)
    }

    fn from_session(mut session: tokio_yamux::Session<TcpStream>, remote: Option<SocketAddr>) -> Self {
        let control = session.control();
        let (closed_tx, closed_rx) = watch::channel(false);

        let (tx, rx) = mpsc::channel::<StreamHandle>(ACCEPT_BACKLOG);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => match tx.try_send(st) {
                        Ok(()) => {}
                        // Dropping the handle resets the stream; the session keeps going.
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(remote = ?remote, "transport: accept backlog full; resetting inbound stream");
                        }
                        // Nobody accepts streams any more; keep driving the ones we opened.
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    },
                    Err(err) => {
                        tracing::debug!(err = %err, "transport: yamux session ended");
                        break;
                    }
                }
            }
            let _ = closed_tx.send(true);
        });

        Self {
            control,
            incoming: Mutex::new(rx),
            closed: closed_rx,
            remote,
            task,
        }
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if *self.closed.borrow() {
            anyhow::bail!("transport: session closed");
        }
        let mut ctrl = self.control.clone();
        let st = ctrl.open_stream().await?;
        Ok(bridge(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("transport: session closed"))?;
        Ok(bridge(st))
    }

    async fn close(&self) {
        let mut ctrl = self.control.clone();
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, ctrl.close()).await;
        self.task.abort();
    }

    async fn closed(&self) {
        let mut rx = self.closed.clone();
        // Err means the pump task is gone, which is also closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Move a yamux stream into its own task and hand callers a local pipe instead.
///
/// The yamux session queues only a few frames per stream and stops reading the socket once any
/// stream's queue is full. The bridge keeps pulling frames into the stream's own receive buffer
/// while the caller is slow. That buffer is bounded by the stream window, and window updates go out
/// only as the caller consumes, so a stalled caller pauses its sender and nothing else.
fn bridge(stream: StreamHandle) -> BoxedStream {
    let (local, remote) = tokio::io::duplex(BRIDGE_BUFFER);
    tokio::spawn(Bridge {
        stream,
        local: remote,
        inbound: Chunk::new(),
        outbound: Chunk::new(),
    });
    Box::new(local)
}

struct Chunk {
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
    eof: bool,
    done: bool,
}

impl Chunk {
    fn new() -> Self {
        Self {
            buf: vec![0u8; BRIDGE_CHUNK].into_boxed_slice(),
            pos: 0,
            len: 0,
            eof: false,
            done: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.len
    }
}

struct Bridge {
    stream: StreamHandle,
    local: DuplexStream,
    inbound: Chunk,
    outbound: Chunk,
}

impl Future for Bridge {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.get_mut().poll_io(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(()),
            Poll::Ready(Err(err)) => {
                tracing::trace!(err = %err, "transport: stream bridge ended");
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Bridge {
    fn poll_io(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let mut progressed = false;

            if !self.inbound.done {
                progressed |= poll_leg(&mut self.stream, &mut self.local, &mut self.inbound, cx)?;
                if !self.inbound.is_empty() {
                    // The caller is not keeping up; keep the session's queue for this stream empty.
                    drain_frames(&mut self.stream, cx)?;
                }
            }
            if !self.outbound.done {
                progressed |= poll_leg(&mut self.local, &mut self.stream, &mut self.outbound, cx)?;
            }

            if self.inbound.done && self.outbound.done {
                return Poll::Ready(Ok(()));
            }
            if !progressed {
                return Poll::Pending;
            }
        }
    }
}

/// One copy step from `rd` to `wr` through `chunk`. Returns whether anything moved.
fn poll_leg<R, W>(rd: &mut R, wr: &mut W, chunk: &mut Chunk, cx: &mut Context<'_>) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut progressed = false;

    if chunk.is_empty() && !chunk.eof {
        let mut rb = ReadBuf::new(&mut chunk.buf);
        if let Poll::Ready(res) = Pin::new(&mut *rd).poll_read(cx, &mut rb) {
            res?;
            let n = rb.filled().len();
            chunk.pos = 0;
            chunk.len = n;
            chunk.eof = n == 0;
            progressed = true;
        }
    }

    while !chunk.is_empty() {
        match Pin::new(&mut *wr).poll_write(cx, &chunk.buf[chunk.pos..chunk.len]) {
            Poll::Ready(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
            Poll::Ready(Ok(n)) => {
                chunk.pos += n;
                progressed = true;
            }
            Poll::Ready(Err(err)) => return Err(err),
            Poll::Pending => break,
        }
    }

    if chunk.eof && chunk.is_empty() {
        if let Poll::Ready(res) = Pin::new(&mut *wr).poll_shutdown(cx) {
            res?;
            chunk.done = true;
            progressed = true;
        }
    }
    Ok(progressed)
}

/// Move queued frames into the stream's receive buffer without consuming them.
fn drain_frames(stream: &mut StreamHandle, cx: &mut Context<'_>) -> io::Result<()> {
    let mut empty = [0u8; 0];
    let mut none = ReadBuf::new(&mut empty);
    match stream.poll_peek(cx, &mut none) {
        Poll::Ready(Err(err)) => Err(err),
        _ => Ok(()),
    }
}

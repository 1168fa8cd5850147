use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    time::timeout,
};

use crate::mircat::relay::{
    error::RelayError,
    manager::{ChannelManager, ManagerError},
    protocol::{self, DialReply, StreamHeader, StreamKind},
    registry::{CloseReason, Session, SessionRegistry},
    transport::BoxedStream,
};

/// Slack on top of the client's dial timeout while the server waits for the dial reply.
const DIAL_REPLY_MARGIN: Duration = Duration::from_secs(2);

pin_project! {
    /// Counts traffic on the peer side of a session and keeps it from going idle.
    ///
    /// Reads are ingress, writes are egress.
    pub struct Tracked<S> {
        #[pin]
        inner: S,
        session: Arc<Session>,
    }
}

impl<S> Tracked<S> {
    pub fn new(inner: S, session: Arc<Session>) -> Self {
        Self { inner, session }
    }
}

impl<S: AsyncRead> AsyncRead for Tracked<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let res = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.session.record_ingress(n as u64);
            }
        }
        res
    }
}

impl<S: AsyncWrite> AsyncWrite for Tracked<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let res = this.inner.poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = &res {
            if *n > 0 {
                this.session.record_egress(*n as u64);
            }
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

pub(crate) fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Copy bytes both ways until both directions are done, an error occurs, or the session is closed.
///
/// EOF on one side is forwarded as a half-close to the other.
pub async fn pipe<P, O>(peer_side: P, mut other: O, session: &Arc<Session>) -> CloseReason
where
    P: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let mut peer_side = Tracked::new(peer_side, session.clone());
    tokio::select! {
        res = tokio::io::copy_bidirectional(&mut peer_side, &mut other) => match res {
            Ok(_) => CloseReason::PeerClosed,
            Err(err) if is_benign(&err) => CloseReason::PeerClosed,
            Err(err) => CloseReason::Error(err.to_string()),
        },
        _ = session.cancelled() => session.close_reason().cloned().unwrap_or(CloseReason::Shutdown),
    }
}

/// Server side: relay one accepted public connection through the active channel.
pub async fn relay_public_conn(
    mut conn: TcpStream,
    peer: SocketAddr,
    manager: &ChannelManager,
    registry: &SessionRegistry,
    dial_timeout: Duration,
) {
    let opened = match manager.open_stream(StreamKind::Tcp, peer).await {
        Ok(o) => o,
        Err(ManagerError::NoChannel) => {
            tracing::debug!(peer = %peer, "tcp: no active channel; closing public connection");
            let _ = conn.shutdown().await;
            return;
        }
        Err(err) => {
            tracing::warn!(peer = %peer, err = %err, "tcp: open stream failed");
            let _ = conn.shutdown().await;
            return;
        }
    };

    let session = registry.create(StreamKind::Tcp, peer, opened.channel_id, opened.stream_id);
    let mut stream = opened.stream;

    let reply = tokio::select! {
        r = timeout(dial_timeout + DIAL_REPLY_MARGIN, protocol::read_dial_reply(&mut stream)) => r,
        _ = session.cancelled() => {
            let _ = conn.shutdown().await;
            return;
        }
    };
    let refused = match reply {
        Ok(Ok(DialReply::Ok)) => None,
        Ok(Ok(DialReply::Failed(reason))) => Some(CloseReason::DialFailed(reason)),
        Ok(Err(err)) => Some(CloseReason::Error(format!("dial reply: {err}"))),
        Err(_) => Some(CloseReason::Error("dial reply timed out".into())),
    };
    if let Some(reason) = refused {
        registry.close(session.id, reason);
        let _ = conn.shutdown().await;
        let _ = stream.shutdown().await;
        return;
    }

    let reason = pipe(conn, stream, &session).await;
    registry.close(session.id, reason);
}

/// Client side: dial the destination for one TCP relay stream and pipe.
pub async fn serve_tcp_stream(
    mut stream: BoxedStream,
    header: StreamHeader,
    channel_id: u64,
    destination: &str,
    registry: &SessionRegistry,
    dial_timeout: Duration,
) {
    let peer = header
        .peer
        .parse()
        .unwrap_or(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let session = registry.create(StreamKind::Tcp, peer, channel_id, header.stream_id);

    let dst = match timeout(dial_timeout, TcpStream::connect(destination)).await {
        Ok(Ok(c)) => c,
        Ok(Err(err)) => {
            refuse(&mut stream, registry, &session, RelayError::dial(destination, err)).await;
            return;
        }
        Err(_) => {
            refuse(
                &mut stream,
                registry,
                &session,
                RelayError::dial(destination, "timed out"),
            )
            .await;
            return;
        }
    };
    let _ = dst.set_nodelay(true);

    if let Err(err) = protocol::write_dial_reply(&mut stream, &DialReply::Ok).await {
        registry.close(session.id, CloseReason::Error(format!("dial reply: {err}")));
        return;
    }

    let reason = pipe(stream, dst, &session).await;
    registry.close(session.id, reason);
}

async fn refuse(stream: &mut BoxedStream, registry: &SessionRegistry, session: &Session, err: RelayError) {
    tracing::warn!(sid = session.id, stream = session.stream_id(), err = %err, "tcp: destination dial failed");
    let _ = protocol::write_dial_reply(stream, &DialReply::Failed(err.to_string())).await;
    let _ = stream.shutdown().await;
    registry.close(session.id, CloseReason::DialFailed(err.to_string()));
}

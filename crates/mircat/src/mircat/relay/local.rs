//! Local transfer: accept on the rule's source and dial its destination directly.
//!
//! No channel is involved. Each accepted connection becomes a registry session and every chunk
//! read from either side is published as a transfer data event. When the destination fails
//! while the client is still connected, it is redialed with backoff.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    sync::watch,
    task::JoinSet,
    time::timeout,
};

use crate::mircat::{
    config::RelayTuning,
    relay::{
        client::jitter,
        error::RelayError,
        protocol::StreamKind,
        registry::{CloseReason, Session, SessionRegistry},
        tcp::is_benign,
    },
    telemetry::{Connectivity, RelayEvent, SharedStatusBoard},
};

const COPY_CHUNK: usize = 16 * 1024;

pub struct LocalCtx {
    pub registry: Arc<SessionRegistry>,
    pub board: SharedStatusBoard,
    pub tuning: RelayTuning,
    /// `dstAddr:dstPort`.
    pub destination: String,
}

/// Accept on `ln` until `shutdown` flips, then close every session.
pub async fn run(ln: TcpListener, ctx: Arc<LocalCtx>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(
        src = ?ln.local_addr().ok(),
        destination = %ctx.destination,
        "local: listening"
    );
    ctx.board.update(|st| {
        st.connectivity = Connectivity::Listening;
        st.destination = Some(ctx.destination.clone());
    });

    let sweeper = tokio::spawn(ctx.registry.clone().run_sweeper(
        ctx.tuning.sweep_interval,
        ctx.tuning.udp_idle_timeout,
        ctx.tuning.tcp_idle_timeout,
        shutdown.clone(),
    ));

    let mut conns: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            res = ln.accept() => match res {
                Ok((conn, peer)) => {
                    let ctx = ctx.clone();
                    conns.spawn(async move { serve_conn(conn, peer, &ctx).await });
                }
                Err(err) => {
                    tracing::warn!(err = %err, "local: accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }

    drop(ln);
    let closed = ctx.registry.close_all(CloseReason::Shutdown);
    tracing::info!(sessions = closed, "local: stopping");
    while conns.join_next().await.is_some() {}
    let _ = sweeper.await;
}

async fn dial(destination: &str, tuning: &RelayTuning) -> Result<TcpStream, RelayError> {
    match timeout(tuning.dial_timeout, TcpStream::connect(destination)).await {
        Ok(Ok(c)) => {
            let _ = c.set_nodelay(true);
            Ok(c)
        }
        Ok(Err(err)) => Err(RelayError::dial(destination, err)),
        Err(_) => Err(RelayError::dial(destination, "timed out")),
    }
}

async fn serve_conn(src: TcpStream, peer: SocketAddr, ctx: &LocalCtx) {
    let _ = src.set_nodelay(true);
    let session = ctx.registry.create(StreamKind::Tcp, peer, 0, 0);

    let dst = match dial(&ctx.destination, &ctx.tuning).await {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(sid = session.id, peer = %peer, err = %err, "local: destination dial failed");
            ctx.registry.close(session.id, CloseReason::DialFailed(err.to_string()));
            return;
        }
    };

    let reason = relay(src, dst, &session, ctx).await;
    ctx.registry.close(session.id, reason);
}

#[derive(Debug, Clone, Copy)]
enum Leg {
    /// Client to destination.
    Src,
    /// Destination to client.
    Dst,
}

impl Leg {
    fn record(self, session: &Session, board: &SharedStatusBoard, bytes: usize) {
        let (session_id, peer) = (session.id, session.peer.to_string());
        match self {
            Leg::Src => {
                session.record_ingress(bytes as u64);
                board.publish(RelayEvent::TransferSrcData { session_id, peer, bytes });
            }
            Leg::Dst => {
                session.record_egress(bytes as u64);
                board.publish(RelayEvent::TransferDstData { session_id, peer, bytes });
            }
        }
    }
}

enum Ended {
    /// The reading side sent EOF; it was passed on as a half-close.
    Eof,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

enum Outcome {
    Done(CloseReason),
    Redial(io::Error),
}

/// Copy `rd` into `wr` chunk by chunk.
///
/// A chunk stays in `pending` until it is fully written, so a leg dropped mid-write (or whose
/// writer failed) hands it on to the next destination connection.
async fn forward<R, W>(
    rd: &mut R,
    wr: &mut W,
    pending: &mut Vec<u8>,
    leg: Leg,
    session: &Session,
    board: &SharedStatusBoard,
) -> Ended
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        if pending.is_empty() {
            match rd.read(&mut buf).await {
                Ok(0) => {
                    let _ = wr.shutdown().await;
                    return Ended::Eof;
                }
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(err) => return Ended::ReadFailed(err),
            }
        }
        if let Err(err) = wr.write_all(pending).await {
            return Ended::WriteFailed(err);
        }
        leg.record(session, board, pending.len());
        pending.clear();
    }
}

fn finished(err: io::Error) -> CloseReason {
    if is_benign(&err) {
        CloseReason::PeerClosed
    } else {
        CloseReason::Error(err.to_string())
    }
}

fn cancelled(session: &Session) -> CloseReason {
    session.close_reason().cloned().unwrap_or(CloseReason::Shutdown)
}

/// Wait for the remaining leg once the other side has half-closed.
async fn finish(rest: impl Future<Output = Ended>, session: &Session) -> Outcome {
    tokio::select! {
        ended = rest => Outcome::Done(match ended {
            Ended::Eof => CloseReason::PeerClosed,
            Ended::ReadFailed(err) | Ended::WriteFailed(err) => finished(err),
        }),
        _ = session.cancelled() => Outcome::Done(cancelled(session)),
    }
}

async fn relay(src: TcpStream, mut dst: TcpStream, session: &Arc<Session>, ctx: &LocalCtx) -> CloseReason {
    let (mut src_rd, mut src_wr) = src.into_split();
    let (mut to_dst, mut to_src) = (Vec::new(), Vec::new());
    loop {
        let (mut dst_rd, mut dst_wr) = dst.into_split();
        let outcome = {
            let up = forward(&mut src_rd, &mut dst_wr, &mut to_dst, Leg::Src, session, &ctx.board);
            let down = forward(&mut dst_rd, &mut src_wr, &mut to_src, Leg::Dst, session, &ctx.board);
            tokio::pin!(up, down);
            tokio::select! {
                ended = &mut up => match ended {
                    Ended::Eof => finish(down, session).await,
                    Ended::ReadFailed(err) => Outcome::Done(finished(err)),
                    Ended::WriteFailed(err) => Outcome::Redial(err),
                },
                ended = &mut down => match ended {
                    Ended::Eof => finish(up, session).await,
                    Ended::ReadFailed(err) => Outcome::Redial(err),
                    Ended::WriteFailed(err) => Outcome::Done(finished(err)),
                },
                _ = session.cancelled() => Outcome::Done(cancelled(session)),
            }
        };

        match outcome {
            Outcome::Done(reason) => {
                let _ = src_wr.shutdown().await;
                return reason;
            }
            Outcome::Redial(err) => {
                tracing::info!(sid = session.id, err = %err, "local: destination failed; redialing");
                dst = match redial(&mut src_rd, session, ctx).await {
                    Ok(c) => c,
                    Err(reason) => return reason,
                };
            }
        }
    }
}

/// Dial the destination again, backing off between attempts, for as long as the client is
/// connected.
async fn redial(src_rd: &mut OwnedReadHalf, session: &Session, ctx: &LocalCtx) -> Result<TcpStream, CloseReason> {
    let tuning = &ctx.tuning;
    let mut backoff = tuning.backoff_initial;
    let mut attempt: u32 = 0;
    // Once the client has sent more data, peeking would resolve at once; stop watching.
    let mut watch_src = true;
    let mut peeked = [0u8; 1];
    loop {
        tokio::select! {
            _ = tokio::time::sleep(jitter(backoff)) => {}
            _ = session.cancelled() => return Err(cancelled(session)),
            res = src_rd.peek(&mut peeked), if watch_src => match res {
                Ok(0) => return Err(CloseReason::PeerClosed),
                Ok(_) => {
                    watch_src = false;
                    continue;
                }
                Err(err) => return Err(finished(err)),
            },
        }

        attempt += 1;
        match dial(&ctx.destination, tuning).await {
            Ok(c) => {
                tracing::info!(sid = session.id, attempt, "local: destination redialed");
                return Ok(c);
            }
            Err(err) => {
                tracing::warn!(sid = session.id, attempt, err = %err, "local: redial failed");
                if tuning.max_retries > 0 && attempt >= tuning.max_retries {
                    return Err(CloseReason::DialFailed(err.to_string()));
                }
            }
        }
        backoff = (backoff * 2).min(tuning.backoff_max);
    }
}

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::UdpSocket,
    sync::{mpsc, watch},
    time::timeout,
};

use crate::mircat::{
    relay::{
        datagram::{DatagramReader, DatagramWriter},
        error::RelayError,
        manager::{ActiveChannel, ChannelManager},
        protocol::{self, DialReply, MAX_DATAGRAM_BYTES, ProtocolError, StreamHeader, StreamKind},
        registry::{CloseReason, Session, SessionRegistry},
        transport::BoxedStream,
    },
    telemetry::metric,
};

/// Datagrams buffered per flow before new ones are dropped.
const FLOW_QUEUE: usize = 128;
const DIAL_REPLY_MARGIN: Duration = Duration::from_secs(2);

fn count_drops(reason: &'static str, n: u64) {
    metrics::counter!(metric::UDP_DATAGRAMS_DROPPED_TOTAL, "reason" => reason).increment(n);
}

/// Empty a flow's queue after the flow failed. Returns how many datagrams were thrown away.
fn discard_queued(rx: &mut mpsc::Receiver<Bytes>) -> u64 {
    rx.close();
    let mut n = 0;
    while rx.try_recv().is_ok() {
        n += 1;
    }
    n
}

/// Server side: accept datagrams on the public UDP socket and hand each to its source's flow.
///
/// Flows are sessions in the registry: the first datagram from an unseen source registers one
/// and spawns its task, later datagrams find it by source address.
pub async fn run_udp_listener(
    sock: Arc<UdpSocket>,
    manager: Arc<ChannelManager>,
    registry: Arc<SessionRegistry>,
    dial_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // One spare byte detects datagrams above the relay limit.
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES as usize + 1];

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = sock.recv_from(&mut buf) => {
                let (n, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        // ICMP port unreachable surfaces here on some platforms; keep serving.
                        tracing::debug!(err = %err, "udp: recv_from failed");
                        continue;
                    }
                };
                if n > MAX_DATAGRAM_BYTES as usize {
                    count_drops("oversized", 1);
                    continue;
                }
                let payload = Bytes::copy_from_slice(&buf[..n]);

                let payload = match registry.lookup_by_source(StreamKind::Udp, peer) {
                    Some(flow) => match flow.offer(payload) {
                        Ok(()) => continue,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            count_drops("queue_full", 1);
                            continue;
                        }
                        // The flow is winding down; start a fresh one.
                        Err(mpsc::error::TrySendError::Closed(p)) => {
                            registry.close(flow.id, CloseReason::PeerClosed);
                            p
                        }
                    },
                    None => payload,
                };
                start_flow(peer, payload, &sock, &manager, &registry, dial_timeout).await;
            }
        }
    }
    // Flows end through the registry (`close_all` on shutdown).
}

async fn start_flow(
    peer: SocketAddr,
    first: Bytes,
    sock: &Arc<UdpSocket>,
    manager: &Arc<ChannelManager>,
    registry: &Arc<SessionRegistry>,
    dial_timeout: Duration,
) {
    let Some(ch) = manager.current().await else {
        tracing::debug!(peer = %peer, "udp: no active channel; dropping datagram");
        count_drops("no_channel", 1);
        return;
    };

    let (tx, rx) = mpsc::channel(FLOW_QUEUE);
    // Fresh queue with capacity; cannot fail.
    let _ = tx.try_send(first);
    let session = registry.create_flow(peer, ch.id, tx);

    let sock = sock.clone();
    let manager = manager.clone();
    let registry = registry.clone();
    tokio::spawn(async move {
        run_server_flow(session, rx, ch, sock, &manager, &registry, dial_timeout).await;
    });
}

async fn run_server_flow(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<Bytes>,
    ch: Arc<ActiveChannel>,
    sock: Arc<UdpSocket>,
    manager: &ChannelManager,
    registry: &SessionRegistry,
    dial_timeout: Duration,
) {
    let peer = session.peer;
    let opened = tokio::select! {
        r = manager.open_stream_on(&ch, StreamKind::Udp, peer) => r,
        _ = session.cancelled() => {
            count_drops("flow_closed", discard_queued(&mut rx));
            return;
        }
    };
    let mut stream = match opened {
        Ok(o) => {
            session.bind_stream(o.stream_id);
            o.stream
        }
        Err(err) => {
            tracing::warn!(peer = %peer, err = %err, "udp: open stream failed");
            registry.close(session.id, CloseReason::Error(err.to_string()));
            count_drops("open_failed", discard_queued(&mut rx));
            return;
        }
    };

    let reply = tokio::select! {
        r = timeout(dial_timeout + DIAL_REPLY_MARGIN, protocol::read_dial_reply(&mut stream)) => r,
        _ = session.cancelled() => {
            count_drops("flow_closed", discard_queued(&mut rx));
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
        count_drops("dial_failed", discard_queued(&mut rx));
        return;
    }

    let (rd, wr) = tokio::io::split(stream);
    let mut reader = DatagramReader::new(rd);
    let mut writer = DatagramWriter::new(wr);

    let upstream = async {
        while let Some(p) = rx.recv().await {
            session.record_ingress(p.len() as u64);
            writer.write_datagram(&p).await?;
        }
        let _ = writer.shutdown().await;
        Ok::<_, ProtocolError>(CloseReason::Shutdown)
    };

    let downstream = async {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES as usize];
        while let Some(n) = reader.read_datagram(&mut buf).await? {
            sock.send_to(&buf[..n], peer).await?;
            session.record_egress(n as u64);
        }
        Ok::<_, ProtocolError>(CloseReason::PeerClosed)
    };

    let reason = tokio::select! {
        r = upstream => flow_reason(r),
        r = downstream => flow_reason(r),
        _ = session.cancelled() => session.close_reason().cloned().unwrap_or(CloseReason::Shutdown),
    };
    registry.close(session.id, reason);
}

fn flow_reason(r: Result<CloseReason, ProtocolError>) -> CloseReason {
    match r {
        Ok(reason) => reason,
        Err(ProtocolError::Io(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => CloseReason::PeerClosed,
        Err(err) => CloseReason::Error(err.to_string()),
    }
}

async fn bind_connected(destination: &str) -> std::io::Result<UdpSocket> {
    let target = tokio::net::lookup_host(destination)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))?;
    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let sock = UdpSocket::bind(local).await?;
    sock.connect(target).await?;
    Ok(sock)
}

/// Client side: forward one UDP relay stream to the destination through a connected socket.
pub async fn serve_udp_stream(
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
    let session = registry.create(StreamKind::Udp, peer, channel_id, header.stream_id);

    let sock = match timeout(dial_timeout, bind_connected(destination)).await {
        Ok(Ok(s)) => s,
        Ok(Err(err)) => {
            refuse(&mut stream, registry, &session, RelayError::dial(destination, err)).await;
            return;
        }
        Err(_) => {
            refuse(&mut stream, registry, &session, RelayError::dial(destination, "timed out")).await;
            return;
        }
    };

    if let Err(err) = protocol::write_dial_reply(&mut stream, &DialReply::Ok).await {
        registry.close(session.id, CloseReason::Error(format!("dial reply: {err}")));
        return;
    }

    let (rd, wr) = tokio::io::split(stream);
    let mut reader = DatagramReader::new(rd);
    let mut writer = DatagramWriter::new(wr);

    let to_destination = async {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES as usize];
        while let Some(n) = reader.read_datagram(&mut buf).await? {
            session.record_ingress(n as u64);
            // Destination not listening yet (ICMP unreachable) is UDP loss, not a session failure.
            if let Err(err) = sock.send(&buf[..n]).await {
                tracing::debug!(sid = session.id, err = %err, "udp: send to destination failed");
            }
        }
        Ok::<_, ProtocolError>(CloseReason::PeerClosed)
    };

    let from_destination = async {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES as usize];
        let res: Result<CloseReason, ProtocolError> = loop {
            let n = match sock.recv(&mut buf).await {
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                Err(err) => break Err(ProtocolError::Io(err)),
            };
            if let Err(err) = writer.write_datagram(&buf[..n]).await {
                break Err(err);
            }
            session.record_egress(n as u64);
        };
        res
    };

    let reason = tokio::select! {
        r = to_destination => flow_reason(r),
        r = from_destination => flow_reason(r),
        _ = session.cancelled() => session.close_reason().cloned().unwrap_or(CloseReason::Shutdown),
    };
    registry.close(session.id, reason);
}

async fn refuse(stream: &mut BoxedStream, registry: &SessionRegistry, session: &Session, err: RelayError) {
    tracing::warn!(sid = session.id, stream = session.stream_id(), err = %err, "udp: destination setup failed");
    let _ = protocol::write_dial_reply(stream, &DialReply::Failed(err.to_string())).await;
    let _ = stream.shutdown().await;
    registry.close(session.id, CloseReason::DialFailed(err.to_string()));
}

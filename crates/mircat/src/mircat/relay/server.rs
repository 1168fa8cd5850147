use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::watch,
    task::JoinSet,
};

use crate::mircat::{
    config::{RelayTuning, ServerConfig, TransferConfig},
    net,
    relay::{
        channel::{self, ChannelEnd, Sniffed},
        error::RelayError,
        manager::ChannelManager,
        protocol::Farewell,
        registry::{CloseReason, SessionRegistry},
        tcp, udp,
        transport::TransportSession,
    },
    telemetry::{Connectivity, RelayEvent, SharedStatusBoard, metric},
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sockets of the server role, bound before anything is spawned so bind errors reach the caller.
pub struct BoundServer {
    listeners: Listeners,
    udp: Option<UdpSocket>,
    pub control_addr: SocketAddr,
    pub public_addr: SocketAddr,
    pub udp_addr: Option<SocketAddr>,
}

enum Listeners {
    /// Control and public traffic share one port; connections are sniffed.
    Shared(TcpListener),
    Split { control: TcpListener, public: TcpListener },
}

async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::Bind { addr, source })
}

impl BoundServer {
    pub async fn bind(server: &ServerConfig, transfer: &TransferConfig) -> Result<Self, RelayError> {
        let control = server.tcp_bind()?;
        let public = transfer.src_bind()?;
        let udp_bind = server.udp_bind()?;

        let listeners = if net::endpoints_overlap(control, public) {
            // Bind the broader of the two so neither side loses reachability.
            let addr = if public.ip().is_unspecified() { public } else { control };
            Listeners::Shared(bind_tcp(addr).await?)
        } else {
            Listeners::Split {
                control: bind_tcp(control).await?,
                public: bind_tcp(public).await?,
            }
        };

        let udp = match udp_bind {
            Some(addr) => Some(
                UdpSocket::bind(addr)
                    .await
                    .map_err(|source| RelayError::Bind { addr, source })?,
            ),
            None => None,
        };

        let (control_addr, public_addr) = match &listeners {
            Listeners::Shared(ln) => {
                let a = ln.local_addr()?;
                (a, a)
            }
            Listeners::Split { control, public } => (control.local_addr()?, public.local_addr()?),
        };
        let udp_addr = match &udp {
            Some(s) => Some(s.local_addr()?),
            None => None,
        };

        Ok(Self {
            listeners,
            udp,
            control_addr,
            public_addr,
            udp_addr,
        })
    }

    pub fn shared_port(&self) -> bool {
        matches!(self.listeners, Listeners::Shared(_))
    }
}

/// Shared state of a running server role.
pub struct ServerCtx {
    pub manager: Arc<ChannelManager>,
    pub registry: Arc<SessionRegistry>,
    pub board: SharedStatusBoard,
    pub tuning: RelayTuning,
    pub expected_destination: String,
}

async fn wait_shutdown(mut rx: watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Serve until `shutdown` flips, then tear everything down within a drain deadline.
pub async fn run(bound: BoundServer, ctx: Arc<ServerCtx>, mut shutdown: watch::Receiver<bool>) {
    let shared = bound.shared_port();
    tracing::info!(
        control = %bound.control_addr,
        public_tcp = %bound.public_addr,
        public_udp = ?bound.udp_addr,
        shared_port = shared,
        policy = %ctx.manager.policy(),
        "server: listening"
    );
    ctx.board.set_connectivity(Connectivity::Listening);
    ctx.board.publish(RelayEvent::Listening {
        control: bound.control_addr,
        public_tcp: bound.public_addr,
        public_udp: bound.udp_addr,
        shared_port: shared,
    });

    let mut background = JoinSet::new();
    background.spawn(ctx.registry.clone().run_sweeper(
        ctx.tuning.sweep_interval,
        ctx.tuning.udp_idle_timeout,
        ctx.tuning.tcp_idle_timeout,
        shutdown.clone(),
    ));
    if let Some(sock) = bound.udp {
        background.spawn(udp::run_udp_listener(
            Arc::new(sock),
            ctx.manager.clone(),
            ctx.registry.clone(),
            ctx.tuning.dial_timeout,
            shutdown.clone(),
        ));
    }

    let mut conns: JoinSet<()> = JoinSet::new();
    match bound.listeners {
        Listeners::Shared(ln) => loop {
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
                        let stop = shutdown.clone();
                        conns.spawn(async move {
                            match channel::sniff(&conn, ctx.tuning.sniff_timeout).await {
                                Sniffed::Channel => handle_channel(conn, peer, &ctx, stop).await,
                                Sniffed::Public => {
                                    let _ = conn.set_nodelay(true);
                                    tcp::relay_public_conn(conn, peer, &ctx.manager, &ctx.registry, ctx.tuning.dial_timeout).await
                                }
                            }
                        });
                    }
                    Err(err) => accept_failed(err).await,
                },
            }
        },
        Listeners::Split { control, public } => loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                res = control.accept() => match res {
                    Ok((conn, peer)) => {
                        let ctx = ctx.clone();
                        let stop = shutdown.clone();
                        conns.spawn(async move { handle_channel(conn, peer, &ctx, stop).await });
                    }
                    Err(err) => accept_failed(err).await,
                },
                res = public.accept() => match res {
                    Ok((conn, peer)) => {
                        let _ = conn.set_nodelay(true);
                        let ctx = ctx.clone();
                        conns.spawn(async move {
                            tcp::relay_public_conn(conn, peer, &ctx.manager, &ctx.registry, ctx.tuning.dial_timeout).await
                        });
                    }
                    Err(err) => accept_failed(err).await,
                },
            }
        },
    }

    // Listeners are dropped here; nothing new comes in.
    if let Some(ch) = ctx.manager.take().await {
        ch.kick(Farewell::GoAway("server stopping".into()));
    }
    let closed = ctx.registry.close_all(CloseReason::Shutdown);
    tracing::info!(sessions = closed, "server: stopping");

    drain(&mut conns, &mut background).await;
}

async fn accept_failed(err: std::io::Error) {
    // Usually EMFILE; back off instead of spinning.
    tracing::warn!(err = %err, "server: accept failed");
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn drain(conns: &mut JoinSet<()>, background: &mut JoinSet<()>) {
    let all = async {
        while conns.join_next().await.is_some() {}
        while background.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, all).await.is_err() {
        tracing::warn!(
            pending = conns.len() + background.len(),
            "server: drain timed out; aborting remaining tasks"
        );
        conns.abort_all();
        background.abort_all();
    }
}

async fn handle_channel(conn: TcpStream, peer: SocketAddr, ctx: &ServerCtx, shutdown: watch::Receiver<bool>) {
    let pending = match channel::accept_handshake(conn, &ctx.tuning).await {
        Ok(p) => p,
        Err(err) => {
            tracing::debug!(peer = %peer, err = %err, "server: handshake failed");
            return;
        }
    };

    let id = ctx.manager.next_channel_id();
    let destination = pending.hello.destination.clone();
    let session: Arc<dyn TransportSession> = pending.session.clone();

    let (ch, displaced) = match ctx.manager.install(id, session, destination.clone()).await {
        Ok(v) => v,
        Err(err) => {
            let reason = err.to_string();
            tracing::info!(peer = %peer, reason = %reason, "server: channel rejected");
            ctx.board.publish(RelayEvent::ChannelRejected {
                peer: peer.to_string(),
                reason: reason.clone(),
            });
            pending.reject(&reason).await;
            return;
        }
    };
    if let Some(old) = displaced {
        tracing::info!(cid = old.id, new_cid = id, "server: replacing active channel");
        old.kick(Farewell::Replaced("replaced by a newer client".into()));
    }

    let (yamux, control) = match pending.accept(id, &ctx.tuning).await {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(cid = id, peer = %peer, err = %err, "server: hello reply failed");
            ctx.manager.remove(id).await;
            ch.session.close().await;
            return;
        }
    };

    if !ctx.expected_destination.is_empty() && destination != ctx.expected_destination {
        tracing::warn!(
            cid = id,
            advertised = %destination,
            configured = %ctx.expected_destination,
            "server: client forwards to a different destination"
        );
    }

    metrics::counter!(metric::CHANNELS_TOTAL).increment(1);
    tracing::info!(cid = id, peer = %peer, destination = %destination, "server: channel up");
    ctx.board.update(|st| {
        st.connectivity = Connectivity::Connected;
        st.channel_id = Some(id);
        st.channel_peer = Some(peer.to_string());
        st.destination = Some(destination.clone());
    });
    ctx.board.publish(RelayEvent::ChannelUp {
        channel_id: id,
        peer: peer.to_string(),
        destination,
    });

    let stop = async {
        tokio::select! {
            farewell = ch.kicked() => farewell,
            _ = wait_shutdown(shutdown.clone()) => Farewell::GoAway("server stopping".into()),
        }
    };
    let end = channel::drive_control(control, None, ctx.tuning.heartbeat_timeout, stop).await;

    yamux.close().await;
    let still_current = ctx.manager.remove(id).await;
    let cascaded = ctx.registry.close_channel(id, CloseReason::ChannelLost);

    let reason = match &end {
        ChannelEnd::Lost(reason) => {
            let err = RelayError::ChannelLost {
                channel_id: id,
                reason: reason.clone(),
            };
            tracing::warn!(cid = id, peer = %peer, sessions = cascaded, err = %err, "server: channel down");
            ctx.board.update(|st| st.last_error = Some(err.to_string()));
            reason.clone()
        }
        ChannelEnd::PeerGoAway(reason) | ChannelEnd::Replaced(reason) => {
            tracing::info!(cid = id, peer = %peer, sessions = cascaded, reason = %reason, "server: client went away");
            format!("client went away: {reason}")
        }
        ChannelEnd::Stopped(reason) => {
            tracing::info!(cid = id, peer = %peer, sessions = cascaded, reason = %reason, "server: channel closed");
            reason.clone()
        }
    };

    ctx.board.publish(RelayEvent::ChannelDown {
        channel_id: id,
        reason,
    });
    if still_current {
        let stopping = *shutdown.borrow();
        ctx.board.update(|st| {
            st.connectivity = if stopping {
                Connectivity::Stopped
            } else {
                Connectivity::Listening
            };
            st.channel_id = None;
            st.channel_peer = None;
            st.destination = None;
        });
    }
}

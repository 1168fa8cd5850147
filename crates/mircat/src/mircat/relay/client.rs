use std::{sync::Arc, time::Duration};

use rand::{RngExt, rng};
use tokio::{
    sync::watch,
    time::{Instant, timeout},
};

use crate::mircat::{
    config::RelayTuning,
    relay::{
        channel::{self, ChannelEnd, ClientChannel},
        error::RelayError,
        protocol::{self, Farewell, StreamKind},
        registry::{CloseReason, SessionRegistry},
        tcp,
        transport::{BoxedStream, TransportSession},
        udp,
    },
    telemetry::{Connectivity, RelayEvent, SharedStatusBoard, metric},
};

/// Shared state of a running client role.
pub struct ClientCtx {
    pub registry: Arc<SessionRegistry>,
    pub board: SharedStatusBoard,
    pub tuning: RelayTuning,
    /// `ServerIp:ServerPort`.
    pub server: String,
    /// `dstAddr:dstPort`.
    pub destination: String,
}

async fn wait_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// ±10% so a fleet of clients does not reconnect in lockstep.
pub(crate) fn jitter(d: Duration) -> Duration {
    d.mul_f64(rng().random_range(0.9..=1.1))
}

/// Keep a channel to the server up until `shutdown` flips.
///
/// Returns an error when a retry limit is configured and exhausted, or when the server hands
/// the channel slot to another client.
pub async fn run(ctx: Arc<ClientCtx>, shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
    let sweeper = tokio::spawn(ctx.registry.clone().run_sweeper(
        ctx.tuning.sweep_interval,
        ctx.tuning.udp_idle_timeout,
        ctx.tuning.tcp_idle_timeout,
        shutdown.clone(),
    ));

    let res = reconnect_loop(&ctx, shutdown).await;

    sweeper.abort();
    ctx.registry.close_all(CloseReason::Shutdown);
    res
}

async fn reconnect_loop(ctx: &Arc<ClientCtx>, shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
    let tuning = &ctx.tuning;
    let mut backoff = tuning.backoff_initial;
    let mut attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        ctx.board.update(|st| {
            st.connectivity = Connectivity::Connecting;
            st.reconnect_attempts = attempts;
        });

        let connected = tokio::select! {
            r = channel::connect(&ctx.server, &ctx.destination, tuning) => r,
            _ = wait_shutdown(shutdown.clone()) => return Ok(()),
        };

        let delay = match connected {
            Ok(ch) => {
                attempts = 0;
                let channel_id = ch.id;
                let up_since = Instant::now();
                let end = serve_channel(ch, ctx, shutdown.clone()).await;
                // Only a channel that held for a while earns a fresh backoff.
                if up_since.elapsed() >= tuning.heartbeat_timeout {
                    backoff = tuning.backoff_initial;
                }
                match end {
                    ChannelEnd::Stopped(_) => return Ok(()),
                    ChannelEnd::Replaced(_) => return Err(RelayError::Replaced { channel_id }),
                    ChannelEnd::Lost(_) | ChannelEnd::PeerGoAway(_) => {
                        let delay = jitter(backoff);
                        backoff = (backoff * 2).min(tuning.backoff_max);
                        delay
                    }
                }
            }
            Err(err) => {
                attempts += 1;
                let delay = jitter(backoff);
                tracing::warn!(
                    server = %ctx.server,
                    err = %err,
                    attempt = attempts,
                    backoff = %humantime::format_duration(delay),
                    "client: connect failed; retrying"
                );
                let msg = err.to_string();
                ctx.board.update(|st| {
                    st.connectivity = Connectivity::Failing;
                    st.reconnect_attempts = attempts;
                    st.last_error = Some(msg.clone());
                });
                ctx.board.publish(RelayEvent::ConnectFailed {
                    attempt: attempts,
                    error: msg.clone(),
                    retry_in_ms: delay.as_millis() as u64,
                });

                if tuning.max_retries > 0 && attempts >= tuning.max_retries {
                    tracing::error!(server = %ctx.server, attempts, err = %err, "client: retries exhausted");
                    ctx.board.publish(RelayEvent::RetriesExhausted {
                        attempts,
                        error: msg,
                    });
                    return Err(err);
                }

                backoff = (backoff * 2).min(tuning.backoff_max);
                delay
            }
        };

        tokio::select! {
            _ = wait_shutdown(shutdown.clone()) => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn serve_channel(ch: ClientChannel, ctx: &Arc<ClientCtx>, shutdown: watch::Receiver<bool>) -> ChannelEnd {
    let ClientChannel {
        id,
        session,
        control,
        heartbeat_interval,
        heartbeat_timeout,
    } = ch;

    metrics::counter!(metric::CHANNELS_TOTAL).increment(1);
    tracing::info!(cid = id, server = %ctx.server, destination = %ctx.destination, "client: channel up");
    ctx.board.update(|st| {
        st.connectivity = Connectivity::Connected;
        st.channel_id = Some(id);
        st.channel_peer = Some(ctx.server.clone());
        st.destination = Some(ctx.destination.clone());
        st.reconnect_attempts = 0;
    });
    ctx.board.publish(RelayEvent::ChannelUp {
        channel_id: id,
        peer: ctx.server.clone(),
        destination: ctx.destination.clone(),
    });

    let acceptor = {
        let session = session.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Ok(st) = session.accept_stream().await {
                let ctx = ctx.clone();
                tokio::spawn(async move { handle_stream(st, id, &ctx).await });
            }
        })
    };

    let stop = async {
        wait_shutdown(shutdown.clone()).await;
        Farewell::GoAway("client stopping".into())
    };
    let end = channel::drive_control(control, Some(heartbeat_interval), heartbeat_timeout, stop).await;

    acceptor.abort();
    session.close().await;

    let (session_reason, reason) = match &end {
        ChannelEnd::Lost(reason) => {
            let err = RelayError::ChannelLost {
                channel_id: id,
                reason: reason.clone(),
            };
            tracing::warn!(cid = id, server = %ctx.server, err = %err, "client: channel down; reconnecting");
            ctx.board.update(|st| st.last_error = Some(err.to_string()));
            (CloseReason::ChannelLost, reason.clone())
        }
        ChannelEnd::PeerGoAway(reason) => {
            tracing::info!(cid = id, server = %ctx.server, reason = %reason, "client: server went away; reconnecting");
            (CloseReason::ChannelLost, format!("server went away: {reason}"))
        }
        ChannelEnd::Replaced(reason) => {
            let err = RelayError::Replaced { channel_id: id };
            tracing::error!(cid = id, server = %ctx.server, reason = %reason, "client: channel taken over by another client; giving up");
            ctx.board.update(|st| st.last_error = Some(err.to_string()));
            (CloseReason::ChannelLost, reason.clone())
        }
        ChannelEnd::Stopped(reason) => {
            tracing::info!(cid = id, server = %ctx.server, "client: channel closed");
            (CloseReason::Shutdown, reason.clone())
        }
    };
    let cascaded = ctx.registry.close_channel(id, session_reason);
    tracing::debug!(cid = id, sessions = cascaded, "client: sessions closed");

    ctx.board.update(|st| {
        st.connectivity = match end {
            ChannelEnd::Stopped(_) => Connectivity::Stopped,
            ChannelEnd::Replaced(_) => Connectivity::Failing,
            _ => Connectivity::Disconnected,
        };
        st.channel_id = None;
        st.channel_peer = None;
    });
    ctx.board.publish(RelayEvent::ChannelDown {
        channel_id: id,
        reason,
    });
    end
}

async fn handle_stream(mut st: BoxedStream, channel_id: u64, ctx: &ClientCtx) {
    let header = match timeout(ctx.tuning.connect_timeout, protocol::read_stream_header(&mut st)).await {
        Ok(Ok(h)) => h,
        Ok(Err(err)) => {
            tracing::warn!(cid = channel_id, err = %err, "client: bad stream header");
            return;
        }
        Err(_) => {
            tracing::warn!(cid = channel_id, "client: stream header timed out");
            return;
        }
    };

    match header.kind {
        StreamKind::Tcp => {
            tcp::serve_tcp_stream(st, header, channel_id, &ctx.destination, &ctx.registry, ctx.tuning.dial_timeout)
                .await
        }
        StreamKind::Udp => {
            udp::serve_udp_stream(st, header, channel_id, &ctx.destination, &ctx.registry, ctx.tuning.dial_timeout)
                .await
        }
    }
}

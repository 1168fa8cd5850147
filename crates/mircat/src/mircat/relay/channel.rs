use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Instant, timeout},
};

use crate::mircat::{
    config::RelayTuning,
    relay::{
        error::RelayError,
        protocol::{self, ControlFrame, Farewell, Hello, HelloReply, ProtocolError},
        transport::{BoxedStream, TransportSession, YamuxSession},
    },
};

const GOAWAY_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const SNIFF_POLL: Duration = Duration::from_millis(5);

/// A handshaken channel as seen from the client.
pub struct ClientChannel {
    pub id: u64,
    pub session: Arc<YamuxSession>,
    pub control: BoxedStream,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// Dial the server, start the multiplexer and run the hello exchange.
///
/// Every step is bounded by the connect timeout. A rejection by the server is a
/// [`RelayError::Connect`] carrying the server's reason.
pub async fn connect(
    server: &str,
    destination: &str,
    tuning: &RelayTuning,
) -> Result<ClientChannel, RelayError> {
    let mut conn = timeout(tuning.connect_timeout, TcpStream::connect(server))
        .await
        .map_err(|_| RelayError::connect(server, "timed out"))?
        .map_err(|err| RelayError::connect(server, err))?;

    protocol::write_preamble(&mut conn)
        .await
        .map_err(|err| RelayError::connect(server, err))?;

    let session = Arc::new(YamuxSession::client(conn, tuning));
    match client_handshake(&session, destination, tuning).await {
        Ok((reply, control)) => {
            let heartbeat_interval = match reply.heartbeat_interval_ms {
                0 => tuning.heartbeat_interval,
                ms => Duration::from_millis(ms),
            };
            let heartbeat_timeout = match reply.heartbeat_timeout_ms {
                0 => tuning.heartbeat_timeout,
                ms => Duration::from_millis(ms),
            };
            Ok(ClientChannel {
                id: reply.channel_id,
                session,
                control,
                heartbeat_interval,
                heartbeat_timeout,
            })
        }
        Err(reason) => {
            session.close().await;
            Err(RelayError::connect(server, reason))
        }
    }
}

async fn client_handshake(
    session: &YamuxSession,
    destination: &str,
    tuning: &RelayTuning,
) -> Result<(HelloReply, BoxedStream), String> {
    let exchange = async {
        let mut control = session
            .open_stream()
            .await
            .map_err(|err| format!("open control stream: {err:#}"))?;
        protocol::write_hello(
            &mut control,
            &Hello {
                destination: destination.to_string(),
                client_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )
        .await
        .map_err(|err| format!("send hello: {err}"))?;
        let reply = protocol::read_hello_reply(&mut control)
            .await
            .map_err(|err| format!("read hello reply: {err}"))?;
        Ok::<_, String>((reply, control))
    };

    let (reply, control) = timeout(tuning.connect_timeout, exchange)
        .await
        .map_err(|_| "handshake timed out".to_string())??;
    if !reply.accepted {
        return Err(format!("rejected by server: {}", reply.reason));
    }
    Ok((reply, control))
}

/// A connection that sent a valid hello but has not been answered yet.
pub struct PendingChannel {
    pub session: Arc<YamuxSession>,
    pub control: BoxedStream,
    pub hello: Hello,
}

impl PendingChannel {
    pub async fn accept(
        mut self,
        channel_id: u64,
        tuning: &RelayTuning,
    ) -> Result<(Arc<YamuxSession>, BoxedStream), ProtocolError> {
        let reply = HelloReply {
            accepted: true,
            channel_id,
            heartbeat_interval_ms: tuning.heartbeat_interval.as_millis() as u64,
            heartbeat_timeout_ms: tuning.heartbeat_timeout.as_millis() as u64,
            reason: String::new(),
        };
        protocol::write_hello_reply(&mut self.control, &reply).await?;
        Ok((self.session, self.control))
    }

    pub async fn reject(mut self, reason: &str) {
        let _ = timeout(
            GOAWAY_WRITE_TIMEOUT,
            protocol::write_hello_reply(&mut self.control, &HelloReply::rejected(reason)),
        )
        .await;
        // Let the client read the reply and hang up first.
        let _ = timeout(GOAWAY_WRITE_TIMEOUT, self.session.closed()).await;
        self.session.close().await;
    }
}

/// Server half of the handshake: preamble, multiplexer, then the hello on the first stream.
pub async fn accept_handshake(
    mut conn: TcpStream,
    tuning: &RelayTuning,
) -> Result<PendingChannel, RelayError> {
    let window = tuning.connect_timeout;
    timeout(window, protocol::read_preamble(&mut conn))
        .await
        .map_err(|_| ProtocolError::Io(std::io::ErrorKind::TimedOut.into()))??;

    let session = Arc::new(YamuxSession::server(conn, tuning));
    let exchange = async {
        let mut control = session
            .accept_stream()
            .await
            .map_err(|err| ProtocolError::Io(std::io::Error::other(format!("{err:#}"))))?;
        let hello = protocol::read_hello(&mut control).await?;
        Ok::<_, ProtocolError>((control, hello))
    };

    match timeout(window, exchange).await {
        Ok(Ok((control, hello))) => Ok(PendingChannel {
            session,
            control,
            hello,
        }),
        Ok(Err(err)) => {
            session.close().await;
            Err(err.into())
        }
        Err(_) => {
            session.close().await;
            Err(ProtocolError::Io(std::io::ErrorKind::TimedOut.into()).into())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEnd {
    /// The peer announced it is going away.
    PeerGoAway(String),
    /// We were asked to stop and sent a go-away.
    Stopped(String),
    /// Heartbeat timeout or a broken control stream.
    Lost(String),
    /// The server handed our slot to another client.
    Replaced(String),
}

/// Run the control stream until the channel ends.
///
/// With `ping_every` set this side sends pings; either way it answers pings and treats any frame
/// as proof of life. Silence for `dead_after` loses the channel. When `stop` resolves, its
/// farewell is sent before the channel is given up.
pub async fn drive_control(
    control: BoxedStream,
    ping_every: Option<Duration>,
    dead_after: Duration,
    stop: impl Future<Output = Farewell>,
) -> ChannelEnd {
    let (mut rd, mut wr) = tokio::io::split(control);

    // Frame reads are not cancel-safe; keep them out of the select.
    let (tx, mut rx) = mpsc::channel::<Result<ControlFrame, ProtocolError>>(16);
    let reader = tokio::spawn(async move {
        loop {
            let frame = protocol::read_control_frame(&mut rd).await;
            let end = frame.is_err();
            if tx.send(frame).await.is_err() || end {
                break;
            }
        }
    });

    let pinging = ping_every.is_some();
    let mut tick = tokio::time::interval(ping_every.unwrap_or(dead_after));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    let mut seq: u64 = 0;

    tokio::pin!(stop);

    let end = loop {
        tokio::select! {
            farewell = &mut stop => {
                let sent = timeout(
                    GOAWAY_WRITE_TIMEOUT,
                    protocol::write_control_frame(&mut wr, &farewell.frame()),
                )
                .await;
                if matches!(sent, Ok(Ok(()))) {
                    // Wait for the peer to hang up so the go-away is not cut off by our close.
                    let _ = timeout(GOAWAY_WRITE_TIMEOUT, async {
                        while let Some(Ok(_)) = rx.recv().await {}
                    })
                    .await;
                }
                break ChannelEnd::Stopped(farewell.reason().to_string());
            }
            _ = tick.tick(), if pinging => {
                seq += 1;
                if let Err(err) = protocol::write_control_frame(&mut wr, &ControlFrame::Ping(seq)).await {
                    break ChannelEnd::Lost(format!("send ping: {err}"));
                }
            }
            _ = tokio::time::sleep_until(last_seen + dead_after) => {
                break ChannelEnd::Lost(format!(
                    "no heartbeat for {}",
                    humantime::format_duration(dead_after)
                ));
            }
            frame = rx.recv() => match frame {
                Some(Ok(ControlFrame::Ping(n))) => {
                    last_seen = Instant::now();
                    if let Err(err) = protocol::write_control_frame(&mut wr, &ControlFrame::Pong(n)).await {
                        break ChannelEnd::Lost(format!("send pong: {err}"));
                    }
                }
                Some(Ok(ControlFrame::Pong(_))) => {
                    last_seen = Instant::now();
                }
                Some(Ok(ControlFrame::GoAway(reason))) => break ChannelEnd::PeerGoAway(reason),
                Some(Ok(ControlFrame::Replaced(reason))) => break ChannelEnd::Replaced(reason),
                Some(Err(err)) => break ChannelEnd::Lost(format!("control stream: {err}")),
                None => break ChannelEnd::Lost("control stream closed".into()),
            }
        }
    };

    reader.abort();
    end
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Channel,
    Public,
}

/// Classify a connection on a shared port by peeking at its first bytes.
///
/// Nothing is consumed. Silence for the whole window, EOF or a read error count as public traffic.
pub async fn sniff(conn: &TcpStream, window: Duration) -> Sniffed {
    let deadline = Instant::now() + window;
    let mut buf = [0u8; protocol::PREAMBLE_LEN];
    loop {
        match tokio::time::timeout_at(deadline, conn.peek(&mut buf)).await {
            Err(_) | Ok(Err(_)) | Ok(Ok(0)) => return Sniffed::Public,
            Ok(Ok(n)) => match protocol::classify_preamble(&buf[..n]) {
                Some(true) => return Sniffed::Channel,
                Some(false) => return Sniffed::Public,
                None => {
                    if Instant::now() + SNIFF_POLL >= deadline {
                        return Sniffed::Public;
                    }
                    tokio::time::sleep(SNIFF_POLL).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;

    async fn pair() -> (TcpStream, TcpStream) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (c, s) = tokio::join!(TcpStream::connect(addr), ln.accept());
        (c.unwrap(), s.unwrap().0)
    }

    #[tokio::test]
    async fn sniff_detects_channel_preamble() {
        let (mut c, s) = pair().await;
        protocol::write_preamble(&mut c).await.unwrap();
        assert_eq!(sniff(&s, Duration::from_millis(500)).await, Sniffed::Channel);
    }

    #[tokio::test]
    async fn sniff_classifies_public_traffic_and_silence() {
        let (mut c, s) = pair().await;
        c.write_all(b"GET /\n").await.unwrap();
        assert_eq!(sniff(&s, Duration::from_millis(500)).await, Sniffed::Public);

        let (_c, s) = pair().await;
        let started = Instant::now();
        assert_eq!(sniff(&s, Duration::from_millis(100)).await, Sniffed::Public);
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn sniff_does_not_consume() {
        let (mut c, mut s) = pair().await;
        c.write_all(b"hello").await.unwrap();
        assert_eq!(sniff(&s, Duration::from_millis(500)).await, Sniffed::Public);

        let mut buf = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut s, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn handshake_then_go_away() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let tuning = RelayTuning::default();

        let t2 = tuning.clone();
        let server = tokio::spawn(async move {
            let (conn, _) = ln.accept().await.unwrap();
            let pending = accept_handshake(conn, &t2).await.unwrap();
            assert_eq!(pending.hello.destination, "127.0.0.1:8080");
            let (session, control) = pending.accept(7, &t2).await.unwrap();
            let end = drive_control(control, None, t2.heartbeat_timeout, std::future::pending()).await;
            drop(session);
            end
        });

        let ch = connect(&addr.to_string(), "127.0.0.1:8080", &tuning)
            .await
            .unwrap();
        assert_eq!(ch.id, 7);
        assert_eq!(ch.heartbeat_timeout, tuning.heartbeat_timeout);

        let end = drive_control(
            ch.control,
            Some(Duration::from_millis(20)),
            ch.heartbeat_timeout,
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Farewell::GoAway("client stopping".into())
            },
        )
        .await;
        assert_eq!(end, ChannelEnd::Stopped("client stopping".into()));

        let server_end = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server_end, ChannelEnd::PeerGoAway("client stopping".into()));
    }

    #[tokio::test]
    async fn replaced_farewell_ends_the_peer_as_replaced() {
        let (a, b) = tokio::io::duplex(1024);
        let server = tokio::spawn(drive_control(
            Box::new(a),
            None,
            Duration::from_secs(5),
            async { Farewell::Replaced("replaced by a newer client".into()) },
        ));
        let end = drive_control(
            Box::new(b),
            Some(Duration::from_millis(50)),
            Duration::from_secs(5),
            std::future::pending(),
        )
        .await;
        assert_eq!(end, ChannelEnd::Replaced("replaced by a newer client".into()));

        let server_end = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server_end, ChannelEnd::Stopped("replaced by a newer client".into()));
    }

    #[tokio::test]
    async fn silent_peer_is_lost_after_timeout() {
        let (a, _b) = tokio::io::duplex(1024);
        let started = std::time::Instant::now();
        let end = drive_control(
            Box::new(a),
            None,
            Duration::from_millis(100),
            std::future::pending(),
        )
        .await;
        assert!(matches!(end, ChannelEnd::Lost(ref r) if r.starts_with("no heartbeat")));
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn server_rejection_is_a_connect_error() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let tuning = RelayTuning::default();

        let t2 = tuning.clone();
        tokio::spawn(async move {
            let (conn, _) = ln.accept().await.unwrap();
            let pending = accept_handshake(conn, &t2).await.unwrap();
            pending.reject("channel 1 is already active").await;
        });

        match connect(&addr.to_string(), "127.0.0.1:8080", &tuning).await {
            Err(RelayError::Connect { reason, .. }) => {
                assert!(reason.contains("already active"), "reason: {reason}")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn refused_server_is_a_connect_error() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);

        let err = connect(&addr.to_string(), "127.0.0.1:8080", &RelayTuning::default())
            .await
            .err()
            .expect("connect fails");
        assert!(matches!(err, RelayError::Connect { .. }));
    }
}

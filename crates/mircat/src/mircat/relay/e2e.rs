use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::timeout,
};

use super::{Exit, Relay, RelayError, protocol::StreamKind};
use crate::mircat::{
    config::{ChannelPolicy, ClientConfig, ConfigError, RelayConfig, RelayTuning, ServerConfig, TransferConfig},
    telemetry::{Connectivity, RelayEvent, RelayRole, Status},
};

const WAIT: Duration = Duration::from_secs(5);
const RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\ncontent-length: 2\r\n\r\nok";

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn fast_tuning() -> RelayTuning {
    RelayTuning {
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(2),
        dial_timeout: Duration::from_secs(1),
        backoff_initial: Duration::from_millis(100),
        backoff_max: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(100),
        ..RelayTuning::default()
    }
}

fn relay_config(tcp_port: u16, src_port: u16, udp_port: Option<u16>, dst_port: u16) -> RelayConfig {
    RelayConfig {
        server: Some(ServerConfig {
            tcp_addr: "127.0.0.1".into(),
            tcp_port,
            udp_addr: if udp_port.is_some() { "127.0.0.1".into() } else { String::new() },
            udp_port: udp_port.unwrap_or(0),
        }),
        transfer: TransferConfig {
            src_addr: "127.0.0.1".into(),
            src_port,
            dst_addr: "127.0.0.1".into(),
            dst_port,
        },
        client: Some(ClientConfig {
            server_ip: "127.0.0.1".into(),
            server_port: tcp_port,
        }),
        tuning: fast_tuning(),
    }
}

async fn wait_until(relay: &Relay, what: &str, f: impl Fn(&Status) -> bool) {
    let polled = timeout(WAIT, async {
        while !f(&relay.status()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if polled.is_err() {
        panic!("timed out waiting for {what}: {:?}", relay.status());
    }
}

async fn connected(relay: &Relay) {
    wait_until(relay, "connected", |st| st.connectivity == Connectivity::Connected).await;
}

async fn expect_event(
    rx: &mut broadcast::Receiver<RelayEvent>,
    what: &str,
    f: impl Fn(&RelayEvent) -> bool,
) -> RelayEvent {
    let got = timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(ev) if f(&ev) => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(err) => panic!("event feed closed: {err}"),
            }
        }
    })
    .await;
    match got {
        Ok(ev) => ev,
        Err(_) => panic!("no {what} event"),
    }
}

/// Accepts one connection, reads the 6-byte request, answers and closes.
async fn http_destination() -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (mut c, _) = ln.accept().await.unwrap();
        let mut req = vec![0u8; 6];
        c.read_exact(&mut req).await.unwrap();
        c.write_all(RESPONSE).await.unwrap();
        c.shutdown().await.unwrap();
        req
    });
    (addr, task)
}

async fn tcp_echo() -> SocketAddr {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut c, _)) = ln.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = c.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Holds the first connection open without ever reading it; echoes every later one.
async fn stalling_destination() -> (SocketAddr, oneshot::Receiver<()>) {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    let (held_tx, held_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (_held, _) = ln.accept().await.unwrap();
        let _ = held_tx.send(());
        while let Ok((mut c, _)) = ln.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = c.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    (addr, held_rx)
}

async fn udp_echo() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, from)) = sock.recv_from(&mut buf).await {
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            let _ = sock.send_to(&reply, from).await;
        }
    });
    addr
}

async fn round_trip(addr: SocketAddr, msg: &[u8]) -> Vec<u8> {
    let mut c = timeout(WAIT, TcpStream::connect(addr)).await.unwrap().unwrap();
    c.write_all(msg).await.unwrap();
    let mut back = vec![0u8; msg.len()];
    timeout(WAIT, c.read_exact(&mut back)).await.unwrap().unwrap();
    back
}

async fn udp_ask(sock: &UdpSocket, to: SocketAddr, msg: &[u8]) -> Vec<u8> {
    sock.send_to(msg, to).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(WAIT, sock.recv_from(&mut buf)).await.unwrap().unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn shared_port_forwards_http_request_byte_exact() {
    let (dst, dst_task) = http_destination().await;
    let port = free_port();
    let cfg = relay_config(port, port, None, dst.port());

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    assert!(addrs.shared_port);
    assert_eq!(addrs.control, addrs.public_tcp);

    let client = Relay::new();
    client.start_client(cfg).await.unwrap();
    connected(&client).await;
    connected(&server).await;

    let mut public = TcpStream::connect(addrs.public_tcp).await.unwrap();
    public.write_all(b"GET /\n").await.unwrap();
    let mut resp = Vec::new();
    timeout(WAIT, public.read_to_end(&mut resp)).await.unwrap().unwrap();

    assert_eq!(resp, RESPONSE);
    assert_eq!(dst_task.await.unwrap(), b"GET /\n");

    client.stop().await;
    server.stop().await;
    assert_eq!(server.status().connectivity, Connectivity::Stopped);
    // The listening socket is released.
    TcpListener::bind(("127.0.0.1", port)).await.unwrap();
}

#[tokio::test]
async fn udp_replies_return_to_each_source() {
    let dst = udp_echo().await;
    let cfg = relay_config(free_port(), free_port(), Some(free_udp_port()), dst.port());

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    let public_udp = addrs.public_udp.unwrap();
    let client = Relay::new();
    client.start_client(cfg).await.unwrap();
    connected(&server).await;

    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    assert_eq!(udp_ask(&a, public_udp, b"a1").await, b"echo:a1");
    assert_eq!(udp_ask(&b, public_udp, b"b1").await, b"echo:b1");
    assert_eq!(udp_ask(&a, public_udp, b"a2").await, b"echo:a2");

    let mut peers: Vec<String> = server
        .sessions()
        .into_iter()
        .filter(|s| s.kind == StreamKind::Udp)
        .map(|s| s.peer)
        .collect();
    peers.sort();
    let mut want = vec![
        a.local_addr().unwrap().to_string(),
        b.local_addr().unwrap().to_string(),
    ];
    want.sort();
    assert_eq!(peers, want);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn closing_the_channel_ends_every_session() {
    let dst = tcp_echo().await;
    let cfg = relay_config(free_port(), free_port(), None, dst.port());

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    let client = Relay::new();
    client.start_client(cfg).await.unwrap();
    connected(&server).await;

    let mut held = Vec::new();
    for msg in [&b"one"[..], b"two"] {
        let mut c = TcpStream::connect(addrs.public_tcp).await.unwrap();
        c.write_all(msg).await.unwrap();
        let mut back = vec![0u8; msg.len()];
        timeout(WAIT, c.read_exact(&mut back)).await.unwrap().unwrap();
        held.push(c);
    }
    assert_eq!(server.status().active_sessions, 2);

    client.stop().await;

    wait_until(&server, "sessions drained", |st| st.active_sessions == 0).await;
    wait_until(&server, "listening again", |st| st.connectivity == Connectivity::Listening).await;
    assert!(server.sessions().is_empty());
    for mut c in held {
        let mut buf = [0u8; 8];
        let n = timeout(WAIT, c.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
    }

    server.stop().await;
}

#[tokio::test]
async fn client_retries_until_server_appears() {
    let dst = tcp_echo().await;
    let cfg = relay_config(free_port(), free_port(), None, dst.port());

    let client = Relay::new();
    let mut events = client.subscribe();
    client.start_client(cfg.clone()).await.unwrap();
    expect_event(&mut events, "connect_failed", |ev| {
        matches!(ev, RelayEvent::ConnectFailed { .. })
    })
    .await;
    assert!(client.status().reconnect_attempts >= 1);
    assert!(client.status().last_error.is_some());

    let server = Relay::new();
    let addrs = server.start_server(cfg).await.unwrap();
    connected(&client).await;
    assert_eq!(client.status().reconnect_attempts, 0);
    connected(&server).await;

    assert_eq!(round_trip(addrs.public_tcp, b"ping").await, b"ping");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn restarted_client_restores_forwarding() {
    let dst = tcp_echo().await;
    let cfg = relay_config(free_port(), free_port(), None, dst.port());

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    let client = Relay::new();
    client.start_client(cfg.clone()).await.unwrap();
    connected(&server).await;
    let first = server.status().channel_id.unwrap();
    assert_eq!(round_trip(addrs.public_tcp, b"before").await, b"before");

    client.stop().await;
    assert_eq!(client.stopped().await, Exit::Stopped);
    wait_until(&server, "channel gone", |st| st.channel_id.is_none()).await;

    client.start_client(cfg).await.unwrap();
    connected(&server).await;
    assert_ne!(server.status().channel_id, Some(first));
    assert_eq!(round_trip(addrs.public_tcp, b"after").await, b"after");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn idle_udp_session_expires_and_comes_back_with_new_id() {
    let dst = udp_echo().await;
    let mut cfg = relay_config(free_port(), free_port(), Some(free_udp_port()), dst.port());
    cfg.tuning.udp_idle_timeout = Duration::from_millis(400);

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    let public_udp = addrs.public_udp.unwrap();
    let client = Relay::new();
    client.start_client(cfg).await.unwrap();
    connected(&server).await;

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(udp_ask(&sock, public_udp, b"hello").await, b"echo:hello");
    let first = server.sessions()[0].id;

    wait_until(&server, "idle expiry", |st| st.active_sessions == 0).await;

    assert_eq!(udp_ask(&sock, public_udp, b"again").await, b"echo:again");
    let sessions = server.sessions();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].id > first);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn refused_destination_closes_public_connection() {
    let dead = free_port();
    let cfg = relay_config(free_port(), free_port(), None, dead);

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    let mut events = server.subscribe();
    let client = Relay::new();
    client.start_client(cfg).await.unwrap();
    connected(&server).await;

    let mut public = TcpStream::connect(addrs.public_tcp).await.unwrap();
    let mut got = Vec::new();
    timeout(WAIT, public.read_to_end(&mut got)).await.unwrap().unwrap();
    assert!(got.is_empty());

    let ev = expect_event(&mut events, "session_closed", |ev| {
        matches!(ev, RelayEvent::SessionClosed { .. })
    })
    .await;
    match ev {
        RelayEvent::SessionClosed { kind, reason, .. } => {
            assert_eq!(kind, StreamKind::Tcp);
            assert!(reason.starts_with("dial failed"), "reason: {reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_until(&server, "no sessions", |st| st.active_sessions == 0).await;
    // The channel survives a failed dial.
    assert_eq!(server.status().connectivity, Connectivity::Connected);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn reject_policy_keeps_the_first_client() {
    let dst = tcp_echo().await;
    let mut cfg = relay_config(free_port(), free_port(), None, dst.port());
    cfg.tuning.channel_policy = ChannelPolicy::Reject;

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    let mut events = server.subscribe();
    let first = Relay::new();
    first.start_client(cfg.clone()).await.unwrap();
    connected(&server).await;
    let active = server.status().channel_id;

    let mut late = cfg.clone();
    late.tuning.max_retries = 1;
    let second = Relay::new();
    second.start_client(late).await.unwrap();

    match timeout(WAIT, second.stopped()).await.unwrap() {
        Exit::Failed(msg) => assert!(msg.contains("rejected"), "{msg}"),
        Exit::Stopped => panic!("second client should have been refused"),
    }
    assert_eq!(second.status().connectivity, Connectivity::Failing);
    expect_event(&mut events, "channel_rejected", |ev| {
        matches!(ev, RelayEvent::ChannelRejected { .. })
    })
    .await;

    assert_eq!(server.status().channel_id, active);
    assert_eq!(round_trip(addrs.public_tcp, b"still up").await, b"still up");

    second.stop().await;
    first.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn replace_policy_closes_the_first_channel() {
    let dst = tcp_echo().await;
    let cfg = relay_config(free_port(), free_port(), None, dst.port());

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    let mut events = server.subscribe();
    let first = Relay::new();
    first.start_client(cfg.clone()).await.unwrap();
    connected(&server).await;
    let old = server.status().channel_id.unwrap();

    let second = Relay::new();
    second.start_client(cfg).await.unwrap();

    let ev = expect_event(&mut events, "channel_down", |ev| {
        matches!(ev, RelayEvent::ChannelDown { channel_id, .. } if *channel_id == old)
    })
    .await;
    match ev {
        RelayEvent::ChannelDown { reason, .. } => assert!(reason.contains("replaced"), "{reason}"),
        other => panic!("unexpected event {other:?}"),
    }
    // The displaced client gives up instead of reconnecting and taking the slot back.
    match timeout(WAIT, first.stopped()).await.unwrap() {
        Exit::Failed(msg) => assert!(msg.contains("replaced"), "{msg}"),
        Exit::Stopped => panic!("displaced client should have given up"),
    }
    assert_eq!(first.status().connectivity, Connectivity::Failing);

    wait_until(&server, "new channel", |st| {
        st.channel_id.is_some_and(|id| id != old)
    })
    .await;
    let current = server.status().channel_id;

    let mut later = server.subscribe();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut installs = 0;
    while let Ok(ev) = later.try_recv() {
        if matches!(ev, RelayEvent::ChannelUp { .. }) {
            installs += 1;
        }
    }
    assert_eq!(installs, 0, "the channel slot kept changing hands");
    assert_eq!(server.status().channel_id, current);
    assert_eq!(round_trip(addrs.public_tcp, b"second").await, b"second");

    second.stop().await;
    first.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn client_reconnects_after_server_restart() {
    let dst = tcp_echo().await;
    let cfg = relay_config(free_port(), free_port(), None, dst.port());

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    let client = Relay::new();
    let mut events = client.subscribe();
    client.start_client(cfg.clone()).await.unwrap();
    connected(&client).await;
    assert_eq!(round_trip(addrs.public_tcp, b"before").await, b"before");

    server.stop().await;
    expect_event(&mut events, "channel_down", |ev| {
        matches!(ev, RelayEvent::ChannelDown { .. })
    })
    .await;
    assert!(client.is_running().await);

    let addrs = server.start_server(cfg).await.unwrap();
    expect_event(&mut events, "channel_up", |ev| {
        matches!(ev, RelayEvent::ChannelUp { .. })
    })
    .await;
    connected(&client).await;
    connected(&server).await;
    assert_eq!(round_trip(addrs.public_tcp, b"after").await, b"after");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn stalled_destination_leaves_other_sessions_flowing() {
    let (dst, held) = stalling_destination().await;
    let cfg = relay_config(free_port(), free_port(), None, dst.port());

    let server = Relay::new();
    let addrs = server.start_server(cfg.clone()).await.unwrap();
    let client = Relay::new();
    client.start_client(cfg).await.unwrap();
    connected(&server).await;
    let channel = server.status().channel_id;

    let mut hog = TcpStream::connect(addrs.public_tcp).await.unwrap();
    timeout(WAIT, held).await.unwrap().unwrap();
    let writer = tokio::spawn(async move {
        let chunk = vec![0u8; 64 * 1024];
        while hog.write_all(&chunk).await.is_ok() {}
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Longer than the heartbeat timeout: a starved control stream would drop the channel.
    for i in 0..12 {
        let msg = format!("flowing {i}");
        assert_eq!(round_trip(addrs.public_tcp, msg.as_bytes()).await, msg.as_bytes());
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(!writer.is_finished(), "the stalled connection should still be backed up");
    assert_eq!(server.status().connectivity, Connectivity::Connected);
    assert_eq!(server.status().channel_id, channel);

    writer.abort();
    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn local_role_pipes_source_to_destination() {
    let dst = tcp_echo().await;
    let src_port = free_port();
    let mut cfg = relay_config(free_port(), src_port, None, dst.port());
    cfg.server = None;
    cfg.client = None;

    let local = Relay::new();
    let mut events = local.subscribe();
    let addr = local.start_local(cfg).await.unwrap();
    assert_eq!(addr.port(), src_port);
    let st = local.status();
    assert_eq!(st.role, Some(RelayRole::Local));
    assert_eq!(st.connectivity, Connectivity::Listening);

    assert_eq!(round_trip(addr, b"direct").await, b"direct");
    expect_event(&mut events, "transfer_src_data", |ev| {
        matches!(ev, RelayEvent::TransferSrcData { bytes: 6, .. })
    })
    .await;
    expect_event(&mut events, "transfer_dst_data", |ev| {
        matches!(ev, RelayEvent::TransferDstData { bytes: 6, .. })
    })
    .await;

    local.stop().await;
    assert_eq!(local.stopped().await, Exit::Stopped);
    TcpListener::bind(("127.0.0.1", src_port)).await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_refused_before_binding() {
    let mut cfg = relay_config(free_port(), free_port(), None, 8080);
    if let Some(server) = cfg.server.as_mut() {
        server.tcp_port = 0;
    }
    let relay = Relay::new();
    match relay.start_server(cfg.clone()).await {
        Err(RelayError::Config(ConfigError::InvalidPort { field, .. })) => {
            assert_eq!(field, "Server.tcpPort")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!relay.is_running().await);

    cfg.client = None;
    match relay.start_client(cfg).await {
        Err(err) => assert!(err.to_string().contains("Client"), "{err}"),
        Ok(()) => panic!("client without a Client section"),
    }
}

#[tokio::test]
async fn second_start_is_refused() {
    let cfg = relay_config(free_port(), free_port(), None, 8080);
    let relay = Relay::new();
    relay.start_server(cfg.clone()).await.unwrap();
    assert!(matches!(
        relay.start_client(cfg).await,
        Err(RelayError::AlreadyRunning)
    ));
    relay.stop().await;
    assert!(!relay.is_running().await);
}

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::mircat::relay::{protocol::StreamKind, registry::SessionState};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub mod metric {
    pub const SESSIONS_TOTAL: &str = "mircat_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "mircat_sessions_active";
    pub const CHANNELS_TOTAL: &str = "mircat_channels_total";
    pub const BYTES_INGRESS_TOTAL: &str = "mircat_bytes_ingress_total";
    pub const BYTES_EGRESS_TOTAL: &str = "mircat_bytes_egress_total";
    pub const UDP_DATAGRAMS_DROPPED_TOTAL: &str = "mircat_udp_datagrams_dropped_total";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    Server,
    Client,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Idle,
    Listening,
    Connecting,
    Connected,
    Disconnected,
    /// Connect attempts keep failing (or the retry limit was hit).
    Failing,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub kind: StreamKind,
    pub peer: String,
    pub channel_id: u64,
    pub stream_id: u64,
    pub state: SessionState,
    pub started_at_unix_ms: u64,
    pub idle_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Status snapshot for a shell to poll.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub role: Option<RelayRole>,
    pub connectivity: Connectivity,
    pub channel_id: Option<u64>,
    pub channel_peer: Option<String>,
    pub destination: Option<String>,
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub updated_at_unix_ms: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            role: None,
            connectivity: Connectivity::Idle,
            channel_id: None,
            channel_peer: None,
            destination: None,
            active_sessions: 0,
            total_sessions: 0,
            reconnect_attempts: 0,
            last_error: None,
            updated_at_unix_ms: now_unix_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    Listening {
        control: SocketAddr,
        public_tcp: SocketAddr,
        public_udp: Option<SocketAddr>,
        shared_port: bool,
    },
    ChannelUp {
        channel_id: u64,
        peer: String,
        destination: String,
    },
    ChannelDown {
        channel_id: u64,
        reason: String,
    },
    ChannelRejected {
        peer: String,
        reason: String,
    },
    ConnectFailed {
        attempt: u32,
        error: String,
        retry_in_ms: u64,
    },
    RetriesExhausted {
        attempts: u32,
        error: String,
    },
    SessionOpened {
        session: SessionInfo,
    },
    SessionClosed {
        session_id: u64,
        kind: StreamKind,
        reason: String,
    },
    /// Bytes read from a local-transfer client, on their way to the destination.
    TransferSrcData {
        session_id: u64,
        peer: String,
        bytes: usize,
    },
    /// Bytes read from the destination, on their way back to a local-transfer client.
    TransferDstData {
        session_id: u64,
        peer: String,
        bytes: usize,
    },
    Stopped,
}

const EVENT_BACKLOG: usize = 256;

/// Current status plus the event feed of one relay role.
#[derive(Debug)]
pub struct StatusBoard {
    status: watch::Sender<Status>,
    events: broadcast::Sender<RelayEvent>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (status, _) = watch::channel(Status::default());
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        Self { status, events }
    }

    pub fn snapshot(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn update(&self, f: impl FnOnce(&mut Status)) {
        self.status.send_modify(|st| {
            f(st);
            st.updated_at_unix_ms = now_unix_ms();
        });
    }

    pub fn set_connectivity(&self, c: Connectivity) {
        self.update(|st| st.connectivity = c);
    }

    /// Publish an event. Slow subscribers lag and lose the oldest events.
    pub fn publish(&self, ev: RelayEvent) {
        tracing::trace!(event = ?ev, "telemetry: event");
        let _ = self.events.send(ev);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedStatusBoard = Arc<StatusBoard>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

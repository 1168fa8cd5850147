use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::mircat::{
    relay::{error::RelayError, protocol::StreamKind},
    telemetry::{self, RelayEvent, SessionInfo, SharedStatusBoard, metric},
};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    DialFailed(String),
    IdleTimeout,
    ChannelLost,
    Shutdown,
    Error(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::DialFailed(r) => write!(f, "dial failed: {r}"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::ChannelLost => write!(f, "channel lost"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::Error(r) => write!(f, "error: {r}"),
        }
    }
}

/// Bookkeeping for one TCP stream or one UDP flow.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub kind: StreamKind,
    pub peer: SocketAddr,
    pub channel_id: u64,
    // 0 until a UDP flow's stream is open.
    stream_id: AtomicU64,
    // Datagrams from the source, for server-side UDP flows.
    inbox: Option<mpsc::Sender<Bytes>>,
    started_at_unix_ms: u64,
    created: Instant,
    // Milliseconds since `created`.
    last_activity_ms: AtomicU64,
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
    cancel: watch::Sender<bool>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Session {
    pub fn stream_id(&self) -> u64 {
        self.stream_id.load(Ordering::Relaxed)
    }

    /// Record the stream opened for a flow that was registered before it had one.
    pub fn bind_stream(&self, stream_id: u64) {
        self.stream_id.store(stream_id, Ordering::Relaxed);
    }

    /// Queue a datagram for this flow without waiting.
    ///
    /// `Full` means the flow is behind and the datagram should be dropped; `Closed` means the flow
    /// task is gone (or the session has no inbox).
    pub fn offer(&self, payload: Bytes) -> Result<(), mpsc::error::TrySendError<Bytes>> {
        match &self.inbox {
            Some(tx) => tx.try_send(payload),
            None => Err(mpsc::error::TrySendError::Closed(payload)),
        }
    }

    pub fn touch(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Bytes received from the peer side of this session.
    pub fn record_ingress(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(metric::BYTES_INGRESS_TOTAL, "kind" => self.kind.as_str()).increment(n);
        self.touch();
    }

    /// Bytes sent back to the peer side of this session.
    pub fn record_egress(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(metric::BYTES_EGRESS_TOTAL, "kind" => self.kind.as_str()).increment(n);
        self.touch();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.created + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => SessionState::Open,
            STATE_CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.reason.get()
    }

    /// Resolves once the session has been closed through the registry.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            kind: self.kind,
            peer: self.peer.to_string(),
            channel_id: self.channel_id,
            stream_id: self.stream_id(),
            state: self.state(),
            started_at_unix_ms: self.started_at_unix_ms,
            idle_ms: self.idle_for(Instant::now()).as_millis() as u64,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Active sessions of one relay role, reachable by id and by (kind, peer).
#[derive(Debug)]
pub struct SessionRegistry {
    by_id: DashMap<SessionId, Arc<Session>>,
    by_src: DashMap<(StreamKind, SocketAddr), SessionId>,
    next_id: AtomicU64,
    total: AtomicU64,
    board: SharedStatusBoard,
}

impl SessionRegistry {
    pub fn new(board: SharedStatusBoard) -> Self {
        Self {
            by_id: DashMap::new(),
            by_src: DashMap::new(),
            next_id: AtomicU64::new(1),
            total: AtomicU64::new(0),
            board,
        }
    }

    pub fn create(
        &self,
        kind: StreamKind,
        peer: SocketAddr,
        channel_id: u64,
        stream_id: u64,
    ) -> Arc<Session> {
        self.insert(kind, peer, channel_id, stream_id, None)
    }

    /// Register a server-side UDP flow on its first datagram, before its stream exists.
    ///
    /// Later datagrams from `peer` find it through [`lookup_by_source`](Self::lookup_by_source)
    /// and are queued with [`Session::offer`].
    pub fn create_flow(&self, peer: SocketAddr, channel_id: u64, inbox: mpsc::Sender<Bytes>) -> Arc<Session> {
        self.insert(StreamKind::Udp, peer, channel_id, 0, Some(inbox))
    }

    fn insert(
        &self,
        kind: StreamKind,
        peer: SocketAddr,
        channel_id: u64,
        stream_id: u64,
        inbox: Option<mpsc::Sender<Bytes>>,
    ) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, _) = watch::channel(false);
        let s = Arc::new(Session {
            id,
            kind,
            peer,
            channel_id,
            stream_id: AtomicU64::new(stream_id),
            inbox,
            started_at_unix_ms: telemetry::now_unix_ms(),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            state: AtomicU8::new(STATE_OPEN),
            reason: OnceLock::new(),
            cancel,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        });

        self.by_id.insert(id, s.clone());
        self.by_src.insert((kind, peer), id);
        self.total.fetch_add(1, Ordering::Relaxed);

        metrics::counter!(metric::SESSIONS_TOTAL, "kind" => kind.as_str()).increment(1);
        metrics::gauge!(metric::SESSIONS_ACTIVE).increment(1.0);

        tracing::debug!(sid = id, cid = channel_id, stream = stream_id, kind = %kind, peer = %peer, "registry: session opened");
        self.board.publish(RelayEvent::SessionOpened { session: s.info() });
        s
    }

    pub fn lookup(&self, id: SessionId) -> Option<Arc<Session>> {
        self.by_id.get(&id).map(|s| s.value().clone())
    }

    pub fn lookup_by_source(&self, kind: StreamKind, peer: SocketAddr) -> Option<Arc<Session>> {
        let id = *self.by_src.get(&(kind, peer))?.value();
        self.lookup(id)
    }

    pub fn touch(&self, id: SessionId) -> bool {
        match self.by_id.get(&id) {
            Some(s) => {
                s.touch();
                true
            }
            None => false,
        }
    }

    /// Close a session. Only the first call for a given session takes effect and
    /// records its reason; later calls return `false`.
    pub fn close(&self, id: SessionId, reason: CloseReason) -> bool {
        let Some(s) = self.lookup(id) else {
            return false;
        };
        if s
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let _ = s.reason.set(reason.clone());
        s.cancel.send_replace(true);

        self.by_id.remove(&id);
        self.by_src.remove_if(&(s.kind, s.peer), |_, v| *v == id);
        s.state.store(STATE_CLOSED, Ordering::Release);
        metrics::gauge!(metric::SESSIONS_ACTIVE).decrement(1.0);

        match &reason {
            CloseReason::IdleTimeout => {
                let err = RelayError::SessionTimeout {
                    session_id: id,
                    idle: s.idle_for(Instant::now()),
                };
                tracing::debug!(sid = id, cid = s.channel_id, err = %err, "registry: session expired");
            }
            CloseReason::PeerClosed | CloseReason::Shutdown => {
                tracing::debug!(sid = id, cid = s.channel_id, reason = %reason, "registry: session closed");
            }
            _ => {
                tracing::info!(sid = id, cid = s.channel_id, peer = %s.peer, reason = %reason, "registry: session closed");
            }
        }

        self.board.publish(RelayEvent::SessionClosed {
            session_id: id,
            kind: s.kind,
            reason: reason.to_string(),
        });
        true
    }

    /// Close every session bound to `channel_id`. Returns how many were closed.
    pub fn close_channel(&self, channel_id: u64, reason: CloseReason) -> usize {
        let ids: Vec<SessionId> = self
            .by_id
            .iter()
            .filter(|e| e.value().channel_id == channel_id)
            .map(|e| *e.key())
            .collect();
        ids.into_iter()
            .filter(|id| self.close(*id, reason.clone()))
            .count()
    }

    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<SessionId> = self.by_id.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.close(*id, reason.clone()))
            .count()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self.by_id.iter().map(|e| e.value().info()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn active_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn total_created(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Close sessions idle beyond their kind's timeout. A zero timeout disables expiry for that kind.
    pub fn sweep(&self, udp_idle: Duration, tcp_idle: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .by_id
            .iter()
            .filter(|e| {
                let s = e.value();
                let limit = match s.kind {
                    StreamKind::Udp => udp_idle,
                    StreamKind::Tcp => tcp_idle,
                };
                !limit.is_zero() && s.idle_for(now) >= limit
            })
            .map(|e| *e.key())
            .collect();
        expired
            .into_iter()
            .filter(|id| self.close(*id, CloseReason::IdleTimeout))
            .count()
    }

    pub async fn run_sweeper(
        self: Arc<Self>,
        every: Duration,
        udp_idle: Duration,
        tcp_idle: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    let n = self.sweep(udp_idle, tcp_idle);
                    if n > 0 {
                        tracing::debug!(expired = n, "registry: sweep");
                    }
                }
            }
        }
    }
}

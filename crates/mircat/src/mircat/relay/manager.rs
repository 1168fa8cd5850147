use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{RwLock, watch},
    time::timeout,
};

use crate::mircat::{
    config::ChannelPolicy,
    relay::{
        error,
        protocol::{self, Farewell, ProtocolError, StreamHeader, StreamKind},
        transport::{BoxedStream, TransportSession},
    },
    telemetry,
};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("no active channel")]
    NoChannel,
    #[error("channel {active} is already active")]
    Rejected { active: u64 },
    #[error("open stream on channel {channel_id}: {reason}")]
    OpenStream { channel_id: u64, reason: String },
    #[error("write stream header: {0}")]
    Header(#[from] ProtocolError),
    #[error("open stream on channel {channel_id}: timed out after {}", error::human(.after))]
    OpenTimeout { channel_id: u64, after: Duration },
}

/// The control channel currently installed in the server's slot.
pub struct ActiveChannel {
    pub id: u64,
    pub session: Arc<dyn TransportSession>,
    pub remote: String,
    /// Destination the client advertised in its hello.
    pub destination: String,
    started_at_unix_ms: u64,
    next_stream: AtomicU64,
    kick: watch::Sender<Option<Farewell>>,
}

impl std::fmt::Debug for ActiveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

impl ActiveChannel {
    /// Stream ids are unique for the channel's lifetime, starting at 1.
    fn next_stream_id(&self) -> u64 {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }

    /// Ask the task driving this channel to say `farewell` and close it.
    pub fn kick(&self, farewell: Farewell) {
        self.kick.send_if_modified(|r| {
            if r.is_some() {
                return false;
            }
            *r = Some(farewell);
            true
        });
    }

    /// Resolves with the farewell of the first [`kick`](Self::kick).
    pub async fn kicked(&self) -> Farewell {
        let mut rx = self.kick.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(r) => r.clone().unwrap_or_else(|| Farewell::GoAway(String::new())),
            Err(_) => Farewell::GoAway(String::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub id: u64,
    pub remote: String,
    pub destination: String,
    pub started_at_unix_ms: u64,
    pub streams_opened: u64,
}

pub struct OpenedStream {
    pub channel_id: u64,
    pub stream_id: u64,
    pub stream: BoxedStream,
}

/// Server-side slot holding at most one control channel.
pub struct ChannelManager {
    id_seq: AtomicU64,
    policy: ChannelPolicy,
    open_timeout: Duration,
    slot: RwLock<Option<Arc<ActiveChannel>>>,
    changed: watch::Sender<Option<u64>>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ChannelManager {
    /// `open_timeout` bounds opening a stream and writing its header.
    pub fn new(policy: ChannelPolicy, open_timeout: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            id_seq: AtomicU64::new(1),
            policy,
            open_timeout,
            slot: RwLock::new(None),
            changed: tx,
        }
    }

    pub fn policy(&self) -> ChannelPolicy {
        self.policy
    }

    /// Watch the id of the installed channel.
    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.changed.subscribe()
    }

    pub fn next_channel_id(&self) -> u64 {
        self.id_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Install a freshly handshaken channel.
    ///
    /// Under [`ChannelPolicy::Replace`] the previous channel is taken out of the slot and returned;
    /// the caller closes it and cascades its sessions. Under [`ChannelPolicy::Reject`] an occupied
    /// slot refuses the newcomer.
    pub async fn install(
        &self,
        id: u64,
        session: Arc<dyn TransportSession>,
        destination: String,
    ) -> Result<(Arc<ActiveChannel>, Option<Arc<ActiveChannel>>), ManagerError> {
        let remote = session
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let ch = Arc::new(ActiveChannel {
            id,
            session,
            remote,
            destination,
            started_at_unix_ms: telemetry::now_unix_ms(),
            next_stream: AtomicU64::new(1),
            kick: watch::channel(None).0,
        });

        let mut slot = self.slot.write().await;
        if let Some(active) = slot.as_ref() {
            if self.policy == ChannelPolicy::Reject {
                return Err(ManagerError::Rejected { active: active.id });
            }
        }
        let old = slot.replace(ch.clone());
        drop(slot);

        self.changed.send_replace(Some(id));
        Ok((ch, old))
    }

    /// Clear the slot if it still holds channel `id`. Returns whether it did.
    pub async fn remove(&self, id: u64) -> bool {
        let mut slot = self.slot.write().await;
        if slot.as_ref().is_some_and(|c| c.id == id) {
            *slot = None;
            drop(slot);
            self.changed.send_replace(None);
            return true;
        }
        false
    }

    /// Empty the slot unconditionally.
    pub async fn take(&self) -> Option<Arc<ActiveChannel>> {
        let old = self.slot.write().await.take();
        if old.is_some() {
            self.changed.send_replace(None);
        }
        old
    }

    pub async fn current(&self) -> Option<Arc<ActiveChannel>> {
        self.slot.read().await.clone()
    }

    pub async fn snapshot(&self) -> Option<ChannelSnapshot> {
        let ch = self.current().await?;
        Some(ChannelSnapshot {
            id: ch.id,
            remote: ch.remote.clone(),
            destination: ch.destination.clone(),
            started_at_unix_ms: ch.started_at_unix_ms,
            streams_opened: ch.next_stream.load(Ordering::Relaxed) - 1,
        })
    }

    /// Open a relay stream on the installed channel and write its header.
    pub async fn open_stream(
        &self,
        kind: StreamKind,
        peer: SocketAddr,
    ) -> Result<OpenedStream, ManagerError> {
        let ch = self.current().await.ok_or(ManagerError::NoChannel)?;
        self.open_stream_on(&ch, kind, peer).await
    }

    /// Like [`open_stream`](Self::open_stream), on a channel the caller already holds.
    ///
    /// The slot lock is not held here, so a wedged peer only stalls this call, and only up to the
    /// open timeout.
    pub async fn open_stream_on(
        &self,
        ch: &ActiveChannel,
        kind: StreamKind,
        peer: SocketAddr,
    ) -> Result<OpenedStream, ManagerError> {
        let open = async {
            let mut stream = ch
                .session
                .open_stream()
                .await
                .map_err(|err| ManagerError::OpenStream {
                    channel_id: ch.id,
                    reason: format!("{err:#}"),
                })?;

            let stream_id = ch.next_stream_id();
            protocol::write_stream_header(
                &mut stream,
                &StreamHeader {
                    kind,
                    stream_id,
                    peer: peer.to_string(),
                },
            )
            .await?;
            Ok(OpenedStream {
                channel_id: ch.id,
                stream_id,
                stream,
            })
        };

        timeout(self.open_timeout, open)
            .await
            .map_err(|_| ManagerError::OpenTimeout {
                channel_id: ch.id,
                after: self.open_timeout,
            })?
    }
}

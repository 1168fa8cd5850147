use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};

use crate::mircat::{
    config::RelayConfig,
    relay::{
        client::{self, ClientCtx},
        error::RelayError,
        local::{self, LocalCtx},
        manager::{ChannelManager, ChannelSnapshot},
        registry::{CloseReason, SessionRegistry},
        server::{self, BoundServer, ServerCtx},
    },
    telemetry::{Connectivity, RelayEvent, RelayRole, SessionInfo, SharedStatusBoard, Status, StatusBoard},
};

/// Upper bound on how long `stop` waits for the role to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How a role ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Stopped,
    Failed(String),
}

/// Addresses the server role actually bound.
#[derive(Debug, Clone, Copy)]
pub struct ServerAddrs {
    pub control: SocketAddr,
    pub public_tcp: SocketAddr,
    pub public_udp: Option<SocketAddr>,
    pub shared_port: bool,
}

struct Running {
    role: RelayRole,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    manager: Option<Arc<ChannelManager>>,
}

/// Control surface of one relay role (server, client or local).
///
/// A process running both roles holds two of these.
pub struct Relay {
    board: SharedStatusBoard,
    registry: Arc<SessionRegistry>,
    running: Mutex<Option<Running>>,
    exit: watch::Sender<Option<Exit>>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        let board: SharedStatusBoard = Arc::new(StatusBoard::new());
        Self {
            registry: Arc::new(SessionRegistry::new(board.clone())),
            board,
            running: Mutex::new(None),
            exit: watch::channel(None).0,
        }
    }

    /// Validate, bind the public and control endpoints, and start serving.
    ///
    /// Bind and config errors are returned here, before anything is spawned.
    pub async fn start_server(&self, cfg: RelayConfig) -> Result<ServerAddrs, RelayError> {
        let mut slot = self.running.lock().await;
        if slot.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let (server_cfg, transfer) = cfg.server_parts()?;
        let bound = BoundServer::bind(server_cfg, transfer).await?;
        let addrs = ServerAddrs {
            control: bound.control_addr,
            public_tcp: bound.public_addr,
            public_udp: bound.udp_addr,
            shared_port: bound.shared_port(),
        };

        let manager = Arc::new(ChannelManager::new(cfg.tuning.channel_policy, cfg.tuning.dial_timeout));
        let ctx = Arc::new(ServerCtx {
            manager: manager.clone(),
            registry: self.registry.clone(),
            board: self.board.clone(),
            expected_destination: transfer.dst_target().unwrap_or_default(),
            tuning: cfg.tuning,
        });

        self.reset(RelayRole::Server);
        let (shutdown, rx) = watch::channel(false);
        let exit = self.exit.clone();
        let task = tokio::spawn(async move {
            server::run(bound, ctx, rx).await;
            exit.send_replace(Some(Exit::Stopped));
        });

        *slot = Some(Running {
            role: RelayRole::Server,
            shutdown,
            task,
            manager: Some(manager),
        });
        Ok(addrs)
    }

    /// Validate and start dialing the server. Connect failures are retried in the background.
    pub async fn start_client(&self, cfg: RelayConfig) -> Result<(), RelayError> {
        let mut slot = self.running.lock().await;
        if slot.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let (client_cfg, transfer) = cfg.client_parts()?;
        let ctx = Arc::new(ClientCtx {
            registry: self.registry.clone(),
            board: self.board.clone(),
            server: client_cfg.server_target()?,
            destination: transfer.dst_target()?,
            tuning: cfg.tuning,
        });
        tracing::info!(server = %ctx.server, destination = %ctx.destination, "client: starting");

        self.reset(RelayRole::Client);
        let (shutdown, rx) = watch::channel(false);
        let exit = self.exit.clone();
        let task = tokio::spawn(async move {
            let outcome = match client::run(ctx, rx).await {
                Ok(()) => Exit::Stopped,
                Err(err) => Exit::Failed(err.to_string()),
            };
            exit.send_replace(Some(outcome));
        });

        *slot = Some(Running {
            role: RelayRole::Client,
            shutdown,
            task,
            manager: None,
        });
        Ok(())
    }

    /// Validate, bind the transfer source and start piping it straight to the destination.
    pub async fn start_local(&self, cfg: RelayConfig) -> Result<SocketAddr, RelayError> {
        let mut slot = self.running.lock().await;
        if slot.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let transfer = cfg.local_parts()?;
        let src = transfer.src_bind()?;
        let ln = tokio::net::TcpListener::bind(src)
            .await
            .map_err(|source| RelayError::Bind { addr: src, source })?;
        let addr = ln.local_addr()?;
        let ctx = Arc::new(LocalCtx {
            registry: self.registry.clone(),
            board: self.board.clone(),
            destination: transfer.dst_target()?,
            tuning: cfg.tuning,
        });

        self.reset(RelayRole::Local);
        let (shutdown, rx) = watch::channel(false);
        let exit = self.exit.clone();
        let task = tokio::spawn(async move {
            local::run(ln, ctx, rx).await;
            exit.send_replace(Some(Exit::Stopped));
        });

        *slot = Some(Running {
            role: RelayRole::Local,
            shutdown,
            task,
            manager: None,
        });
        Ok(addr)
    }

    fn reset(&self, role: RelayRole) {
        self.exit.send_replace(None);
        self.board.update(|st| {
            *st = Status {
                role: Some(role),
                ..Status::default()
            };
        });
    }

    /// Stop the running role: cancel every session, close the channel and release all sockets.
    ///
    /// A no-op when nothing is running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);

        let mut task = running.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!(role = ?running.role, "relay: stop timed out; aborting");
            task.abort();
        }

        self.registry.close_all(CloseReason::Shutdown);
        self.board.update(|st| {
            st.connectivity = Connectivity::Stopped;
            st.channel_id = None;
            st.channel_peer = None;
        });
        self.exit.send_if_modified(|e| {
            if e.is_some() {
                return false;
            }
            *e = Some(Exit::Stopped);
            true
        });
        self.board.publish(RelayEvent::Stopped);
        tracing::info!(role = ?running.role, "relay: stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn status(&self) -> Status {
        let mut st = self.board.snapshot();
        st.active_sessions = self.registry.active_count();
        st.total_sessions = self.registry.total_created();
        st
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.board.subscribe()
    }

    /// Details of the channel installed on a running server.
    pub async fn channel(&self) -> Option<ChannelSnapshot> {
        let manager = self.running.lock().await.as_ref()?.manager.clone()?;
        manager.snapshot().await
    }

    /// Resolves once the current role has ended, either through [`stop`](Self::stop) or on its own
    /// (a client whose retry limit ran out).
    pub async fn stopped(&self) -> Exit {
        let mut rx = self.exit.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(e) => (*e).clone().unwrap_or(Exit::Stopped),
            Err(_) => Exit::Stopped,
        }
    }
}

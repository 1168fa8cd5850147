use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::mircat::{
    admin, config, logging, net,
    relay::{Exit, Relay},
    telemetry,
};

pub async fn run(config_path: Option<PathBuf>, role: Option<config::Role>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    if let Some(role) = role {
        cfg.role = role;
    }

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        role = ?cfg.role,
        admin_addr = %cfg.admin_addr,
        "mircat: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let server = if cfg.role.runs_server() {
        let relay = Arc::new(Relay::new());
        let addrs = relay
            .start_server(cfg.relay.clone())
            .await
            .context("start server role")?;
        tracing::debug!(addrs = ?addrs, "server: started");
        Some(relay)
    } else {
        None
    };

    let client = if cfg.role.runs_client() {
        let relay = Arc::new(Relay::new());
        if let Err(err) = relay.start_client(cfg.relay.clone()).await {
            if let Some(server) = &server {
                server.stop().await;
            }
            return Err(err).context("start client role");
        }
        Some(relay)
    } else {
        None
    };

    let local = if cfg.role.runs_local() {
        let relay = Arc::new(Relay::new());
        let addr = relay
            .start_local(cfg.relay.clone())
            .await
            .context("start local role")?;
        tracing::debug!(src = %addr, "local: started");
        Some(relay)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            server: server.clone(),
            client: client.clone(),
            local: local.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for Ctrl-C / SIGTERM, a role ending on its own, or the admin server failing.
    let mut failure: Option<anyhow::Error> = None;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        exit = role_exit([server.as_deref(), client.as_deref(), local.as_deref()]) => {
            if let Exit::Failed(msg) = exit {
                tracing::error!(err = %msg, "relay: role failed");
                failure = Some(anyhow::anyhow!("relay: {msg}"));
            }
        }
        Some(res) = tasks.join_next(), if !tasks.is_empty() => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failure = Some(err.context("admin server")),
                Err(join_err) => failure = Some(join_err.into()),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(local) = &local {
        local.stop().await;
    }
    if let Some(client) = &client {
        client.stop().await;
    }
    if let Some(server) = &server {
        server.stop().await;
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Resolves with the exit of whichever running role ends first.
async fn role_exit(roles: [Option<&Relay>; 3]) -> Exit {
    let waits: Vec<_> = roles.into_iter().flatten().map(|r| Box::pin(r.stopped())).collect();
    if waits.is_empty() {
        return std::future::pending().await;
    }
    futures_util::future::select_all(waits).await.0
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures_util::{Stream, stream};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::mircat::{
    relay::{Relay, manager::ChannelSnapshot},
    telemetry::{RelayEvent, SessionInfo, SharedPrometheusHandle, Status},
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: SharedPrometheusHandle,
    pub server: Option<Arc<Relay>>,
    pub client: Option<Arc<Relay>>,
    pub local: Option<Arc<Relay>>,
}

impl AdminState {
    fn roles(&self) -> impl Iterator<Item = (&'static str, &Arc<Relay>)> {
        [("server", &self.server), ("client", &self.client), ("local", &self.local)]
            .into_iter()
            .filter_map(|(name, relay)| relay.as_ref().map(|r| (name, r)))
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/sessions", get(sessions))
        .route("/events", get(events))
        .route("/metrics", get(metrics))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

#[derive(Debug, Serialize)]
struct ServerStatus {
    #[serde(flatten)]
    status: Status,
    channel: Option<ChannelSnapshot>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    server: Option<ServerStatus>,
    client: Option<Status>,
    local: Option<Status>,
}

async fn status(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let server = match &st.server {
        Some(relay) => Some(ServerStatus {
            status: relay.status(),
            channel: relay.channel().await,
        }),
        None => None,
    };
    let client = st.client.as_ref().map(|relay| relay.status());
    let local = st.local.as_ref().map(|relay| relay.status());
    (StatusCode::OK, Json(StatusResponse { server, client, local }))
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    server: Vec<SessionInfo>,
    client: Vec<SessionInfo>,
    local: Vec<SessionInfo>,
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let list = |relay: &Option<Arc<Relay>>| relay.as_ref().map(|r| r.sessions()).unwrap_or_default();
    (
        StatusCode::OK,
        Json(SessionsResponse {
            server: list(&st.server),
            client: list(&st.client),
            local: list(&st.local),
        }),
    )
}

/// Live event feed of every running role, as server-sent events named after the role.
async fn events(State(st): State<Arc<AdminState>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let feeds = st.roles().map(|(role, relay)| Box::pin(feed(role, relay.subscribe())));
    Sse::new(stream::select_all(feeds)).keep_alive(KeepAlive::default())
}

fn feed(role: &'static str, rx: broadcast::Receiver<RelayEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let event = match Event::default().event(role).json_data(&ev) {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::warn!(err = %err, "admin: event not serializable");
                            continue;
                        }
                    };
                    return Some((Ok(event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    let note = Event::default().comment(format!("{role}: {missed} events dropped"));
                    return Some((Ok(note), rx));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

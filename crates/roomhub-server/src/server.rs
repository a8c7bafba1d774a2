use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use roomhub_core::{
    CollaboratorError, MessageFilter, MessageStore, RoomId, StoredMessage, UserId, UserSummary,
};
use roomhub_settings::RoomhubSettings;
use roomhub_telemetry::MetricsRecorder;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, ServerError};
use crate::health::{self, HealthResponse};
use crate::hub::{Collaborators, Hub, HubHandle};
use crate::registry::RoomSummary;
use crate::session::{self, Identity, SessionConfig};

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub store: Option<Arc<dyn MessageStore>>,
    pub metrics: Arc<MetricsRecorder>,
    pub session: SessionConfig,
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rooms", get(rooms_handler))
        .route("/rooms/{room}/online", get(online_handler))
        .route("/rooms/{room}/messages", get(history_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener, start the hub, and serve until `shutdown` fires.
pub async fn start(
    settings: &RoomhubSettings,
    collaborators: Collaborators,
    metrics: Arc<MetricsRecorder>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, ServerError> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let (hub, hub_handle) = Hub::new(
        settings.hub.channel_capacity,
        collaborators.clone(),
        Arc::clone(&metrics),
        shutdown.clone(),
    );
    let hub_task = hub.spawn();

    let state = AppState {
        hub: hub_handle.clone(),
        store: collaborators.store,
        metrics,
        session: SessionConfig::from_settings(settings),
        shutdown: shutdown.clone(),
        start_time: Instant::now(),
    };
    let router = build_router(state);

    info!(%local_addr, "roomhub server started");

    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server stopped with error");
        }
        info!("listener closed");
    });

    Ok(ServerHandle {
        local_addr,
        hub: hub_handle,
        server,
        hub_task,
    })
}

/// Handle returned by [`start`]. Keeps the background tasks reachable so
/// shutdown can wait on them.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub hub: HubHandle,
    server: JoinHandle<()>,
    hub_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The listener and hub tasks, for `ShutdownCoordinator::graceful_shutdown`.
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        vec![self.server, self.hub_task]
    }
}

/// Query parameters of `GET /ws`. All three are required and must not be
/// blank.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub room_id: Option<String>,
}

impl ConnectParams {
    pub fn into_identity(self) -> Result<Identity, HandshakeError> {
        let user_id = required(self.user_id, "user_id")?;
        let username = required(self.username, "username")?;
        let room_id = required(self.room_id, "room_id")?;
        Ok(Identity {
            user: UserSummary::new(UserId::from_raw(user_id), username),
            room: RoomId::from_raw(room_id),
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, HandshakeError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(HandshakeError::MissingParameter(name)),
    }
}

/// GET /ws. Parameters are checked before the upgrade, so a bad request
/// never reaches the hub.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match params.into_identity() {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "rejecting connection");
            return ServerError::from(e).into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.max_message_size(state.session.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, identity, state))
}

async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let (sink, stream) = socket.split();
    session::run_session(
        sink,
        stream,
        identity,
        state.hub,
        state.session,
        state.metrics,
        state.shutdown,
    )
    .await;
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let stats = state.hub.stats().await.ok();
    let resp = health::health_check(state.start_time, stats, state.metrics.snapshot());
    let status = if resp.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}

async fn rooms_handler(State(state): State<AppState>) -> Result<Json<Vec<RoomSummary>>, ServerError> {
    Ok(Json(state.hub.rooms().await?))
}

#[derive(Debug, Serialize)]
struct OnlineResponse {
    room_id: RoomId,
    count: usize,
    online_users: Vec<UserSummary>,
}

async fn online_handler(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
) -> Result<Json<OnlineResponse>, ServerError> {
    let online_users = state.hub.online_users(room.clone()).await?;
    Ok(Json(OnlineResponse {
        room_id: room,
        count: online_users.len(),
        online_users,
    }))
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    room_id: RoomId,
    messages: Vec<StoredMessage>,
}

/// GET /rooms/{room}/messages, newest first.
async fn history_handler(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
    Query(filter): Query<MessageFilter>,
) -> Result<Json<HistoryResponse>, ServerError> {
    let store = state
        .store
        .ok_or_else(|| CollaboratorError::Unavailable("message store not configured".into()))?;
    let messages = store.query(&room, &filter).await?;
    Ok(Json(HistoryResponse {
        room_id: room,
        messages,
    }))
}

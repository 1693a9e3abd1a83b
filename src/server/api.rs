use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use super::hub::RelayHub;
use super::session::ConnectionId;
use crate::config::ServerConfig;
use crate::protocol::codec::{self, Frame, WireEncoding};
use crate::protocol::{ActiveProject, RelayEvent};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub encoding: WireEncoding,
    pub outbound_capacity: usize,
}

impl AppState {
    pub fn new(hub: Arc<RelayHub>, config: &ServerConfig) -> Self {
        Self {
            hub,
            encoding: WireEncoding::from_binary_flag(config.binary_frames),
            outbound_capacity: config.outbound_capacity.max(1),
        }
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    sessions: usize,
    connections: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "dx-sync relay" }))
        .route("/health", get(health))
        .route("/projects", get(list_projects))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "OK",
        version: crate::VERSION,
        sessions: state.hub.session_count(),
        connections: state.hub.connection_count(),
    })
}

async fn list_projects(State(state): State<AppState>) -> Json<Vec<ActiveProject>> {
    Json(state.hub.get_active_projects())
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn handle_ws(state: AppState, socket: WebSocket) {
    let connection = ConnectionId::new();
    let (mut sender, mut receiver) = socket.split();

    // One writer per connection keeps pushes in order
    let (tx, mut rx) = mpsc::channel::<RelayEvent>(state.outbound_capacity);
    state.hub.on_connected(connection, tx);

    let encoding = state.encoding;
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let message = match codec::encode(&event, encoding) {
                Ok(Frame::Text(text)) => Message::Text(text.into()),
                Ok(Frame::Binary(bytes)) => Message::Binary(bytes.into()),
                Err(err) => {
                    tracing::warn!(%connection, error = %err, "failed to encode push");
                    continue;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(msg) = receiver.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => Frame::Text(text.to_string()),
            Ok(Message::Binary(bytes)) => Frame::Binary(bytes.to_vec()),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(err) => {
                tracing::debug!(%connection, error = %err, "websocket read failed");
                break;
            }
        };
        state.hub.handle_frame(connection, &frame);
    }

    state.hub.on_disconnected(connection);
    send_task.abort();
}

// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! HTTP and WebSocket routes for the `meshroom` server.
//!
//! `/ws` carries the signaling protocol; `/api/*` serves read-only room
//! lookups for the pre-join screen.
use crate::metrics::{WS_ACTIVE, WS_CONNECTION};
use crate::websocket::ConnectionHandler;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use meshroom_common::{ClientMessage, RoomInfo, RoomSummary, ServerMessage};
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info_span, warn, Instrument};

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/rooms", get(list_rooms_handler))
        .route("/api/room/{room_id}", get(room_info_handler))
        .layer(TraceLayer::new_for_http());

    if state.settings.cors_permissive {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "Healthy"
}

async fn list_rooms_handler(State(state): State<Arc<AppState>>) -> Json<Vec<RoomSummary>> {
    Json(state.registry.list_rooms().await)
}

async fn room_info_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Json<RoomInfo> {
    Json(state.registry.room_info(&room_id).await)
}

/// Handle WebSocket connections
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    debug!("WebSocket connection attempt from: {}", addr);

    let mut handler = ConnectionHandler::new(state);
    handler.set_client_ip(addr.ip());

    let span = info_span!("connection", peer_id = %handler.peer_id(), %addr);
    ws.on_upgrade(move |socket| handle_socket(socket, handler).instrument(span))
}

async fn handle_socket(socket: WebSocket, mut handler: ConnectionHandler) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    handler.register(tx);

    counter!(WS_CONNECTION).increment(1);
    gauge!(WS_ACTIVE).increment(1.0);

    // Everything addressed to this peer, in queue order
    let send_task = tokio::spawn(
        async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize message: {e}");
                        continue;
                    },
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
        .in_current_span(),
    );

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(msg) => {
                    if let Err(e) = handler.handle_message(msg).await {
                        warn!("message failed: {e}");
                        handler.reply(ServerMessage::Error {
                            code: e.error_code().to_string(),
                            message: e.sanitized_message(),
                        });
                    }
                },
                Err(e) => {
                    debug!("malformed message: {e}");
                    handler.reply(ServerMessage::MalformedMessage {
                        err_msg: e.to_string(),
                    });
                },
            },
            Message::Close(_) => break,
            _ => {},
        }
    }

    handler.disconnect().await;
    gauge!(WS_ACTIVE).decrement(1.0);
    send_task.abort();
    debug!("connection closed");
}

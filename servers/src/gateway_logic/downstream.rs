//! # Downstream WebSocket Transport
//!
//! Axum routes for the two gateway channels plus the plain HTTP endpoints:
//!
//! - `GET /ws/public` and `GET /ws/admin`: WebSocket upgrades into the
//!   matching room.
//! - `GET /health`: liveness probe.
//! - `GET /stats`: current online counts as JSON.
//!
//! Each socket is split into a writer task draining the connection's bounded
//! outbound queue and a reader loop feeding text frames to the hub.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use lib_gateway::{ConnectionId, Handshake, Hub, HubStats, Outbound, Room};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

/// Close code sent after an `AUTH_FAILED` frame.
const POLICY_VIOLATION: u16 = 1008;

/// Shared state of the HTTP routes.
pub struct GatewayState {
    /// The hub every socket talks to.
    pub hub: Hub,
    /// Frames buffered per connection before new ones are dropped.
    pub outbound_buffer: usize,
    /// Fires on process shutdown; open sockets end their loops.
    pub shutdown: CancellationToken,
}

/// Builds the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/ws/public", get(public_ws_handler))
        .route("/ws/admin", get(admin_ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn stats_handler(State(state): State<Arc<GatewayState>>) -> Json<HubStats> {
    Json(state.hub.stats())
}

async fn public_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let handshake = handshake_from(&params, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, Room::Public, handshake))
}

async fn admin_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let handshake = handshake_from(&params, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, Room::Admin, handshake))
}

/// Captures query parameters and every header that is valid UTF-8.
fn handshake_from(params: &HashMap<String, String>, headers: &HeaderMap) -> Handshake {
    let mut handshake = Handshake::new();
    for (key, value) in params {
        handshake = handshake.with_query(key.as_str(), value.as_str());
    }
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            handshake = handshake.with_header(name.as_str(), value);
        }
    }
    handshake
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, room: Room, handshake: Handshake) {
    let id = ConnectionId::generate();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.outbound_buffer.max(1));
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if sink.send(Message::Text(text.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let frame = CloseFrame {
                        code: POLICY_VIOLATION,
                        reason: "unauthorized".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    if !state.hub.on_connect(room, id.clone(), &handshake, tx).await {
        let _ = writer.await;
        return;
    }
    info!(connection = %id, room = %room, "client connected");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => state.hub.on_message(room, &id, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection = %id, error = %e, "socket read failed");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    state.hub.on_disconnect(room, &id).await;
    writer.abort();
    info!(connection = %id, room = %room, "client disconnected");
}

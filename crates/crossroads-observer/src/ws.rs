//! `WebSocket` handler for the live simulation stream.
//!
//! Clients connect to `GET /simulation/ws?mode=telemetry|observation` and
//! receive one JSON object per update. Each connection is its own task
//! draining its own bounded queue in the [`FanOut`](crate::fanout::FanOut),
//! so a slow socket only ever delays itself.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use crossroads_types::StreamMode;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::fanout::Subscription;
use crate::state::AppState;

/// Query parameters for the streaming endpoint.
#[derive(Debug, serde::Deserialize)]
pub struct StreamQuery {
    /// Stream mode; the configured default when omitted.
    pub mode: Option<StreamMode>,
}

/// Upgrade an HTTP request to a `WebSocket` connection and begin
/// streaming.
///
/// # Route
///
/// `GET /simulation/ws`
pub async fn ws_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let mode = query
        .mode
        .unwrap_or(state.session.config().stream.default_mode);
    ws.on_upgrade(move |socket| handle_ws(socket, state, mode))
}

/// Forward the client's queue to the socket until either side goes away.
async fn handle_ws(socket: WebSocket, state: Arc<AppState>, mode: StreamMode) {
    let Subscription {
        id, mut updates, ..
    } = state.fanout.subscribe(mode);
    let (mut sender, mut receiver) = socket.split();
    debug!(subscription = %id, ?mode, "WebSocket client connected");

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(payload) = update else {
                    debug!(subscription = %id, "subscription closed by fan-out");
                    break;
                };
                if let Err(e) = sender.send(Message::Text(payload)).await {
                    debug!(subscription = %id, error = %e, "WebSocket client disconnected (send failed)");
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(subscription = %id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            debug!(subscription = %id, "WebSocket client disconnected (pong failed)");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(subscription = %id, error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Clients only listen; other frames are ignored.
                    }
                }
            }
        }
    }

    state.fanout.unsubscribe(id);
}

//! Axum router construction for the Observer API.
//!
//! Assembles all routes (status, control, `WebSocket`) into a single
//! [`Router`] with CORS and request tracing enabled.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{control, handlers, ws};

/// Build the complete Axum router for the Observer server.
///
/// The router includes:
/// - `GET /` -- minimal HTML status page
/// - `GET /simulation/status`, `GET /simulation/details` -- reads
/// - `POST /simulation/{start,stop,step,run,pause,resume,toggle_pause,reconnect,signal}`
/// - `GET /simulation/ws` -- `WebSocket` stream
///
/// CORS allows any origin so a browser debugger served elsewhere can
/// connect.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Status page
        .route("/", get(handlers::index))
        // Reads
        .route("/simulation/status", get(handlers::status))
        .route("/simulation/details", get(handlers::details))
        // Control
        .route("/simulation/start", post(control::start))
        .route("/simulation/stop", post(control::stop))
        .route("/simulation/step", post(control::step))
        .route("/simulation/run", post(control::run))
        .route("/simulation/pause", post(control::pause))
        .route("/simulation/resume", post(control::resume))
        .route("/simulation/toggle_pause", post(control::toggle_pause))
        .route("/simulation/reconnect", post(control::reconnect))
        .route("/simulation/signal", post(control::signal))
        // WebSocket
        .route("/simulation/ws", get(ws::ws_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

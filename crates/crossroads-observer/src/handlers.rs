//! Read-only endpoint handlers for the Observer server.
//!
//! Every handler reads the session's status board or configuration; none
//! touches the control connection, so reads never wait on a tick.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Minimal HTML status page |
//! | `GET` | `/simulation/status` | Session status plus client count |
//! | `GET` | `/simulation/details` | Simulator configuration in use |

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{Html, IntoResponse};
use crossroads_core::status::SessionStatus;

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Body of `GET /simulation/status`.
#[derive(Debug, serde::Serialize)]
pub struct StatusResponse {
    /// Session status fields, flattened.
    #[serde(flatten)]
    pub status: SessionStatus,
    /// Whether a simulator process is owned.
    pub running: bool,
    /// Connected streaming clients.
    pub clients: usize,
    /// Stream updates dropped on full client queues.
    pub dropped_updates: u64,
}

/// Body of `GET /simulation/details`.
#[derive(Debug, serde::Serialize)]
pub struct DetailsResponse {
    /// Scenario file passed to the simulator.
    pub config_file: String,
    /// Control port.
    pub port: u16,
    /// Control host.
    pub host: String,
    /// Headless binary.
    pub binary: String,
    /// Graphical binary.
    pub gui_binary: String,
    /// Default simulated seconds per tick.
    pub step_length: f64,
    /// Default continuous-run interval.
    pub target_interval_ms: u64,
}

// ---------------------------------------------------------------------------
// GET / -- minimal HTML status page
// ---------------------------------------------------------------------------

/// Serve a minimal HTML page showing session status and API links.
pub async fn index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.session.status();
    let session_state = status.state.label().to_uppercase();
    let pid = status
        .pid
        .map_or_else(|| String::from("-"), |p| p.to_string());
    let port = status.port;
    let tick = status.tick;
    let simulation_time = status.simulation_time;
    let message = status.message;
    let clients = state.fanout.client_count();

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Crossroads Observer</title>
    <style>
        body {{
            background: #0d1117;
            color: #c9d1d9;
            font-family: 'Cascadia Code', 'Fira Code', 'Consolas', monospace;
            padding: 2rem;
            max-width: 800px;
            margin: 0 auto;
        }}
        h1 {{ color: #58a6ff; margin-bottom: 0.25rem; }}
        .subtitle {{ color: #8b949e; margin-top: 0; }}
        .metric {{
            display: inline-block;
            background: #161b22;
            border: 1px solid #30363d;
            border-radius: 6px;
            padding: 1rem 1.5rem;
            margin: 0.5rem 0.5rem 0.5rem 0;
            min-width: 120px;
        }}
        .metric .label {{ color: #8b949e; font-size: 0.85rem; }}
        .metric .value {{ color: #58a6ff; font-size: 1.5rem; font-weight: bold; }}
        ul {{ list-style: none; padding: 0; }}
        li {{ padding: 0.3rem 0; }}
        .status {{ color: #3fb950; font-weight: bold; }}
        hr {{ border: none; border-top: 1px solid #30363d; margin: 1.5rem 0; }}
    </style>
</head>
<body>
    <h1>Crossroads Observer</h1>
    <p class="subtitle">Traffic simulation orchestrator</p>

    <p>State: <span class="status">{session_state}</span> -- {message}</p>

    <div>
        <div class="metric">
            <div class="label">PID</div>
            <div class="value">{pid}</div>
        </div>
        <div class="metric">
            <div class="label">Port</div>
            <div class="value">{port}</div>
        </div>
        <div class="metric">
            <div class="label">Tick</div>
            <div class="value">{tick}</div>
        </div>
        <div class="metric">
            <div class="label">Sim time (s)</div>
            <div class="value">{simulation_time:.1}</div>
        </div>
        <div class="metric">
            <div class="label">Clients</div>
            <div class="value">{clients}</div>
        </div>
    </div>

    <hr>

    <h2>API Endpoints</h2>
    <ul>
        <li>GET <a href="/simulation/status">/simulation/status</a> -- Session status</li>
        <li>GET <a href="/simulation/details">/simulation/details</a> -- Simulator configuration</li>
        <li>POST /simulation/start -- Launch and connect</li>
        <li>POST /simulation/stop -- Stop and terminate</li>
        <li>POST /simulation/step?steps=N -- Advance N ticks</li>
        <li>POST /simulation/run -- Start continuous pacing</li>
        <li>POST /simulation/pause, /simulation/resume, /simulation/toggle_pause</li>
        <li>POST /simulation/reconnect -- Reconnect an errored session</li>
        <li>POST /simulation/signal -- Apply a traffic light action</li>
    </ul>

    <h2>WebSocket</h2>
    <ul>
        <li><code>ws://host:port/simulation/ws?mode=telemetry|observation</code> -- Live stream</li>
    </ul>
</body>
</html>"#
    ))
}

// ---------------------------------------------------------------------------
// GET /simulation/status
// ---------------------------------------------------------------------------

/// Current session status, including the live client count.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let status = state.session.status();
    Json(StatusResponse {
        running: status.running(),
        clients: state.fanout.client_count(),
        dropped_updates: state.fanout.dropped_updates(),
        status,
    })
}

// ---------------------------------------------------------------------------
// GET /simulation/details
// ---------------------------------------------------------------------------

/// Simulator configuration the session launches with.
pub async fn details(State(state): State<Arc<AppState>>) -> Json<DetailsResponse> {
    let config = state.session.config();
    Json(DetailsResponse {
        config_file: config.simulator.config_file.clone(),
        port: config.simulator.port,
        host: config.simulator.host.clone(),
        binary: config.simulator.binary.clone(),
        gui_binary: config.simulator.gui_binary.clone(),
        step_length: config.simulator.step_length,
        target_interval_ms: config.pacing.target_interval_ms,
    })
}

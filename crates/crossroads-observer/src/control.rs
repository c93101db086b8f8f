//! Control endpoint handlers: the HTTP face of the session lifecycle.
//!
//! Bodies and queries are validated with [`validator`] before they reach
//! the session. Session failures map to status codes in
//! [`ObserverError`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/simulation/start` | Launch and connect |
//! | `POST` | `/simulation/stop` | Stop pacing, terminate the simulator |
//! | `POST` | `/simulation/step?steps=N` | Advance up to N ticks |
//! | `POST` | `/simulation/run` | Start the continuous pacing loop |
//! | `POST` | `/simulation/pause` | Close the pause gate |
//! | `POST` | `/simulation/resume` | Open the pause gate |
//! | `POST` | `/simulation/toggle_pause` | Flip the pause gate |
//! | `POST` | `/simulation/reconnect` | Reconnect an errored session |
//! | `POST` | `/simulation/signal` | Apply a traffic light action |

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use crossroads_core::session::SignalAction;
use crossroads_core::supervisor::LaunchOptions;
use tracing::info;
use validator::Validate;

use crate::error::ObserverError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Request body for `POST /simulation/start`. Every field is optional.
#[derive(Debug, Default, serde::Deserialize, Validate)]
#[serde(default)]
pub struct StartRequest {
    /// Launch the graphical simulator.
    pub use_gui: bool,
    /// Simulated seconds per tick.
    #[validate(range(min = 0.001, max = 3600.0))]
    pub step_length: Option<f64>,
    /// GUI only: start without waiting for the play button.
    pub autostart: Option<bool>,
    /// GUI only: visualization delay in milliseconds.
    #[validate(range(max = 10_000))]
    pub gui_delay_ms: Option<u64>,
}

/// Query for `POST /simulation/step`.
#[derive(Debug, serde::Deserialize, Validate)]
pub struct StepQuery {
    /// Ticks to advance.
    #[serde(default = "default_steps")]
    #[validate(range(min = 1, max = 1000))]
    pub steps: u32,
}

const fn default_steps() -> u32 {
    1
}

/// Request body for `POST /simulation/run`.
#[derive(Debug, Default, serde::Deserialize, Validate)]
#[serde(default)]
pub struct RunRequest {
    /// Wall-clock interval per tick; the configured default when omitted.
    #[validate(range(min = 5, max = 60_000))]
    pub target_interval_ms: Option<u64>,
}

/// Traffic light action names accepted by `POST /simulation/signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalActionKind {
    /// Do nothing.
    Hold,
    /// Switch to `phase`.
    SwitchTo,
    /// Lengthen the current phase.
    Extend,
    /// Shorten the current phase.
    Shorten,
}

/// Request body for `POST /simulation/signal`.
#[derive(Debug, serde::Deserialize, Validate)]
pub struct SignalRequest {
    /// Target signal; the configured observation signal when omitted.
    #[validate(length(min = 1, max = 128))]
    pub signal_id: Option<String>,
    /// What to do.
    pub action: SignalActionKind,
    /// Phase index for `switch_to`.
    #[validate(range(min = 0))]
    pub phase: Option<i32>,
}

// ---------------------------------------------------------------------------
// POST /simulation/start
// ---------------------------------------------------------------------------

/// Launch the simulator and connect to it.
///
/// An absent body launches headless with configured defaults.
pub async fn start(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartRequest>>,
) -> Result<impl IntoResponse, ObserverError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    request.validate()?;

    let defaults = LaunchOptions::from_config(&state.session.config().simulator);
    let options = LaunchOptions {
        use_gui: request.use_gui,
        step_length: request.step_length.unwrap_or(defaults.step_length),
        autostart: request.autostart.unwrap_or(defaults.autostart),
        gui_delay_ms: request.gui_delay_ms.unwrap_or(defaults.gui_delay_ms),
    };

    let started = state.session.start(options).await?;
    Ok(Json(serde_json::json!({
        "status": state.session.status().state,
        "session_id": started.session_id,
        "pid": started.pid,
        "port": started.port,
    })))
}

// ---------------------------------------------------------------------------
// POST /simulation/stop
// ---------------------------------------------------------------------------

/// Stop the session and terminate the simulator.
pub async fn stop(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ObserverError> {
    state.session.stop().await?;
    Ok(Json(serde_json::json!({
        "status": state.session.status().state,
    })))
}

// ---------------------------------------------------------------------------
// POST /simulation/step
// ---------------------------------------------------------------------------

/// Advance up to `steps` ticks. Executes none while paused.
pub async fn step(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StepQuery>,
) -> Result<impl IntoResponse, ObserverError> {
    query.validate()?;
    let executed = state.session.step(query.steps).await?;
    Ok(Json(serde_json::json!({
        "status": state.session.status().state,
        "executed_count": executed,
    })))
}

// ---------------------------------------------------------------------------
// POST /simulation/run
// ---------------------------------------------------------------------------

/// Start the continuous pacing loop.
pub async fn run(
    State(state): State<Arc<AppState>>,
    body: Option<Json<RunRequest>>,
) -> Result<impl IntoResponse, ObserverError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    request.validate()?;

    let interval_ms = request
        .target_interval_ms
        .unwrap_or(state.session.config().pacing.target_interval_ms);
    state
        .session
        .run(Duration::from_millis(interval_ms))
        .await?;
    Ok(Json(serde_json::json!({
        "status": state.session.status().state,
        "target_interval_ms": interval_ms,
    })))
}

// ---------------------------------------------------------------------------
// POST /simulation/pause, /simulation/resume, /simulation/toggle_pause
// ---------------------------------------------------------------------------

fn paused_response(state: &AppState, paused: bool) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": state.session.status().state,
        "paused": paused,
    }))
}

/// Close the pause gate.
pub async fn pause(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ObserverError> {
    let paused = state.session.pause()?;
    Ok(paused_response(&state, paused))
}

/// Open the pause gate.
pub async fn resume(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ObserverError> {
    let paused = state.session.resume()?;
    Ok(paused_response(&state, paused))
}

/// Flip the pause gate.
pub async fn toggle_pause(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ObserverError> {
    let paused = state.session.toggle_pause()?;
    Ok(paused_response(&state, paused))
}

// ---------------------------------------------------------------------------
// POST /simulation/reconnect
// ---------------------------------------------------------------------------

/// Re-establish the control connection of an errored session.
pub async fn reconnect(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ObserverError> {
    state.session.reconnect().await?;
    Ok(Json(serde_json::json!({
        "status": state.session.status().state,
    })))
}

// ---------------------------------------------------------------------------
// POST /simulation/signal
// ---------------------------------------------------------------------------

/// Apply a traffic light action.
pub async fn signal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignalRequest>,
) -> Result<impl IntoResponse, ObserverError> {
    body.validate()?;
    let observation = &state.session.config().observation;
    let signal_id = body
        .signal_id
        .or_else(|| observation.signal_id.clone())
        .ok_or_else(|| ObserverError::InvalidRequest(String::from("signal_id is required")))?;

    let action = match body.action {
        SignalActionKind::Hold => SignalAction::Hold,
        SignalActionKind::Extend => SignalAction::Extend,
        SignalActionKind::Shorten => SignalAction::Shorten,
        SignalActionKind::SwitchTo => {
            let phase = body
                .phase
                .ok_or_else(|| ObserverError::InvalidRequest(String::from("switch_to needs a phase")))?;
            if u32::try_from(phase).is_ok_and(|p| p >= observation.num_phases) {
                return Err(ObserverError::InvalidRequest(format!(
                    "phase {phase} is outside 0..{}",
                    observation.num_phases
                )));
            }
            SignalAction::SwitchTo(phase)
        }
    };

    let outcome = state.session.apply_signal_action(&signal_id, action).await?;
    info!(signal_id = %outcome.signal_id, ?action, "signal action requested over HTTP");
    Ok(Json(serde_json::json!({
        "status": state.session.status().state,
        "signal_id": outcome.signal_id,
        "phase": outcome.phase,
        "duration": outcome.duration,
    })))
}

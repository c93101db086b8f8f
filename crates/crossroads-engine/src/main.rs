//! Crossroads engine binary.
//!
//! Wires the session, the streaming fan-out, and the Observer server
//! together, then waits for a termination signal.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `crossroads-config.yaml` (or the path in
//!    `CROSSROADS_CONFIG`) and apply environment overrides
//! 2. Initialize structured logging (tracing)
//! 3. Validate configuration
//! 4. Build the session with the real process launcher and control
//!    connector
//! 5. Start the Observer API server
//! 6. Wait for SIGINT or SIGTERM, stop the session, drain the server

mod error;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossroads_core::config::{CrossroadsConfig, LoggingConfig};
use crossroads_core::session::SessionError;
use crossroads_core::supervisor::ProcessLauncher;
use crossroads_observer::server::ServerConfig;
use crossroads_observer::startup::spawn_observer;
use crossroads_observer::state::AppState;
use crossroads_traci::TcpConnector;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "crossroads-config.yaml";

/// Application entry point for the Crossroads engine.
///
/// # Errors
///
/// Returns an error if configuration is invalid, the observer cannot
/// bind, or signal handlers cannot be installed.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let (config, config_path) = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging)?;
    info!(path = %config_path.display(), "crossroads-engine starting");

    // 3. Validate.
    config.validate().map_err(EngineError::from)?;
    info!(
        binary = config.simulator.binary,
        config_file = config.simulator.config_file,
        control_port = config.simulator.port,
        step_length = config.simulator.step_length,
        target_interval_ms = config.pacing.target_interval_ms,
        "Configuration loaded"
    );

    // 4. Build the session.
    let connector = TcpConnector::new(
        config.simulator.host.clone(),
        Duration::from_millis(config.simulator.io_timeout_ms),
    );
    let server_config = ServerConfig::from(&config.observer);
    let state = Arc::new(AppState::new(
        config,
        Arc::new(ProcessLauncher),
        Arc::new(connector),
    ));

    // 5. Start the Observer API server.
    let shutdown = CancellationToken::new();
    let observer = spawn_observer(&server_config, Arc::clone(&state), shutdown.clone())
        .await
        .map_err(EngineError::from)?;
    info!(
        host = %server_config.host,
        port = server_config.port,
        "Observer API server started"
    );

    // 6. Wait for termination.
    wait_for_termination().await.map_err(EngineError::from)?;
    info!("termination requested, shutting down");

    match state.session.stop().await {
        Ok(()) | Err(SessionError::NotRunning) => {}
        Err(e) => warn!(error = %e, "session stop reported an error"),
    }
    shutdown.cancel();
    if let Err(e) = observer.await {
        warn!(error = %e, "observer task ended abnormally");
    }

    info!("crossroads-engine shutdown complete");
    Ok(())
}

/// Load configuration from `CROSSROADS_CONFIG` or the default path.
///
/// A missing file falls back to defaults plus environment overrides, so
/// a deployment can be configured entirely through the environment.
fn load_config() -> Result<(CrossroadsConfig, PathBuf), EngineError> {
    let path = std::env::var_os("CROSSROADS_CONFIG")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    if path.exists() {
        let config = CrossroadsConfig::from_file(&path)?;
        Ok((config, path))
    } else {
        let mut config = CrossroadsConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok((config, path))
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`.
fn init_logging(logging: &LoggingConfig) -> Result<(), EngineError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if logging.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| EngineError::Logging {
        message: e.to_string(),
    })
}

/// Resolve once SIGINT (ctrl-c) or SIGTERM arrives.
async fn wait_for_termination() -> Result<(), std::io::Error> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

//! Observer server startup helper for embedding in the engine binary.
//!
//! [`spawn_observer`] binds the listening socket on the caller's task, so
//! a taken port is reported before anything else starts, and then serves
//! on a background task together with the fan-out's pause notifier.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::server::{self, ServerConfig, ServerError};
use crate::state::AppState;

/// Errors that can occur when spawning the Observer server.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The server failed to bind or start.
    #[error("server start error: {0}")]
    Server(#[from] ServerError),
}

/// Spawn the Observer HTTP server on a background Tokio task.
///
/// Returns a [`JoinHandle`] that completes once `shutdown` fires and the
/// server has drained in-flight requests.
///
/// # Errors
///
/// Returns [`StartupError::Server`] if the server cannot bind to the
/// requested address.
pub async fn spawn_observer(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, StartupError> {
    let listener = server::bind(config).await?;
    let notifier = Arc::clone(&state.fanout).watch_gate(shutdown.clone());

    let handle = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, state, shutdown).await {
            tracing::error!(error = %e, "Observer server exited with error");
        }
        if let Err(e) = notifier.await {
            tracing::debug!(error = %e, "pause notifier ended abnormally");
        }
    });

    tracing::info!(host = %config.host, port = config.port, "Observer server spawned on background task");

    Ok(handle)
}

//! Shared application state for the Observer API server.
//!
//! [`AppState`] pairs the orchestration [`Session`] with the streaming
//! [`FanOut`]. Control handlers call into the session; the status and
//! streaming endpoints read the session's status board and the fan-out.
//! Neither path ever holds a lock across a tick.

use std::sync::Arc;

use crossroads_core::config::CrossroadsConfig;
use crossroads_core::session::Session;
use crossroads_core::supervisor::Launcher;
use crossroads_traci::Connector;

use crate::fanout::FanOut;

/// Shared state for the Axum application.
///
/// Wrapped in [`Arc`] and injected via Axum's `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The single orchestration session.
    pub session: Arc<Session>,
    /// Live streaming clients.
    pub fanout: Arc<FanOut>,
}

impl AppState {
    /// Wire a session to a fresh fan-out that receives every tick.
    pub fn new(config: CrossroadsConfig, launcher: Arc<dyn Launcher>, connector: Arc<dyn Connector>) -> Self {
        let buffer = config.stream.client_buffer;
        let session = Session::new(config, launcher, connector);
        let fanout = Arc::new(FanOut::new(buffer, session.gate(), session.status_board()));
        let session = Arc::new(session.with_sink(Arc::clone(&fanout) as _));
        Self { session, fanout }
    }
}

//! The session's externally visible status.
//!
//! Lifecycle operations, the step pacer, and the process watcher all
//! write through one [`StatusBoard`]; readers (the HTTP status endpoint,
//! the fan-out's pause notices) take cheap clones without locking the
//! session.

use crossroads_types::{SessionId, SessionState};
use serde::Serialize;
use tokio::sync::watch;

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    /// Id of the current (or last) session, if one was ever started.
    pub session_id: Option<SessionId>,
    /// Lifecycle state.
    pub state: SessionState,
    /// Description of the last meaningful transition.
    pub message: String,
    /// Simulator process id while one is owned.
    pub pid: Option<u32>,
    /// Control port the session uses.
    pub port: u16,
    /// Whether the pause gate is closed.
    pub paused: bool,
    /// Ticks advanced since the session connected.
    pub tick: u64,
    /// Simulator clock after the last tick, in seconds.
    pub simulation_time: f64,
    /// Interval of the continuous run loop, while one is active.
    pub pacing_interval_ms: Option<u64>,
}

impl SessionStatus {
    /// Initial status for a session bound to `port`.
    pub fn idle(port: u16) -> Self {
        Self {
            session_id: None,
            state: SessionState::Stopped,
            message: String::from("stopped"),
            pid: None,
            port,
            paused: false,
            tick: 0,
            simulation_time: 0.0,
            pacing_interval_ms: None,
        }
    }

    /// Whether a simulator process is owned right now. This includes an
    /// errored session whose process is still alive and a process that
    /// survived a stop request.
    pub const fn running(&self) -> bool {
        self.pid.is_some()
    }
}

/// Single-writer-at-a-time, many-reader status cell.
#[derive(Debug)]
pub struct StatusBoard {
    tx: watch::Sender<SessionStatus>,
}

impl StatusBoard {
    /// Board starting in [`SessionStatus::idle`].
    pub fn new(port: u16) -> Self {
        Self {
            tx: watch::Sender::new(SessionStatus::idle(port)),
        }
    }

    /// Current status.
    pub fn current(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.tx.borrow().state
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    /// Move to `state` with a message.
    pub fn transition(&self, state: SessionState, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|s| {
            s.state = state;
            s.message = message;
        });
    }

    /// Move to `Errored` only if the session is currently connected.
    ///
    /// Background tasks use this so a failure racing a deliberate stop
    /// does not overwrite `Stopping`/`Stopped`. Returns whether the
    /// transition happened.
    pub fn fail_if_connected(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.tx.send_if_modified(|s| {
            if s.state.is_connected() {
                s.state = SessionState::Errored;
                s.message = message;
                s.pacing_interval_ms = None;
                true
            } else {
                false
            }
        })
    }

    /// Apply an arbitrary edit.
    pub fn update(&self, edit: impl FnOnce(&mut SessionStatus)) {
        self.tx.send_modify(edit);
    }

    /// Record a completed tick.
    pub fn record_tick(&self, tick: u64, simulation_time: f64) {
        self.tx.send_modify(|s| {
            s.tick = tick;
            s.simulation_time = simulation_time;
        });
    }
}

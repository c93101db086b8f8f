//! Observer API server for the Crossroads traffic orchestrator.
//!
//! This crate provides an Axum HTTP server that exposes:
//!
//! - **Control endpoints** (`/simulation/*`) for start, stop, step, run,
//!   pause, resume, reconnect, and traffic light actions
//! - **`WebSocket` endpoint** (`/simulation/ws`) streaming one JSON
//!   object per tick in telemetry or observation mode
//! - **Minimal HTML status page** (`GET /`)
//!
//! # Architecture
//!
//! The [`FanOut`] is the session's snapshot sink. Every streaming client
//! owns a bounded queue in it and a task that drains that queue into its
//! socket, so the tick path never waits on a client.
//!
//! [`FanOut`]: fanout::FanOut

pub mod control;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod router;
pub mod server;
pub mod startup;
pub mod state;
pub mod ws;

// Re-export primary types for convenience.
pub use fanout::FanOut;
pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::AppState;

//! Simulator supervision, pacing, and telemetry for Crossroads.
//!
//! This crate owns everything between "launch the simulator binary" and
//! "hand a snapshot to whoever is listening".
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `crossroads-config.yaml`
//!   into strongly-typed structs, plus environment overrides.
//! - [`supervisor`] -- Process launch, exit detection, and two-phase
//!   termination.
//! - [`connect`] -- Bounded-retry connection establishment and one-time
//!   subscription registration.
//! - [`gate`] -- The pause gate shared by the pacer and the fan-out.
//! - [`telemetry`] -- Snapshot assembly from the per-tick subscription
//!   cache, including edge aggregation.
//! - [`observation`] -- [`ObservationSource`] and JSON normalization of
//!   derived observations.
//! - [`pacer`] -- [`TickDriver`] and the paced run loop.
//! - [`status`] -- The externally visible session status.
//! - [`session`] -- [`Session`], the single orchestration value.
//!
//! [`ObservationSource`]: observation::ObservationSource
//! [`TickDriver`]: pacer::TickDriver
//! [`Session`]: session::Session

pub mod config;
pub mod connect;
pub mod gate;
pub mod observation;
pub mod pacer;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod telemetry;

//! Control-port protocol client for the traffic simulator.
//!
//! The simulator runs as a separate process and listens on a local TCP
//! port. This crate speaks its binary request/response protocol: the
//! version handshake, single-tick advance, variable reads and writes,
//! and per-object variable subscriptions whose values arrive with every
//! tick and are cached until the next one.
//!
//! The orchestration core never names the TCP types directly. It talks to
//! a [`ControlClient`] obtained from a [`Connector`], so tests can swap in
//! in-memory fakes.
//!
//! # Modules
//!
//! - [`codec`] -- Framing, typed values, status and subscription decoding
//! - [`constants`] -- Command, type, and variable identifiers
//! - [`domain`] -- Object domains and their command ids
//! - [`client`] -- [`TraciClient`] over `tokio::net::TcpStream`
//! - [`error`] -- [`ProtocolError`]

pub mod client;
pub mod codec;
pub mod constants;
pub mod domain;
pub mod error;

use async_trait::async_trait;

pub use client::{TcpConnector, TraciClient};
pub use codec::{TraciValue, VariableMap};
pub use domain::Domain;
pub use error::ProtocolError;

/// An established control connection to one simulator process.
///
/// Implementations are used from a single task at a time (`&mut self`);
/// the caller is responsible for serializing access.
#[async_trait]
pub trait ControlClient: Send {
    /// Advance the simulation by one tick and refresh the subscription
    /// cache. Returns the simulator clock after the tick, in seconds.
    async fn advance(&mut self) -> Result<f64, ProtocolError>;

    /// Subscribe to `variables` of object `id`. Values are delivered with
    /// every subsequent tick.
    async fn subscribe(&mut self, domain: Domain, id: &str, variables: &[u8]) -> Result<(), ProtocolError>;

    /// Cached subscription values for one object from the last tick.
    fn subscription(&self, domain: Domain, id: &str) -> Option<&VariableMap>;

    /// Ids of all objects in `domain`.
    async fn id_list(&mut self, domain: Domain) -> Result<Vec<String>, ProtocolError>;

    /// Number of vehicles currently in the network.
    async fn vehicle_count(&mut self) -> Result<u32, ProtocolError>;

    /// Switch a signal controller to phase `index` of its running program.
    async fn set_phase(&mut self, id: &str, index: i32) -> Result<(), ProtocolError>;

    /// Duration of the controller's active phase, in seconds.
    async fn phase_duration(&mut self, id: &str) -> Result<f64, ProtocolError>;

    /// Override the remaining duration of the controller's active phase.
    async fn set_phase_duration(&mut self, id: &str, seconds: f64) -> Result<(), ProtocolError>;

    /// Ask the simulator to end and close the socket. Idempotent.
    async fn close(&mut self) -> Result<(), ProtocolError>;
}

/// Opens [`ControlClient`] connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to a simulator listening on `port` and complete the
    /// handshake.
    async fn connect(&self, port: u16) -> Result<Box<dyn ControlClient>, ProtocolError>;
}

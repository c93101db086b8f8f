//! Tick driving: the shared single-tick path and the paced run loop.
//!
//! [`TickDriver`] owns the path from "advance the simulator" to "publish
//! a snapshot". Both the continuous loop ([`run_paced`]) and direct
//! stepping go through it, and its connection mutex guarantees that two
//! callers never have advances in flight at once.
//!
//! The loop follows the same shape every iteration:
//!
//! 1. Record the start time.
//! 2. Wait for the pause gate (the only place the loop suspends while paused).
//! 3. Advance one tick and build the snapshot.
//! 4. Publish it to the [`SnapshotSink`].
//! 5. Sleep whatever is left of the target interval, never a negative amount.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossroads_traci::ProtocolError;
use crossroads_types::{SessionId, Snapshot};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::connect::Connection;
use crate::gate::PauseGate;
use crate::observation::ObservationSource;
use crate::status::StatusBoard;
use crate::telemetry;

/// One tick's published output.
#[derive(Debug, Clone)]
pub struct TickUpdate {
    /// The freshly built snapshot.
    pub snapshot: Arc<Snapshot>,
    /// Normalized observation derived from it.
    pub observation: Arc<serde_json::Value>,
}

/// Receives every published tick.
///
/// Called on the ticking task; implementations must not block.
pub trait SnapshotSink: Send + Sync {
    /// Called once per successful tick.
    fn on_snapshot(&self, update: &TickUpdate);

    /// Called when a new session begins, before its first tick. Simulation
    /// time restarts from zero, so per-session delivery state must reset.
    fn on_session_start(&self, _session_id: SessionId) {}
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl SnapshotSink for NoOpSink {
    fn on_snapshot(&self, _update: &TickUpdate) {}
}

/// Serialized single-tick path for one connection.
pub struct TickDriver {
    connection: Mutex<Connection>,
    ticks: AtomicU64,
    sink: Arc<dyn SnapshotSink>,
    observation: Arc<dyn ObservationSource>,
    status: Arc<StatusBoard>,
}

impl core::fmt::Debug for TickDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TickDriver")
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TickDriver {
    /// Driver over an established connection.
    pub fn new(
        connection: Connection,
        sink: Arc<dyn SnapshotSink>,
        observation: Arc<dyn ObservationSource>,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            connection: Mutex::new(connection),
            ticks: AtomicU64::new(0),
            sink,
            observation,
            status,
        }
    }

    /// Continue tick numbering after `ticks`, for a driver that replaces
    /// one whose connection was lost.
    #[must_use]
    pub fn resuming_from(self, ticks: u64) -> Self {
        Self {
            ticks: AtomicU64::new(ticks),
            ..self
        }
    }

    /// Ticks advanced through this driver.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Advance one tick, build the snapshot, and publish it.
    pub async fn tick_once(&self) -> Result<Arc<Snapshot>, ProtocolError> {
        let mut connection = self.connection.lock().await;
        connection.ensure_registered().await?;
        let (client, topology) = connection.parts();
        let topology = topology
            .ok_or_else(|| ProtocolError::Malformed(String::from("subscriptions not registered")))?;

        let simulation_time = client.advance().await?;
        let tick = self.ticks.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let snapshot = Arc::new(telemetry::build_snapshot(client, topology, tick, simulation_time).await?);
        drop(connection);

        let observation = Arc::new(self.observation.observe(&snapshot).to_json());
        self.sink.on_snapshot(&TickUpdate {
            snapshot: Arc::clone(&snapshot),
            observation,
        });
        self.status.record_tick(tick, simulation_time);
        debug!(tick, simulation_time, vehicles = snapshot.vehicles, "tick published");
        Ok(snapshot)
    }

    /// Lock the connection for a non-tick request (signal control).
    /// Holding the guard blocks ticks.
    pub async fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().await
    }

    /// Close the control connection. Errors are logged, not returned.
    pub async fn close(&self) {
        let mut connection = self.connection.lock().await;
        if let Err(e) = connection.client_mut().close().await {
            debug!(error = %e, "control connection close failed");
        }
    }
}

/// Why [`run_paced`] returned.
#[derive(Debug)]
pub enum PacerExit {
    /// The cancellation token fired.
    Stopped,
    /// A tick failed; the session has been marked errored.
    Failed(ProtocolError),
}

/// Outcome of a paced run.
#[derive(Debug)]
pub struct PacerResult {
    /// Why the loop ended.
    pub exit: PacerExit,
    /// Ticks this loop advanced.
    pub total_ticks: u64,
}

/// Advance one tick per `interval` until cancelled or a tick fails.
pub async fn run_paced(
    driver: Arc<TickDriver>,
    gate: Arc<PauseGate>,
    interval: Duration,
    cancel: CancellationToken,
) -> PacerResult {
    let mut total_ticks: u64 = 0;
    info!(interval_ms = interval.as_millis(), "pacing loop starting");

    let exit = loop {
        if cancel.is_cancelled() {
            break PacerExit::Stopped;
        }
        let started = Instant::now();

        if !gate.is_open() {
            debug!("pacing loop waiting on pause gate");
        }
        if gate.wait_until_open(&cancel).await.is_err() {
            break PacerExit::Stopped;
        }

        if let Err(e) = driver.tick_once().await {
            error!(error = %e, tick = driver.ticks(), "tick failed, pacing loop stopping");
            driver.status.fail_if_connected(format!("simulation error: {e}"));
            break PacerExit::Failed(e);
        }
        total_ticks = total_ticks.saturating_add(1);

        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            tokio::select! {
                () = cancel.cancelled() => break PacerExit::Stopped,
                () = tokio::time::sleep(remaining) => {}
            }
        }
    };

    info!(total_ticks, exit = ?exit, "pacing loop ended");
    PacerResult { exit, total_ticks }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use crossroads_traci::{ControlClient, Domain, VariableMap};
    use crossroads_types::SessionState;

    use super::*;
    use crate::observation::PhaseQueueObservation;

    /// Client whose clock advances by one second per tick and which can
    /// be told to drop the connection.
    #[derive(Default)]
    pub(crate) struct SteppingClient {
        pub time: f64,
        pub fail_after: Option<u32>,
        pub advances: u32,
        pub cache: std::collections::HashMap<(Domain, String), VariableMap>,
    }

    #[async_trait]
    impl ControlClient for SteppingClient {
        async fn advance(&mut self) -> Result<f64, ProtocolError> {
            if self.fail_after.is_some_and(|n| self.advances >= n) {
                return Err(ProtocolError::lost("peer reset"));
            }
            self.advances = self.advances.saturating_add(1);
            self.time += 1.0;
            Ok(self.time)
        }
        async fn subscribe(&mut self, _d: Domain, _id: &str, _v: &[u8]) -> Result<(), ProtocolError> {
            Ok(())
        }
        fn subscription(&self, domain: Domain, id: &str) -> Option<&VariableMap> {
            self.cache.get(&(domain, id.to_owned()))
        }
        async fn id_list(&mut self, _domain: Domain) -> Result<Vec<String>, ProtocolError> {
            Ok(Vec::new())
        }
        async fn vehicle_count(&mut self) -> Result<u32, ProtocolError> {
            Ok(3)
        }
        async fn set_phase(&mut self, _id: &str, _index: i32) -> Result<(), ProtocolError> {
            Ok(())
        }
        async fn phase_duration(&mut self, _id: &str) -> Result<f64, ProtocolError> {
            Ok(30.0)
        }
        async fn set_phase_duration(&mut self, _id: &str, _s: f64) -> Result<(), ProtocolError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    /// Sink that records simulation times and session starts.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub times: StdMutex<Vec<f64>>,
        pub sessions: StdMutex<Vec<SessionId>>,
    }

    impl SnapshotSink for RecordingSink {
        fn on_snapshot(&self, update: &TickUpdate) {
            if let Ok(mut times) = self.times.lock() {
                times.push(update.snapshot.simulation_time);
            }
        }

        fn on_session_start(&self, session_id: SessionId) {
            if let Ok(mut sessions) = self.sessions.lock() {
                sessions.push(session_id);
            }
        }
    }

    fn driver(client: SteppingClient, sink: Arc<RecordingSink>) -> (Arc<TickDriver>, Arc<StatusBoard>) {
        let status = Arc::new(StatusBoard::new(8813));
        status.transition(SessionState::Running, "running");
        let observation = Arc::new(PhaseQueueObservation::from_config(&Default::default()));
        let driver = Arc::new(TickDriver::new(
            Connection::new(Box::new(client)),
            sink,
            observation,
            Arc::clone(&status),
        ));
        (driver, status)
    }

    #[tokio::test]
    async fn tick_once_publishes_increasing_times() {
        let sink = Arc::new(RecordingSink::default());
        let (driver, status) = driver(SteppingClient::default(), Arc::clone(&sink));
        driver.tick_once().await.unwrap();
        let snap = driver.tick_once().await.unwrap();
        assert_eq!(snap.tick, 2);
        assert_eq!(snap.vehicles, 3);
        assert_eq!(sink.times.lock().unwrap().len(), 2);
        assert_eq!(status.current().tick, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn paced_loop_holds_the_interval() {
        let sink = Arc::new(RecordingSink::default());
        let (driver, _status) = driver(SteppingClient::default(), Arc::clone(&sink));
        let gate = Arc::new(PauseGate::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_paced(
            Arc::clone(&driver),
            gate,
            Duration::from_millis(100),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();
        let result = task.await.unwrap();

        assert!(matches!(result.exit, PacerExit::Stopped));
        // Ticks at 0, 100, 200, 300, 400 ms.
        assert_eq!(result.total_ticks, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_gate_stops_ticking() {
        let sink = Arc::new(RecordingSink::default());
        let (driver, _status) = driver(SteppingClient::default(), Arc::clone(&sink));
        let gate = Arc::new(PauseGate::new());
        gate.set_closed();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_paced(
            Arc::clone(&driver),
            Arc::clone(&gate),
            Duration::from_millis(16),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(driver.ticks(), 0);

        gate.set_open();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(driver.ticks() >= 1);

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result.exit, PacerExit::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_ends_loop_and_errors_session() {
        let sink = Arc::new(RecordingSink::default());
        let client = SteppingClient {
            fail_after: Some(2),
            ..SteppingClient::default()
        };
        let (driver, status) = driver(client, Arc::clone(&sink));

        let result = run_paced(
            Arc::clone(&driver),
            Arc::new(PauseGate::new()),
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result.exit, PacerExit::Failed(ref e) if e.is_connection_lost()));
        assert_eq!(result.total_ticks, 2);
        assert_eq!(status.state(), SessionState::Errored);
    }
}

//! The orchestration session.
//!
//! [`Session`] is the one explicitly owned value that ties the pieces
//! together: it launches the simulator, establishes the control
//! connection, owns the pause gate, and drives ticks either one batch at
//! a time ([`Session::step`]) or continuously ([`Session::run`]).
//!
//! Lifecycle operations serialize on an internal mutex. Ticking does not
//! hold that mutex, so `stop` can always cancel a running batch or pacing
//! loop; cancellation is signalled through a token that is reachable
//! without the lock.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use crossroads_traci::{Connector, ControlClient, ProtocolError};
use crossroads_types::{SessionId, SessionState};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CrossroadsConfig;
use crate::connect::{self, ConnectError, RetryPolicy};
use crate::gate::PauseGate;
use crate::observation::{ObservationSource, PhaseQueueObservation};
use crate::pacer::{self, NoOpSink, PacerResult, SnapshotSink, TickDriver};
use crate::status::{SessionStatus, StatusBoard};
use crate::supervisor::{
    LaunchCommand, LaunchOptions, Launcher, ProcessExit, SimulatorProcess, SupervisorError,
};

/// Seconds added or removed by [`SignalAction::Extend`] and
/// [`SignalAction::Shorten`].
pub const PHASE_ADJUST_SECS: f64 = 5.0;

/// Lower bound for a shortened phase.
pub const MIN_PHASE_SECS: f64 = 5.0;

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A session is already active.
    #[error("a simulation is already running")]
    AlreadyRunning,

    /// The operation needs a connected session.
    #[error("no simulation is running")]
    NotRunning,

    /// The simulator could not be launched.
    #[error("startup failed: {0}")]
    Spawn(#[from] SupervisorError),

    /// The control connection could not be established.
    #[error("startup failed: {0}")]
    ConnectionFailed(#[from] ConnectError),

    /// The established connection failed.
    #[error("simulation error: {0}")]
    ConnectionLost(ProtocolError),

    /// The simulator rejected the request, or it conflicts with the
    /// current session.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::CommandFailed { description, .. } => Self::InvalidRequest(description),
            other => Self::ConnectionLost(other),
        }
    }
}

/// Result of a successful [`Session::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    /// Id of the new session.
    pub session_id: SessionId,
    /// Simulator process id.
    pub pid: Option<u32>,
    /// Control port.
    pub port: u16,
}

/// A traffic light control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Leave the signal alone.
    Hold,
    /// Switch to the given phase index.
    SwitchTo(i32),
    /// Lengthen the current phase by [`PHASE_ADJUST_SECS`].
    Extend,
    /// Shorten the current phase by [`PHASE_ADJUST_SECS`], never below
    /// [`MIN_PHASE_SECS`].
    Shorten,
}

/// What a signal action changed.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalOutcome {
    /// The signal acted on.
    pub signal_id: String,
    /// Phase switched to, if any.
    pub phase: Option<i32>,
    /// New phase duration in seconds, if changed.
    pub duration: Option<f64>,
}

/// Resources owned by a live session.
#[derive(Default)]
struct Inner {
    process: Option<Box<dyn SimulatorProcess>>,
    driver: Option<Arc<TickDriver>>,
    pacer: Option<JoinHandle<PacerResult>>,
    watcher: Option<JoinHandle<()>>,
}

impl Inner {
    const fn is_empty(&self) -> bool {
        self.process.is_none() && self.driver.is_none() && self.pacer.is_none()
    }
}

/// The single orchestration session.
pub struct Session {
    config: CrossroadsConfig,
    launcher: Arc<dyn Launcher>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn SnapshotSink>,
    observation: Arc<dyn ObservationSource>,
    gate: Arc<PauseGate>,
    status: Arc<StatusBoard>,
    cancel: StdMutex<CancellationToken>,
    inner: Mutex<Inner>,
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.status.state())
            .field("paused", &!self.gate.is_open())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// New stopped session. Snapshots are discarded until a sink is
    /// attached with [`Session::with_sink`]; observations default to
    /// [`PhaseQueueObservation`].
    pub fn new(config: CrossroadsConfig, launcher: Arc<dyn Launcher>, connector: Arc<dyn Connector>) -> Self {
        let observation = Arc::new(PhaseQueueObservation::from_config(&config.observation));
        let status = Arc::new(StatusBoard::new(config.simulator.port));
        Self {
            config,
            launcher,
            connector,
            sink: Arc::new(NoOpSink),
            observation,
            gate: Arc::new(PauseGate::new()),
            status,
            cancel: StdMutex::new(CancellationToken::new()),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Publish every tick to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the observation source.
    #[must_use]
    pub fn with_observation(mut self, observation: Arc<dyn ObservationSource>) -> Self {
        self.observation = observation;
        self
    }

    /// Loaded configuration.
    pub const fn config(&self) -> &CrossroadsConfig {
        &self.config
    }

    /// The pause gate, for readers that annotate output with it.
    pub fn gate(&self) -> Arc<PauseGate> {
        Arc::clone(&self.gate)
    }

    /// The status board.
    pub fn status_board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.status)
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status.current()
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn renew_token(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        fresh
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.pacing.stop_grace_ms)
    }

    /// Launch the simulator and connect to it.
    ///
    /// Refused with [`SessionError::AlreadyRunning`] while a session is
    /// active. An errored session is cleaned up first. On any failure
    /// the launched process is terminated before returning.
    pub async fn start(&self, options: LaunchOptions) -> Result<Started, SessionError> {
        let mut inner = self.inner.lock().await;
        if self.status.state().is_active() {
            warn!("start refused, a session is already active");
            return Err(SessionError::AlreadyRunning);
        }
        if !inner.is_empty() {
            info!("cleaning up previous session before start");
            self.cleanup(&mut inner).await;
        }
        if inner.process.as_ref().is_some_and(|p| p.is_alive()) {
            warn!("start refused, the previous simulator process is still alive");
            return Err(SupervisorError::AlreadyRunning.into());
        }

        let session_id = SessionId::new();
        let port = self.config.simulator.port;
        let cancel = self.renew_token();
        self.gate.set_open();
        self.sink.on_session_start(session_id);
        self.status.update(|s| {
            *s = SessionStatus::idle(port);
            s.session_id = Some(session_id);
            s.state = SessionState::Starting;
            s.message = String::from("starting");
        });
        info!(session_id = %session_id, use_gui = options.use_gui, port, "session starting");

        let command = LaunchCommand::build(&self.config.simulator, &options, port);
        let process = match self.launcher.spawn(&command) {
            Ok(process) => process,
            Err(e) => {
                error!(error = %e, "simulator launch failed");
                self.status
                    .transition(SessionState::Errored, format!("startup failed: {e}"));
                return Err(SessionError::Spawn(e));
            }
        };
        let pid = process.pid();
        self.status.update(|s| {
            s.pid = pid;
            s.state = SessionState::Connecting;
            s.message = String::from("connecting");
        });
        let exits = process.exit_watch();
        inner.process = Some(process);

        let policy = RetryPolicy::from_config(&self.config.connection);
        let connection = match connect::establish(self.connector.as_ref(), port, policy, &cancel).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "control connection failed, tearing down simulator");
                self.terminate_process(&mut inner).await;
                self.status.update(|s| {
                    s.state = SessionState::Errored;
                    s.message = format!("startup failed: {e}");
                    s.pid = None;
                });
                return Err(SessionError::ConnectionFailed(e));
            }
        };

        inner.driver = Some(Arc::new(TickDriver::new(
            connection,
            Arc::clone(&self.sink),
            Arc::clone(&self.observation),
            Arc::clone(&self.status),
        )));
        inner.watcher = Some(tokio::spawn(watch_process(
            exits,
            pid,
            Arc::clone(&self.status),
            cancel,
        )));
        self.status.transition(SessionState::Running, "running");
        info!(session_id = %session_id, pid, port, "session running");

        Ok(Started {
            session_id,
            pid,
            port,
        })
    }

    /// Stop pacing, close the connection, and terminate the simulator.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.token().cancel();
        let mut inner = self.inner.lock().await;
        if inner.is_empty() && self.status.state() == SessionState::Stopped {
            return Err(SessionError::NotRunning);
        }

        self.status.transition(SessionState::Stopping, "stopping");
        self.cleanup(&mut inner).await;
        self.gate.set_open();
        let lingering = inner.process.as_ref().and_then(|p| p.pid());
        self.status.update(|s| {
            s.state = SessionState::Stopped;
            s.message = String::from("stopped");
            s.pid = lingering;
            s.paused = false;
            s.pacing_interval_ms = None;
        });
        info!("session stopped");
        Ok(())
    }

    async fn cleanup(&self, inner: &mut Inner) {
        self.token().cancel();
        if let Some(pacer) = inner.pacer.take() {
            match pacer.await {
                Ok(result) => debug!(total_ticks = result.total_ticks, "pacing loop joined"),
                Err(e) => warn!(error = %e, "pacing task ended abnormally"),
            }
        }
        if let Some(driver) = inner.driver.take() {
            driver.close().await;
        }
        self.terminate_process(inner).await;
        if let Some(watcher) = inner.watcher.take() {
            watcher.abort();
        }
    }

    async fn terminate_process(&self, inner: &mut Inner) {
        if let Some(mut process) = inner.process.take() {
            if let Err(e) = process.terminate(self.grace()).await {
                error!(pid = process.pid(), error = %e, "simulator did not terminate cleanly");
                if process.is_alive() {
                    inner.process = Some(process);
                }
            }
        }
    }

    async fn connected_driver(&self) -> Result<Arc<TickDriver>, SessionError> {
        let inner = self.inner.lock().await;
        self.require_connected()?;
        inner.driver.clone().ok_or(SessionError::NotRunning)
    }

    /// Advance up to `count` ticks, one after another.
    ///
    /// Returns the number actually executed: zero when the gate is
    /// closed, fewer than `count` when it closes mid-batch or the session
    /// is stopped.
    pub async fn step(&self, count: u32) -> Result<u32, SessionError> {
        let driver = self.connected_driver().await?;
        if !self.gate.is_open() {
            debug!(requested = count, "step ignored while paused");
            return Ok(0);
        }

        let cancel = self.token();
        let mut executed: u32 = 0;
        while executed < count {
            if !self.gate.is_open() || cancel.is_cancelled() {
                break;
            }
            if let Err(e) = driver.tick_once().await {
                error!(error = %e, executed, "step failed");
                self.status.fail_if_connected(format!("simulation error: {e}"));
                return Err(e.into());
            }
            executed = executed.saturating_add(1);
        }
        debug!(requested = count, executed, "step batch finished");
        Ok(executed)
    }

    /// Start the continuous pacing loop at `interval` per tick.
    pub async fn run(&self, interval: Duration) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        self.require_connected()?;
        if inner.pacer.as_ref().is_some_and(|p| !p.is_finished()) {
            return Err(SessionError::InvalidRequest(String::from(
                "a run loop is already active",
            )));
        }
        let driver = inner.driver.clone().ok_or(SessionError::NotRunning)?;

        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        inner.pacer = Some(tokio::spawn(pacer::run_paced(
            driver,
            Arc::clone(&self.gate),
            interval,
            self.token(),
        )));
        self.status.update(|s| s.pacing_interval_ms = Some(interval_ms));
        info!(interval_ms, "continuous run started");
        Ok(())
    }

    fn require_connected(&self) -> Result<(), SessionError> {
        if self.status.state().is_connected() {
            Ok(())
        } else {
            Err(SessionError::NotRunning)
        }
    }

    fn publish_paused(&self, paused: bool) {
        self.status.update(|s| {
            match (paused, s.state) {
                (true, SessionState::Running) => {
                    s.state = SessionState::Paused;
                    s.message = String::from("paused");
                }
                (false, SessionState::Paused) => {
                    s.state = SessionState::Running;
                    s.message = String::from("running");
                }
                _ => {}
            }
            s.paused = paused;
        });
    }

    /// Close the gate. Idempotent. Returns the paused flag.
    pub fn pause(&self) -> Result<bool, SessionError> {
        self.require_connected()?;
        if self.gate.set_closed() {
            info!("session paused");
        }
        self.publish_paused(true);
        Ok(true)
    }

    /// Open the gate. Idempotent. Returns the paused flag.
    pub fn resume(&self) -> Result<bool, SessionError> {
        self.require_connected()?;
        if self.gate.set_open() {
            info!("session resumed");
        }
        self.publish_paused(false);
        Ok(false)
    }

    /// Flip the gate. Returns the new paused flag.
    pub fn toggle_pause(&self) -> Result<bool, SessionError> {
        self.require_connected()?;
        let paused = !self.gate.toggle();
        info!(paused, "pause toggled");
        self.publish_paused(paused);
        Ok(paused)
    }

    /// Re-establish the control connection of an errored session whose
    /// simulator is still alive.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        match self.status.state() {
            SessionState::Errored => {}
            state if state.is_active() => return Err(SessionError::AlreadyRunning),
            _ => return Err(SessionError::NotRunning),
        }
        if !inner.process.as_ref().is_some_and(|p| p.is_alive()) {
            return Err(SessionError::InvalidRequest(String::from(
                "the simulator process is no longer alive; stop and start again",
            )));
        }

        if let Some(pacer) = inner.pacer.take() {
            pacer.abort();
        }
        let resumed_ticks = match inner.driver.take() {
            Some(old) => {
                old.close().await;
                old.ticks()
            }
            None => 0,
        };

        let mut cancel = self.token();
        if cancel.is_cancelled() {
            cancel = self.renew_token();
        }
        self.status.transition(SessionState::Connecting, "reconnecting");
        let port = self.config.simulator.port;
        let policy = RetryPolicy::from_config(&self.config.connection);
        let connection = match connect::establish(self.connector.as_ref(), port, policy, &cancel).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "reconnect failed");
                self.status
                    .transition(SessionState::Errored, format!("reconnect failed: {e}"));
                return Err(SessionError::ConnectionFailed(e));
            }
        };

        inner.driver = Some(Arc::new(
            TickDriver::new(
                connection,
                Arc::clone(&self.sink),
                Arc::clone(&self.observation),
                Arc::clone(&self.status),
            )
            .resuming_from(resumed_ticks),
        ));
        let paused = !self.gate.is_open();
        let (state, message) = if paused {
            (SessionState::Paused, "paused")
        } else {
            (SessionState::Running, "running")
        };
        self.status.update(|s| {
            s.state = state;
            s.message = String::from(message);
            s.paused = paused;
            s.pacing_interval_ms = None;
        });
        info!(port, "control connection re-established");
        Ok(())
    }

    /// Apply a control action to the signal `signal_id`.
    ///
    /// Runs between ticks; a tick in flight finishes first.
    pub async fn apply_signal_action(
        &self,
        signal_id: &str,
        action: SignalAction,
    ) -> Result<SignalOutcome, SessionError> {
        let driver = self.connected_driver().await?;
        let mut connection = driver.connection().await;
        let result = apply_signal(connection.client_mut(), signal_id, action).await;
        drop(connection);

        match result {
            Ok((phase, duration)) => {
                info!(signal_id, ?action, ?phase, ?duration, "signal action applied");
                Ok(SignalOutcome {
                    signal_id: signal_id.to_owned(),
                    phase,
                    duration,
                })
            }
            Err(e) => {
                warn!(signal_id, ?action, error = %e, "signal action failed");
                if e.is_connection_lost() {
                    self.status.fail_if_connected(format!("simulation error: {e}"));
                }
                Err(e.into())
            }
        }
    }
}

async fn apply_signal(
    client: &mut dyn ControlClient,
    signal_id: &str,
    action: SignalAction,
) -> Result<(Option<i32>, Option<f64>), ProtocolError> {
    match action {
        SignalAction::Hold => Ok((None, None)),
        SignalAction::SwitchTo(phase) => {
            client.set_phase(signal_id, phase).await?;
            Ok((Some(phase), None))
        }
        SignalAction::Extend => {
            let next = client.phase_duration(signal_id).await? + PHASE_ADJUST_SECS;
            client.set_phase_duration(signal_id, next).await?;
            Ok((None, Some(next)))
        }
        SignalAction::Shorten => {
            let current = client.phase_duration(signal_id).await?;
            let next = (current - PHASE_ADJUST_SECS).max(MIN_PHASE_SECS);
            client.set_phase_duration(signal_id, next).await?;
            Ok((None, Some(next)))
        }
    }
}

/// Flip the session to `Errored` if the simulator exits while connected.
async fn watch_process(
    mut exits: watch::Receiver<Option<ProcessExit>>,
    pid: Option<u32>,
    status: Arc<StatusBoard>,
    cancel: CancellationToken,
) {
    let exited = tokio::select! {
        () = cancel.cancelled() => false,
        r = exits.wait_for(Option::is_some) => r.is_ok(),
    };
    if !exited {
        return;
    }
    let description = exits
        .borrow()
        .as_ref()
        .map_or_else(|| String::from("unknown status"), |e| e.description.clone());
    status.update(|s| {
        if s.pid == pid {
            s.pid = None;
        }
    });
    if status.fail_if_connected(format!("simulator exited unexpectedly: {description}")) {
        error!(status = %description, "simulator exited unexpectedly");
        cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use crossroads_traci::{Domain, VariableMap};

    use super::*;
    use crate::connect::tests::ScriptedConnector;
    use crate::pacer::tests::{RecordingSink, SteppingClient};

    type ExitSender = Arc<watch::Sender<Option<ProcessExit>>>;

    struct FakeProcess {
        exit: ExitSender,
        terminated: Arc<AtomicU32>,
        stubborn: bool,
    }

    #[async_trait]
    impl SimulatorProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }
        fn is_alive(&self) -> bool {
            self.exit.borrow().is_none()
        }
        fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
            self.exit.subscribe()
        }
        async fn terminate(&mut self, _grace: Duration) -> Result<(), SupervisorError> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            if self.stubborn {
                return Err(SupervisorError::Signal {
                    pid: 4242,
                    reason: String::from("EPERM"),
                });
            }
            self.exit.send_replace(Some(ProcessExit {
                code: Some(0),
                description: String::from("terminated"),
            }));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        spawned: Arc<AtomicU32>,
        terminated: Arc<AtomicU32>,
        exits: StdMutex<Vec<ExitSender>>,
        stubborn: AtomicBool,
    }

    impl FakeLauncher {
        fn kill_last(&self) {
            let exits = self.exits.lock().unwrap();
            exits.last().unwrap().send_replace(Some(ProcessExit {
                code: Some(139),
                description: String::from("exit status: 139"),
            }));
        }
    }

    impl Launcher for FakeLauncher {
        fn spawn(&self, _command: &LaunchCommand) -> Result<Box<dyn SimulatorProcess>, SupervisorError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let exit = Arc::new(watch::Sender::new(None));
            self.exits.lock().unwrap().push(Arc::clone(&exit));
            Ok(Box::new(FakeProcess {
                exit,
                terminated: Arc::clone(&self.terminated),
                stubborn: self.stubborn.load(Ordering::SeqCst),
            }))
        }
    }

    struct SteppingConnector;

    #[async_trait]
    impl Connector for SteppingConnector {
        async fn connect(&self, _port: u16) -> Result<Box<dyn ControlClient>, ProtocolError> {
            Ok(Box::new(SteppingClient::default()))
        }
    }

    /// Hands out a connection that drops after two ticks, then healthy ones.
    #[derive(Default)]
    struct FlakyConnector {
        connects: AtomicU32,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _port: u16) -> Result<Box<dyn ControlClient>, ProtocolError> {
            let first = self.connects.fetch_add(1, Ordering::SeqCst) == 0;
            Ok(Box::new(SteppingClient {
                fail_after: first.then_some(2),
                ..SteppingClient::default()
            }))
        }
    }

    /// Client that closes the pause gate from inside its `close_after`th
    /// advance, as a concurrent pause request would.
    struct GateClosingClient {
        inner: SteppingClient,
        gate: Arc<PauseGate>,
        close_after: u32,
    }

    #[async_trait]
    impl ControlClient for GateClosingClient {
        async fn advance(&mut self) -> Result<f64, ProtocolError> {
            let time = self.inner.advance().await?;
            if self.inner.advances == self.close_after {
                self.gate.set_closed();
            }
            Ok(time)
        }
        async fn subscribe(&mut self, d: Domain, id: &str, v: &[u8]) -> Result<(), ProtocolError> {
            self.inner.subscribe(d, id, v).await
        }
        fn subscription(&self, domain: Domain, id: &str) -> Option<&VariableMap> {
            self.inner.subscription(domain, id)
        }
        async fn id_list(&mut self, domain: Domain) -> Result<Vec<String>, ProtocolError> {
            self.inner.id_list(domain).await
        }
        async fn vehicle_count(&mut self) -> Result<u32, ProtocolError> {
            self.inner.vehicle_count().await
        }
        async fn set_phase(&mut self, id: &str, index: i32) -> Result<(), ProtocolError> {
            self.inner.set_phase(id, index).await
        }
        async fn phase_duration(&mut self, id: &str) -> Result<f64, ProtocolError> {
            self.inner.phase_duration(id).await
        }
        async fn set_phase_duration(&mut self, id: &str, s: f64) -> Result<(), ProtocolError> {
            self.inner.set_phase_duration(id, s).await
        }
        async fn close(&mut self) -> Result<(), ProtocolError> {
            self.inner.close().await
        }
    }

    struct GateClosingConnector {
        gate: StdMutex<Option<Arc<PauseGate>>>,
        close_after: u32,
    }

    #[async_trait]
    impl Connector for GateClosingConnector {
        async fn connect(&self, _port: u16) -> Result<Box<dyn ControlClient>, ProtocolError> {
            let gate = self.gate.lock().unwrap().clone().unwrap();
            Ok(Box::new(GateClosingClient {
                inner: SteppingClient::default(),
                gate,
                close_after: self.close_after,
            }))
        }
    }

    fn session(launcher: Arc<FakeLauncher>, connector: Arc<dyn Connector>) -> Session {
        let mut config = CrossroadsConfig::default();
        config.simulator.config_file = String::from("cross.sumocfg");
        Session::new(config, launcher, connector)
    }

    fn headless() -> LaunchOptions {
        LaunchOptions::from_config(&CrossroadsConfig::default().simulator)
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_refused_without_spawning() {
        let launcher = Arc::new(FakeLauncher::default());
        let session = session(Arc::clone(&launcher), Arc::new(SteppingConnector));

        let started = session.start(headless()).await.unwrap();
        assert_eq!(started.pid, Some(4242));
        assert_eq!(session.status().state, SessionState::Running);

        let err = session.start(headless()).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRunning));
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn surviving_process_blocks_a_new_launch() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.stubborn.store(true, Ordering::SeqCst);
        let session = session(Arc::clone(&launcher), Arc::new(SteppingConnector));
        session.start(headless()).await.unwrap();

        session.stop().await.unwrap();
        let status = session.status();
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.pid, Some(4242));
        assert!(status.running());

        let err = session.start(headless()).await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(SupervisorError::AlreadyRunning)));
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_port_leaves_no_process() {
        let launcher = Arc::new(FakeLauncher::default());
        let connector = Arc::new(ScriptedConnector::refusing(u32::MAX));
        let calls = Arc::clone(&connector.calls);
        let session = session(Arc::clone(&launcher), connector);

        let err = session.start(headless()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ConnectionFailed(ConnectError::ConnectionFailed { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);

        let status = session.status();
        assert_eq!(status.state, SessionState::Errored);
        assert!(status.message.starts_with("startup failed"));
        assert_eq!(status.pid, None);
    }

    #[tokio::test(start_paused = true)]
    async fn step_while_paused_executes_nothing() {
        let launcher = Arc::new(FakeLauncher::default());
        let sink = Arc::new(RecordingSink::default());
        let session = session(launcher, Arc::new(SteppingConnector)).with_sink(sink.clone());
        session.start(headless()).await.unwrap();

        assert_eq!(session.step(3).await.unwrap(), 3);
        assert!(session.pause().unwrap());
        assert!(session.pause().unwrap());
        assert_eq!(session.status().state, SessionState::Paused);
        assert_eq!(session.step(10).await.unwrap(), 0);

        assert!(!session.resume().unwrap());
        assert_eq!(session.step(2).await.unwrap(), 2);
        assert_eq!(session.status().tick, 5);
        assert_eq!(*sink.times.lock().unwrap(), [1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_pause_follows_the_gate() {
        let launcher = Arc::new(FakeLauncher::default());
        let session = session(launcher, Arc::new(SteppingConnector));
        session.start(headless()).await.unwrap();

        assert!(session.toggle_pause().unwrap());
        assert!(!session.gate().is_open());
        assert!(!session.toggle_pause().unwrap());
        assert!(session.gate().is_open());
        assert_eq!(session.status().state, SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn process_death_errors_the_session() {
        let launcher = Arc::new(FakeLauncher::default());
        let session = session(Arc::clone(&launcher), Arc::new(SteppingConnector));
        session.start(headless()).await.unwrap();

        launcher.kill_last();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = session.status();
        assert_eq!(status.state, SessionState::Errored);
        assert!(status.message.contains("exited unexpectedly"));
        assert_eq!(status.pid, None);
        assert!(!status.running());
        assert!(matches!(
            session.reconnect().await,
            Err(SessionError::InvalidRequest(_))
        ));

        // Errored sessions can be started again after cleanup.
        session.start(headless()).await.unwrap();
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_terminates_and_resets() {
        let launcher = Arc::new(FakeLauncher::default());
        let session = session(Arc::clone(&launcher), Arc::new(SteppingConnector));
        session.start(headless()).await.unwrap();
        session.run(Duration::from_millis(100)).await.unwrap();
        assert!(matches!(
            session.run(Duration::from_millis(100)).await,
            Err(SessionError::InvalidRequest(_))
        ));
        tokio::time::sleep(Duration::from_millis(250)).await;

        session.stop().await.unwrap();
        let status = session.status();
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.pid, None);
        assert!(status.tick >= 2);
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);
        assert!(matches!(session.stop().await, Err(SessionError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_need_a_running_session() {
        let launcher = Arc::new(FakeLauncher::default());
        let session = session(launcher, Arc::new(SteppingConnector));
        assert!(matches!(session.step(1).await, Err(SessionError::NotRunning)));
        assert!(matches!(session.pause(), Err(SessionError::NotRunning)));
        assert!(matches!(
            session.run(Duration::from_millis(10)).await,
            Err(SessionError::NotRunning)
        ));
        assert!(matches!(session.reconnect().await, Err(SessionError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_actions_adjust_the_phase() {
        let launcher = Arc::new(FakeLauncher::default());
        let session = session(launcher, Arc::new(SteppingConnector));
        session.start(headless()).await.unwrap();

        let extended = session
            .apply_signal_action("J1", SignalAction::Extend)
            .await
            .unwrap();
        assert_eq!(extended.duration, Some(35.0));

        let shortened = session
            .apply_signal_action("J1", SignalAction::Shorten)
            .await
            .unwrap();
        assert_eq!(shortened.duration, Some(25.0));

        let switched = session
            .apply_signal_action("J1", SignalAction::SwitchTo(2))
            .await
            .unwrap();
        assert_eq!(switched.phase, Some(2));

        let held = session.apply_signal_action("J1", SignalAction::Hold).await.unwrap();
        assert_eq!((held.phase, held.duration), (None, None));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_closing_mid_batch_ends_the_batch_early() {
        let launcher = Arc::new(FakeLauncher::default());
        let connector = Arc::new(GateClosingConnector {
            gate: StdMutex::new(None),
            close_after: 3,
        });
        let sink = Arc::new(RecordingSink::default());
        let session = session(launcher, Arc::clone(&connector) as Arc<dyn Connector>).with_sink(sink.clone());
        *connector.gate.lock().unwrap() = Some(session.gate());
        session.start(headless()).await.unwrap();

        assert_eq!(session.step(10).await.unwrap(), 3);
        assert!(!session.gate().is_open());
        assert_eq!(session.status().tick, 3);
        assert_eq!(*sink.times.lock().unwrap(), [1.0, 2.0, 3.0]);
        assert_eq!(session.step(10).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_mid_batch_errors_the_session() {
        let launcher = Arc::new(FakeLauncher::default());
        let session = session(launcher, Arc::new(FlakyConnector::default()));
        session.start(headless()).await.unwrap();

        let err = session.step(5).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionLost(_)));

        let status = session.status();
        assert_eq!(status.state, SessionState::Errored);
        assert!(status.message.starts_with("simulation error"));
        assert_eq!(status.tick, 2);
        assert!(status.running());
        assert!(session.step(1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_ticking_on_a_fresh_connection() {
        let launcher = Arc::new(FakeLauncher::default());
        let connector = Arc::new(FlakyConnector::default());
        let sink = Arc::new(RecordingSink::default());
        let session = session(Arc::clone(&launcher), Arc::clone(&connector) as Arc<dyn Connector>)
            .with_sink(sink.clone());
        let started = session.start(headless()).await.unwrap();
        assert!(session.step(5).await.is_err());

        session.reconnect().await.unwrap();
        let status = session.status();
        assert_eq!(status.state, SessionState::Running);
        assert_eq!(status.session_id, Some(started.session_id));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        assert_eq!(session.step(2).await.unwrap(), 2);
        let status = session.status();
        assert_eq!(status.tick, 4);
        assert_eq!(status.simulation_time, 2.0);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(*sink.times.lock().unwrap(), [1.0, 2.0, 1.0, 2.0]);
        assert_eq!(sink.sessions.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_start_announces_its_session_to_the_sink() {
        let launcher = Arc::new(FakeLauncher::default());
        let sink = Arc::new(RecordingSink::default());
        let session = session(launcher, Arc::new(SteppingConnector)).with_sink(sink.clone());

        let first = session.start(headless()).await.unwrap();
        session.stop().await.unwrap();
        let second = session.start(headless()).await.unwrap();

        assert_eq!(*sink.sessions.lock().unwrap(), [first.session_id, second.session_id]);
    }

    #[test]
    fn command_failures_map_to_invalid_request() {
        let err = SessionError::from(ProtocolError::CommandFailed {
            command: 0xC2,
            description: String::from("Traffic light 'X' is not known"),
        });
        assert!(matches!(err, SessionError::InvalidRequest(ref d) if d.contains("not known")));
        let lost = SessionError::from(ProtocolError::lost("reset"));
        assert!(matches!(lost, SessionError::ConnectionLost(_)));
    }
}

//! Simulator process supervision.
//!
//! A [`Launcher`] turns a [`LaunchCommand`] into a running
//! [`SimulatorProcess`]. The process handle owns the child exclusively;
//! a background waiter publishes its exit through a watch channel so the
//! session can notice unexpected death without polling.
//!
//! Shutdown is two-phase: `SIGTERM`, then a forced kill if the process is
//! still alive when the grace period ends.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SimulatorConfig;

/// Errors raised while launching or stopping the simulator.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The binary could not be launched (missing binary, permissions).
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        /// The program that was executed.
        program: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A process is already alive for this session.
    #[error("a simulator process is already running")]
    AlreadyRunning,

    /// The stop signal could not be delivered.
    #[error("failed to signal simulator pid {pid}: {reason}")]
    Signal {
        /// Target process id.
        pid: u32,
        /// Why delivery failed.
        reason: String,
    },
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Human-readable description of the exit status.
    pub description: String,
}

/// Per-start launch choices made by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    /// Launch the graphical binary.
    pub use_gui: bool,
    /// Simulated seconds per tick.
    pub step_length: f64,
    /// GUI only: start running without waiting for the play button.
    pub autostart: bool,
    /// GUI only: visualization delay in milliseconds.
    pub gui_delay_ms: u64,
}

impl LaunchOptions {
    /// Options taken entirely from configuration, headless.
    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self {
            use_gui: false,
            step_length: config.step_length,
            autostart: config.autostart,
            gui_delay_ms: config.gui_delay_ms,
        }
    }
}

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Executable.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// Build the simulator command line for `port`.
    ///
    /// `-c <scenario> --remote-port <port> --step-length <secs>`, plus
    /// `--start` and `--delay <ms>` when launching the GUI.
    pub fn build(config: &SimulatorConfig, options: &LaunchOptions, port: u16) -> Self {
        let program = if options.use_gui {
            config.gui_binary.clone()
        } else {
            config.binary.clone()
        };
        let mut args = vec![
            String::from("-c"),
            config.config_file.clone(),
            String::from("--remote-port"),
            port.to_string(),
            String::from("--step-length"),
            options.step_length.to_string(),
        ];
        if options.use_gui {
            if options.autostart {
                args.push(String::from("--start"));
            }
            args.push(String::from("--delay"));
            args.push(options.gui_delay_ms.to_string());
        }
        Self { program, args }
    }
}

/// A running simulator owned by one session.
#[async_trait]
pub trait SimulatorProcess: Send + Sync {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Whether the process has not exited yet.
    fn is_alive(&self) -> bool;

    /// Receiver that flips to `Some` when the process exits.
    fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>>;

    /// Stop the process: graceful signal, then a forced kill after `grace`.
    /// Never waits longer than roughly `2 * grace`.
    async fn terminate(&mut self, grace: Duration) -> Result<(), SupervisorError>;
}

/// Starts simulator processes.
pub trait Launcher: Send + Sync {
    /// Launch `command`.
    fn spawn(&self, command: &LaunchCommand) -> Result<Box<dyn SimulatorProcess>, SupervisorError>;
}

// ---------------------------------------------------------------------------
// tokio::process implementation
// ---------------------------------------------------------------------------

/// Launches real child processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn spawn(&self, command: &LaunchCommand) -> Result<Box<dyn SimulatorProcess>, SupervisorError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, program = %command.program, args = ?command.args, "simulator launched");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }
        Ok(Box::new(ChildProcess::watch(child, pid)))
    }
}

async fn forward_output<R>(stream: R, channel: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "simulator", channel, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "simulator", channel, error = %e, "output stream closed");
                break;
            }
        }
    }
}

/// A child process plus the task that reaps it.
#[derive(Debug)]
struct ChildProcess {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ChildProcess {
    fn watch(mut child: Child, pid: Option<u32>) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(pid, error = %e, "forced kill failed");
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    description: status.to_string(),
                },
                Err(e) => ProcessExit {
                    code: None,
                    description: format!("wait failed: {e}"),
                },
            };
            info!(pid, status = %exit.description, "simulator exited");
            exit_tx.send_replace(Some(exit));
        });

        Self {
            pid,
            exit: exit_rx,
            kill: Some(kill_tx),
        }
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        let mut rx = self.exit.clone();
        tokio::time::timeout(limit, rx.wait_for(Option::is_some))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

#[async_trait]
impl SimulatorProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), SupervisorError> {
        if !self.is_alive() {
            return Ok(());
        }
        let signal_error = self.pid.and_then(|pid| send_sigterm(pid).err());
        if let Some(e) = &signal_error {
            warn!(pid = self.pid, error = %e, "graceful stop signal failed, escalating");
        }
        if signal_error.is_none() && self.wait_exit(grace).await {
            return Ok(());
        }

        warn!(pid = self.pid, grace_ms = grace.as_millis(), "simulator did not exit in time, killing");
        if let Some(kill) = self.kill.take()
            && kill.send(()).is_err()
        {
            debug!(pid = self.pid, "kill request not delivered, child reaper already finished");
        }
        if self.wait_exit(grace).await {
            Ok(())
        } else {
            Err(signal_error.unwrap_or_else(|| SupervisorError::Signal {
                pid: self.pid.unwrap_or_default(),
                reason: String::from("process still alive after forced kill"),
            }))
        }
    }
}

fn send_sigterm(pid: u32) -> Result<(), SupervisorError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|e| SupervisorError::Signal {
        pid,
        reason: e.to_string(),
    })?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| SupervisorError::Signal {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sim_config() -> SimulatorConfig {
        SimulatorConfig {
            config_file: String::from("cross.sumocfg"),
            ..SimulatorConfig::default()
        }
    }

    #[test]
    fn headless_command_line() {
        let config = sim_config();
        let options = LaunchOptions {
            use_gui: false,
            step_length: 0.5,
            autostart: true,
            gui_delay_ms: 200,
        };
        let cmd = LaunchCommand::build(&config, &options, 8813);
        assert_eq!(cmd.program, "sumo");
        assert_eq!(
            cmd.args,
            ["-c", "cross.sumocfg", "--remote-port", "8813", "--step-length", "0.5"]
        );
    }

    #[test]
    fn gui_command_line_adds_start_and_delay() {
        let config = sim_config();
        let options = LaunchOptions {
            use_gui: true,
            step_length: 1.0,
            autostart: true,
            gui_delay_ms: 100,
        };
        let cmd = LaunchCommand::build(&config, &options, 9000);
        assert_eq!(cmd.program, "sumo-gui");
        assert!(cmd.args.iter().any(|a| a == "--start"));
        assert_eq!(cmd.args.last().map(String::as_str), Some("100"));

        let no_autostart = LaunchOptions {
            autostart: false,
            ..options
        };
        let cmd = LaunchCommand::build(&config, &no_autostart, 9000);
        assert!(!cmd.args.iter().any(|a| a == "--start"));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let cmd = LaunchCommand {
            program: String::from("definitely-not-a-simulator-binary-4821"),
            args: Vec::new(),
        };
        let err = ProcessLauncher.spawn(&cmd).err().unwrap();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn terminate_stops_a_sleeping_child() {
        let cmd = LaunchCommand {
            program: String::from("sleep"),
            args: vec![String::from("30")],
        };
        let mut process = ProcessLauncher.spawn(&cmd).unwrap();
        assert!(process.is_alive());
        process.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_kill() {
        let cmd = LaunchCommand {
            program: String::from("sh"),
            args: vec![String::from("-c"), String::from("trap '' TERM; sleep 30")],
        };
        let mut process = ProcessLauncher.spawn(&cmd).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(process.is_alive());

        process.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(!process.is_alive());
        let exit = process.exit_watch().borrow().clone().unwrap();
        assert_eq!(exit.code, None);

        // A second request finds the reaper gone and still succeeds.
        process.terminate(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn exit_is_published() {
        let cmd = LaunchCommand {
            program: String::from("true"),
            args: Vec::new(),
        };
        let process = ProcessLauncher.spawn(&cmd).unwrap();
        let mut exit = process.exit_watch();
        let status = exit.wait_for(Option::is_some).await.unwrap().clone();
        assert_eq!(status.map(|s| s.code), Some(Some(0)));
        assert!(!process.is_alive());
    }
}

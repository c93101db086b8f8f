//! Configuration loading and typed config structures for Crossroads.
//!
//! The canonical configuration lives in `crossroads-config.yaml` at the
//! project root. This module defines strongly-typed structs that mirror the
//! YAML structure, a loader that applies environment overrides, and a
//! startup validation pass.

use std::path::Path;

use crossroads_types::StreamMode;
use serde::Deserialize;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A required setting is absent.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// A setting has an unusable value.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level orchestrator configuration.
///
/// Mirrors the structure of `crossroads-config.yaml`. Every section and
/// field has a default, so an empty document is valid YAML; [`validate`]
/// then rejects the settings that cannot be defaulted.
///
/// [`validate`]: CrossroadsConfig::validate
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CrossroadsConfig {
    /// How to launch the simulator.
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Control-port connection retry policy.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Step pacing and shutdown timing.
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Streaming fan-out settings.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Default observation vector settings.
    #[serde(default)]
    pub observation: ObservationConfig,

    /// HTTP/WebSocket server settings.
    #[serde(default)]
    pub observer: ObserverConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CrossroadsConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `SUMO_CONFIG_FILE` overrides `simulator.config_file`
    /// - `SUMO_PORT` overrides `simulator.port`
    /// - `SUMO_BINARY` overrides `simulator.binary`
    /// - `SUMO_GUI_BINARY` overrides `simulator.gui_binary`
    /// - `OBSERVER_PORT` overrides `observer.port`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if an override is not a valid port.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string and apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SUMO_CONFIG_FILE") {
            self.simulator.config_file = path;
        }
        if let Some(binary) = lookup("SUMO_BINARY") {
            self.simulator.binary = binary;
        }
        if let Some(binary) = lookup("SUMO_GUI_BINARY") {
            self.simulator.gui_binary = binary;
        }
        if let Some(port) = lookup("SUMO_PORT") {
            self.simulator.port = parse_port("simulator.port", &port)?;
        }
        if let Some(port) = lookup("OBSERVER_PORT") {
            self.observer.port = parse_port("observer.port", &port)?;
        }
        Ok(())
    }

    /// Reject settings the orchestrator cannot start without.
    ///
    /// A missing simulator config path or control port is fatal here, at
    /// startup, rather than surfacing later as a spawn failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulator.config_file.trim().is_empty() {
            return Err(ConfigError::Missing("simulator.config_file"));
        }
        if self.simulator.port == 0 {
            return Err(ConfigError::Missing("simulator.port"));
        }
        if !(self.simulator.step_length.is_finite() && self.simulator.step_length > 0.0) {
            return Err(ConfigError::Invalid {
                field: "simulator.step_length",
                reason: format!("must be a positive number, got {}", self.simulator.step_length),
            });
        }
        if self.connection.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "connection.max_attempts",
                reason: String::from("must be at least 1"),
            });
        }
        if self.stream.client_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "stream.client_buffer",
                reason: String::from("must be at least 1"),
            });
        }
        if self.observation.num_phases == 0 {
            return Err(ConfigError::Invalid {
                field: "observation.num_phases",
                reason: String::from("must be at least 1"),
            });
        }
        Ok(())
    }
}

fn parse_port(field: &'static str, raw: &str) -> Result<u16, ConfigError> {
    raw.trim().parse::<u16>().map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("`{raw}` is not a port: {e}"),
    })
}

/// Simulator launch configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulatorConfig {
    /// Headless simulator binary.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Graphical simulator binary.
    #[serde(default = "default_gui_binary")]
    pub gui_binary: String,

    /// Path to the simulation scenario file (`-c`). Required.
    #[serde(default)]
    pub config_file: String,

    /// Host the control port listens on.
    #[serde(default = "default_host")]
    pub host: String,

    /// Control port passed as `--remote-port`. Required.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Simulated seconds per tick (`--step-length`).
    #[serde(default = "default_step_length")]
    pub step_length: f64,

    /// Start the GUI without waiting for the play button.
    #[serde(default = "default_true")]
    pub autostart: bool,

    /// GUI visualization delay in milliseconds.
    #[serde(default)]
    pub gui_delay_ms: u64,

    /// Per-request timeout on the control connection.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            gui_binary: default_gui_binary(),
            config_file: String::new(),
            host: default_host(),
            port: default_port(),
            step_length: default_step_length(),
            autostart: true,
            gui_delay_ms: 0,
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

/// Connection establishment retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff; attempt `n` waits `n * base_delay_ms` afterwards.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Pacing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PacingConfig {
    /// Default wall-clock interval between ticks for continuous runs.
    #[serde(default = "default_target_interval_ms")]
    pub target_interval_ms: u64,

    /// Grace period between the stop signal and a forced kill.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            target_interval_ms: default_target_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

/// Streaming configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamConfig {
    /// Per-client queue depth; updates beyond it are dropped for that client.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,

    /// Mode used when a client does not ask for one.
    #[serde(default)]
    pub default_mode: StreamMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            client_buffer: default_client_buffer(),
            default_mode: StreamMode::default(),
        }
    }
}

/// Built-in observation vector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObservationConfig {
    /// Signal controller whose phase is encoded. Defaults to the first one.
    #[serde(default)]
    pub signal_id: Option<String>,

    /// Width of the phase one-hot.
    #[serde(default = "default_num_phases")]
    pub num_phases: u32,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            signal_id: None,
            num_phases: default_num_phases(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObserverConfig {
    /// Bind address.
    #[serde(default = "default_observer_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_observer_port")]
    pub port: u16,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            host: default_observer_host(),
            port: default_observer_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_binary() -> String {
    String::from("sumo")
}

fn default_gui_binary() -> String {
    String::from("sumo-gui")
}

fn default_host() -> String {
    String::from("127.0.0.1")
}

const fn default_port() -> u16 {
    8813
}

const fn default_step_length() -> f64 {
    1.0
}

const fn default_true() -> bool {
    true
}

const fn default_io_timeout_ms() -> u64 {
    10_000
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_target_interval_ms() -> u64 {
    1000
}

const fn default_stop_grace_ms() -> u64 {
    3000
}

const fn default_client_buffer() -> usize {
    32
}

const fn default_num_phases() -> u32 {
    4
}

fn default_observer_host() -> String {
    String::from("0.0.0.0")
}

const fn default_observer_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    String::from("info")
}

fn default_log_format() -> String {
    String::from("text")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn parse_without_env(yaml: &str) -> CrossroadsConfig {
        let mut config: CrossroadsConfig = serde_yml::from_str(yaml).unwrap();
        config.apply_overrides(no_env).unwrap();
        config
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_without_env("{}");
        assert_eq!(config.simulator.port, 8813);
        assert_eq!(config.simulator.binary, "sumo");
        assert_eq!(config.connection.max_attempts, 3);
        assert_eq!(config.connection.base_delay_ms, 500);
        assert_eq!(config.stream.default_mode, StreamMode::Telemetry);
        assert!(config.simulator.autostart);
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse_without_env(
            "simulator:\n  config_file: net/cross.sumocfg\n  port: 9000\n  step_length: 0.5\nstream:\n  default_mode: observation\n",
        );
        assert_eq!(config.simulator.config_file, "net/cross.sumocfg");
        assert_eq!(config.simulator.port, 9000);
        assert_eq!(config.simulator.step_length.to_bits(), 0.5_f64.to_bits());
        assert_eq!(config.stream.default_mode, StreamMode::Observation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("SUMO_CONFIG_FILE", "/tmp/a.sumocfg"),
            ("SUMO_PORT", "8900"),
            ("OBSERVER_PORT", "9100"),
        ]
        .into_iter()
        .collect();
        let mut config = parse_without_env("simulator:\n  config_file: b.sumocfg\n");
        config
            .apply_overrides(|k| env.get(k).map(|v| (*v).to_owned()))
            .unwrap();
        assert_eq!(config.simulator.config_file, "/tmp/a.sumocfg");
        assert_eq!(config.simulator.port, 8900);
        assert_eq!(config.observer.port, 9100);
    }

    #[test]
    fn bad_port_override_is_invalid() {
        let mut config = CrossroadsConfig::default();
        let err = config
            .apply_overrides(|k| (k == "SUMO_PORT").then(|| String::from("eighty")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "simulator.port", .. }));
    }

    #[test]
    fn missing_config_file_is_fatal() {
        let config = CrossroadsConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("simulator.config_file"))
        ));
    }

    #[test]
    fn zero_port_is_fatal() {
        let mut config = CrossroadsConfig::default();
        config.simulator.config_file = String::from("x.sumocfg");
        config.simulator.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Missing("simulator.port"))));
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = parse_without_env(include_str!("../../../crossroads-config.yaml"));
        assert_eq!(config.simulator.port, 8813);
        assert_eq!(config.pacing.stop_grace_ms, 3000);
        assert_eq!(config.observer.port, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_yaml_is_yaml_error() {
        let err = CrossroadsConfig::parse("simulator: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
    }
}

//! Enumeration types shared by the orchestrator, the observer API, and
//! streaming clients.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of the single orchestration session.
///
/// ```text
/// Stopped -> Starting -> Connecting -> Running <-> Paused
///                |            |           |          |
///                v            v           v          v
///             Errored      Errored     Errored    Errored
/// any active state -> Stopping -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No simulator process exists.
    Stopped,
    /// The simulator binary is being launched.
    Starting,
    /// The process is up; the control connection is being established.
    Connecting,
    /// Connected and free to tick.
    Running,
    /// Connected, but the pause gate is closed.
    Paused,
    /// A fatal failure occurred; the caller must stop or reconnect.
    Errored,
    /// Shutdown is in progress.
    Stopping,
}

impl SessionState {
    /// Whether a new start request must be refused in this state.
    ///
    /// `Running`, `Paused`, `Connecting`, and `Starting` all own (or are
    /// about to own) a simulator process.
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Connecting | Self::Running | Self::Paused
        )
    }

    /// Whether the session holds a usable control connection.
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Lower-case label used in status messages.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Errored => "errored",
            Self::Stopping => "stopping",
        }
    }
}

impl core::fmt::Display for SessionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// What a streaming client receives on every tick. Fixed at subscribe time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Raw entity groups, vehicle count and timestamp.
    #[default]
    Telemetry,
    /// The derived numeric observation consumed by the learning loop.
    Observation,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// The subscribed entity categories read every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    /// Point detectors (E1).
    InductionLoop,
    /// Lane area detectors (E2).
    LaneArea,
    /// Signal controllers.
    TrafficLight,
}

impl EntityCategory {
    /// Every category, in snapshot assembly order.
    pub const ALL: [Self; 3] = [Self::TrafficLight, Self::InductionLoop, Self::LaneArea];
}

/// Cardinal approach of an edge into the intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum CardinalDirection {
    /// Northern approach.
    N,
    /// Southern approach.
    S,
    /// Eastern approach.
    E,
    /// Western approach.
    W,
}

impl CardinalDirection {
    /// Parse the single-letter direction code used in network ids.
    pub const fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'N' => Some(Self::N),
            'S' => Some(Self::S),
            'E' => Some(Self::E),
            'W' => Some(Self::W),
            _ => None,
        }
    }

    /// The single-letter code.
    pub const fn letter(self) -> char {
        match self {
            Self::N => 'N',
            Self::S => 'S',
            Self::E => 'E',
            Self::W => 'W',
        }
    }
}

impl core::fmt::Display for CardinalDirection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

//! Wire format of the streaming channel.
//!
//! Every update pushed to a streaming client is one JSON object. The
//! common header (`timestamp`, `simulation_time`, `vehicles`, `message`,
//! `paused`) is always present; the body is either the raw entity groups
//! ([`StreamMode::Telemetry`]) or a single `observation` value
//! ([`StreamMode::Observation`]). Pause notices carry the header only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{CardinalDirection, StreamMode};
use crate::structs::{DetectorReading, EdgeAggregate, Snapshot, TrafficLightState};

/// One update delivered over the streaming channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StreamMessage {
    /// Wall-clock time of the underlying snapshot, fractional Unix seconds.
    pub timestamp: f64,
    /// Simulator clock of the underlying snapshot, in seconds.
    pub simulation_time: f64,
    /// Vehicles currently in the network.
    pub vehicles: u32,
    /// Human-readable description of the last session transition.
    pub message: String,
    /// Whether the pause gate was closed when this update was produced.
    pub paused: bool,
    /// Signal controllers keyed by id (telemetry mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub traffic_lights: Option<BTreeMap<String, TrafficLightState>>,
    /// Lane ids grouped by approach (telemetry mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub lanes: Option<BTreeMap<CardinalDirection, Vec<String>>>,
    /// Induction loop readings keyed by id (telemetry mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub e1_sensors: Option<BTreeMap<String, DetectorReading>>,
    /// Lane area readings keyed by id (telemetry mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub e2_sensors: Option<BTreeMap<String, DetectorReading>>,
    /// Lane area readings per approach edge (telemetry mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub e2_aggregated: Option<BTreeMap<CardinalDirection, EdgeAggregate>>,
    /// Normalized observation vector (observation mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub observation: Option<serde_json::Value>,
}

impl StreamMessage {
    /// Header-only message built from the snapshot's scalar fields.
    fn header(snapshot: &Snapshot, message: &str, paused: bool) -> Self {
        Self {
            timestamp: snapshot.unix_timestamp(),
            simulation_time: snapshot.simulation_time,
            vehicles: snapshot.vehicles,
            message: message.to_owned(),
            paused,
            traffic_lights: None,
            lanes: None,
            e1_sensors: None,
            e2_sensors: None,
            e2_aggregated: None,
            observation: None,
        }
    }

    /// Serialize a snapshot for a client in the given mode.
    ///
    /// `observation` is only consulted in [`StreamMode::Observation`]; a
    /// missing observation is sent as `null` so the client still sees the
    /// tick.
    pub fn for_mode(
        mode: StreamMode,
        snapshot: &Snapshot,
        observation: Option<&serde_json::Value>,
        message: &str,
        paused: bool,
    ) -> Self {
        let mut msg = Self::header(snapshot, message, paused);
        match mode {
            StreamMode::Telemetry => {
                msg.traffic_lights = Some(snapshot.traffic_lights.clone());
                msg.lanes = Some(snapshot.lanes.clone());
                msg.e1_sensors = Some(snapshot.e1_sensors.clone());
                msg.e2_sensors = Some(snapshot.e2_sensors.clone());
                msg.e2_aggregated = Some(snapshot.e2_aggregated.clone());
            }
            StreamMode::Observation => {
                msg.observation = Some(observation.cloned().unwrap_or(serde_json::Value::Null));
            }
        }
        msg
    }

    /// Pause notice. Repeats the last known scalars when a snapshot exists.
    pub fn notice(last: Option<&Snapshot>, message: &str, paused: bool) -> Self {
        last.map_or_else(
            || Self {
                timestamp: now_unix_seconds(),
                simulation_time: 0.0,
                vehicles: 0,
                message: message.to_owned(),
                paused,
                traffic_lights: None,
                lanes: None,
                e1_sensors: None,
                e2_sensors: None,
                e2_aggregated: None,
                observation: None,
            },
            |snapshot| Self::header(snapshot, message, paused),
        )
    }
}

#[allow(clippy::cast_precision_loss)]
fn now_unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

//! Per-entity telemetry records and the immutable per-tick [`Snapshot`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{CardinalDirection, EntityCategory};

// ---------------------------------------------------------------------------
// Sensor naming convention
// ---------------------------------------------------------------------------

/// Direction and lane parsed from a detector id such as `E2_W0` or `E1_N_2`.
///
/// The first `_`-separated segment is the detector kind prefix. The
/// segment after it starts with the cardinal letter of the approach; the
/// remaining characters (or, if none, the last segment) name the lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SensorDescriptor {
    /// Approach the detector sits on.
    pub direction: CardinalDirection,
    /// Lane label within the approach.
    pub lane: String,
}

impl SensorDescriptor {
    /// Parse a detector id. Returns `None` when the id does not follow the
    /// `<kind>_<dir><lane>` convention.
    pub fn parse(sensor_id: &str) -> Option<Self> {
        let mut parts = sensor_id.split('_');
        let _kind = parts.next()?;
        let segment = parts.next()?;
        let mut chars = segment.chars();
        let direction = CardinalDirection::from_letter(chars.next()?)?;
        let rest = chars.as_str();
        let lane = if rest.is_empty() {
            parts.next_back().unwrap_or_default()
        } else {
            rest
        };
        if lane.is_empty() {
            return None;
        }
        Some(Self {
            direction,
            lane: lane.to_owned(),
        })
    }

    /// Human-readable name such as `W-0`.
    pub fn readable_name(&self) -> String {
        format!("{}-{}", self.direction, self.lane)
    }
}

// ---------------------------------------------------------------------------
// Entity records
// ---------------------------------------------------------------------------

/// State of one signal controller for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TrafficLightState {
    /// Controller id.
    pub id: String,
    /// Signal string, one character per controlled link (e.g. `GGrrGGrr`).
    pub red_yellow_green_state: String,
    /// Index of the active phase within the running program.
    pub current_phase: i32,
    /// Configured duration of the active phase, in seconds.
    pub phase_duration: f64,
    /// Time already spent in the active phase, in seconds.
    pub spent_duration: f64,
    /// Absolute simulation time of the next scheduled switch, in seconds.
    pub next_switch: f64,
    /// Id of the running signal program.
    pub current_program: String,
}

/// Reading of one detector (induction loop or lane area) for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DetectorReading {
    /// Detector id.
    pub id: String,
    /// Vehicles seen during the last tick.
    pub vehicle_count: u32,
    /// Occupancy during the last tick, in percent.
    pub occupancy: f64,
    /// Mean speed of the vehicles seen during the last tick, in m/s.
    pub mean_speed: f64,
    /// Parsed approach/lane, when the id follows the naming convention.
    pub descriptor: Option<SensorDescriptor>,
}

/// Lane area readings rolled up per approach edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct EdgeAggregate {
    /// Approach the contributing sensors sit on.
    pub edge_id: CardinalDirection,
    /// Sum of vehicle counts across the edge's sensors.
    pub vehicle_count: u32,
    /// Average of the sensors' mean speeds.
    pub mean_speed: f64,
    /// Average of the sensors' occupancies.
    pub occupancy: f64,
    /// Number of sensors that contributed this tick.
    pub sensor_count: u32,
}

/// An entity that was left out of a snapshot because its read failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct OmittedEntity {
    /// Category of the entity.
    pub category: EntityCategory,
    /// Entity id.
    pub id: String,
    /// Why the read failed.
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable, timestamped read of simulator state for one tick.
///
/// Built once by the telemetry aggregator right after a successful
/// advance and then shared behind an `Arc`; the next tick supersedes it
/// with a fresh value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Snapshot {
    /// Number of ticks advanced in this session when the snapshot was taken.
    pub tick: u64,
    /// Simulator clock, in seconds.
    pub simulation_time: f64,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
    /// Vehicles currently in the network.
    pub vehicles: u32,
    /// Signal controllers keyed by id.
    pub traffic_lights: BTreeMap<String, TrafficLightState>,
    /// Induction loop readings keyed by id.
    pub e1_sensors: BTreeMap<String, DetectorReading>,
    /// Lane area readings keyed by id.
    pub e2_sensors: BTreeMap<String, DetectorReading>,
    /// Lane area readings aggregated per approach edge.
    pub e2_aggregated: BTreeMap<CardinalDirection, EdgeAggregate>,
    /// Lane ids grouped by approach. Fixed for the session.
    pub lanes: BTreeMap<CardinalDirection, Vec<String>>,
    /// Entities whose reads failed this tick.
    pub omitted: Vec<OmittedEntity>,
}

impl Snapshot {
    /// Total vehicles currently seen by lane area detectors.
    pub fn queued_vehicles(&self) -> u64 {
        self.e2_sensors
            .values()
            .map(|r| u64::from(r.vehicle_count))
            .fold(0_u64, u64::saturating_add)
    }

    /// Wall-clock capture time as fractional Unix seconds.
    #[allow(clippy::cast_precision_loss)]
    pub fn unix_timestamp(&self) -> f64 {
        self.captured_at.timestamp_millis() as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_sensor_ids() {
        let d = SensorDescriptor::parse("E2_W0");
        assert_eq!(
            d,
            Some(SensorDescriptor {
                direction: CardinalDirection::W,
                lane: String::from("0"),
            })
        );
        assert_eq!(d.map(|d| d.readable_name()).as_deref(), Some("W-0"));
    }

    #[test]
    fn parses_split_sensor_ids() {
        let d = SensorDescriptor::parse("E1_N_2");
        assert_eq!(d.map(|d| (d.direction, d.lane)), Some((CardinalDirection::N, String::from("2"))));
    }

    #[test]
    fn rejects_unconventional_ids() {
        assert_eq!(SensorDescriptor::parse("loop7"), None);
        assert_eq!(SensorDescriptor::parse("E2_X0"), None);
        assert_eq!(SensorDescriptor::parse("E2_"), None);
        assert_eq!(SensorDescriptor::parse("E2_N"), None);
    }

    #[test]
    fn edge_keys_serialize_as_letters() {
        let mut lanes = BTreeMap::new();
        lanes.insert(CardinalDirection::E, vec![String::from("E_0")]);
        let json = serde_json::to_value(&lanes).unwrap_or_default();
        assert_eq!(json["E"][0], "E_0");
    }
}

//! Telemetry aggregation: subscription registration and per-tick
//! snapshot assembly.
//!
//! Registration runs once per connection and records the entity ids the
//! simulator reported. Every tick after that, [`build_snapshot`] reads the
//! subscription cache refreshed by the advance, converts raw variables
//! into typed records, and rolls lane-area readings up per approach edge.
//!
//! A single entity whose cached values are missing or malformed is left
//! out of the snapshot and listed in [`Snapshot::omitted`]; it never
//! aborts the build.

use std::collections::BTreeMap;

use chrono::Utc;
use crossroads_traci::constants::{
    LAST_STEP_MEAN_SPEED, LAST_STEP_OCCUPANCY, LAST_STEP_VEHICLE_NUMBER, TL_CURRENT_PHASE,
    TL_CURRENT_PROGRAM, TL_NEXT_SWITCH, TL_PHASE_DURATION, TL_RED_YELLOW_GREEN_STATE,
    TL_SPENT_DURATION,
};
use crossroads_traci::{ControlClient, Domain, ProtocolError, TraciValue, VariableMap};
use crossroads_types::{
    CardinalDirection, DetectorReading, EdgeAggregate, EntityCategory, OmittedEntity,
    SensorDescriptor, Snapshot, TrafficLightState,
};
use tracing::{info, warn};

/// Variables subscribed on every signal controller.
pub const TRAFFIC_LIGHT_VARIABLES: [u8; 6] = [
    TL_RED_YELLOW_GREEN_STATE,
    TL_CURRENT_PHASE,
    TL_PHASE_DURATION,
    TL_SPENT_DURATION,
    TL_NEXT_SWITCH,
    TL_CURRENT_PROGRAM,
];

/// Variables subscribed on every detector of either kind.
pub const DETECTOR_VARIABLES: [u8; 3] = [
    LAST_STEP_VEHICLE_NUMBER,
    LAST_STEP_MEAN_SPEED,
    LAST_STEP_OCCUPANCY,
];

/// Why one entity could not be converted this tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityReadError {
    /// The tick delivered nothing for this entity.
    #[error("no subscription result")]
    NoResult,

    /// A subscribed variable was absent from the result.
    #[error("variable 0x{0:02x} missing")]
    MissingVariable(u8),

    /// A variable had an unexpected wire type or out-of-range value.
    #[error("variable 0x{var:02x} has unusable {found} value")]
    BadValue {
        /// The variable id.
        var: u8,
        /// Wire type that was found.
        found: &'static str,
    },
}

/// Maps a session's entity category to the protocol domain it lives in.
pub const fn domain_of(category: EntityCategory) -> Domain {
    match category {
        EntityCategory::InductionLoop => Domain::InductionLoop,
        EntityCategory::LaneArea => Domain::LaneArea,
        EntityCategory::TrafficLight => Domain::TrafficLight,
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Entity ids known to a connection. Fixed once registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Signal controller ids.
    pub traffic_lights: Vec<String>,
    /// Induction loop ids.
    pub induction_loops: Vec<String>,
    /// Lane area detector ids.
    pub lane_areas: Vec<String>,
    /// Lane ids grouped by the approach letter they start with.
    pub lanes: BTreeMap<CardinalDirection, Vec<String>>,
}

impl Topology {
    /// Ids registered for one category.
    pub fn ids(&self, category: EntityCategory) -> &[String] {
        match category {
            EntityCategory::InductionLoop => &self.induction_loops,
            EntityCategory::LaneArea => &self.lane_areas,
            EntityCategory::TrafficLight => &self.traffic_lights,
        }
    }

    /// Total registered entities across the three categories.
    pub fn entity_count(&self) -> usize {
        self.traffic_lights
            .len()
            .saturating_add(self.induction_loops.len())
            .saturating_add(self.lane_areas.len())
    }

    /// Discover entity ids and subscribe to their per-tick variables.
    pub async fn register(client: &mut dyn ControlClient) -> Result<Self, ProtocolError> {
        let mut topology = Self::default();
        for category in EntityCategory::ALL {
            let domain = domain_of(category);
            let variables: &[u8] = match category {
                EntityCategory::TrafficLight => &TRAFFIC_LIGHT_VARIABLES,
                EntityCategory::InductionLoop | EntityCategory::LaneArea => &DETECTOR_VARIABLES,
            };
            let ids = client.id_list(domain).await?;
            for id in &ids {
                client.subscribe(domain, id, variables).await?;
            }
            match category {
                EntityCategory::InductionLoop => topology.induction_loops = ids,
                EntityCategory::LaneArea => topology.lane_areas = ids,
                EntityCategory::TrafficLight => topology.traffic_lights = ids,
            }
        }
        topology.lanes = group_lanes(client.id_list(Domain::Lane).await?);

        info!(
            traffic_lights = topology.traffic_lights.len(),
            induction_loops = topology.induction_loops.len(),
            lane_areas = topology.lane_areas.len(),
            lanes = topology.lanes.values().map(Vec::len).sum::<usize>(),
            "subscriptions registered"
        );
        Ok(topology)
    }
}

/// Group lane ids by their leading cardinal letter. Internal lanes
/// (`:J1_0`) and ids without a direction prefix are dropped.
pub fn group_lanes(lane_ids: Vec<String>) -> BTreeMap<CardinalDirection, Vec<String>> {
    let mut lanes: BTreeMap<CardinalDirection, Vec<String>> = BTreeMap::new();
    for id in lane_ids {
        if let Some(dir) = id.chars().next().and_then(CardinalDirection::from_letter) {
            lanes.entry(dir).or_default().push(id);
        }
    }
    lanes
}

// ---------------------------------------------------------------------------
// Snapshot assembly
// ---------------------------------------------------------------------------

/// Read the vehicle count and assemble this tick's snapshot.
///
/// Only a lost connection fails the build. Any other failure to read the
/// vehicle count is logged and reported as zero.
pub async fn build_snapshot(
    client: &mut dyn ControlClient,
    topology: &Topology,
    tick: u64,
    simulation_time: f64,
) -> Result<Snapshot, ProtocolError> {
    let vehicles = match client.vehicle_count().await {
        Ok(n) => n,
        Err(e) if e.is_connection_lost() => return Err(e),
        Err(e) => {
            warn!(tick, error = %e, "vehicle count unavailable");
            0
        }
    };
    Ok(assemble(&*client, topology, tick, simulation_time, vehicles))
}

/// Assemble a snapshot from the client's subscription cache.
pub fn assemble(
    client: &dyn ControlClient,
    topology: &Topology,
    tick: u64,
    simulation_time: f64,
    vehicles: u32,
) -> Snapshot {
    let mut omitted = Vec::new();
    let mut omit = |category: EntityCategory, id: &str, err: &EntityReadError| {
        warn!(tick, ?category, entity = id, reason = %err, "entity omitted from snapshot");
        omitted.push(OmittedEntity {
            category,
            id: id.to_owned(),
            reason: err.to_string(),
        });
    };

    let mut traffic_lights = BTreeMap::new();
    for id in &topology.traffic_lights {
        let vars = client.subscription(Domain::TrafficLight, id);
        match read_traffic_light(id, vars) {
            Ok(state) => {
                traffic_lights.insert(id.clone(), state);
            }
            Err(e) => omit(EntityCategory::TrafficLight, id, &e),
        }
    }

    let mut e1_sensors = BTreeMap::new();
    for id in &topology.induction_loops {
        match read_detector(id, client.subscription(Domain::InductionLoop, id)) {
            Ok(reading) => {
                e1_sensors.insert(id.clone(), reading);
            }
            Err(e) => omit(EntityCategory::InductionLoop, id, &e),
        }
    }

    let mut e2_sensors = BTreeMap::new();
    for id in &topology.lane_areas {
        match read_detector(id, client.subscription(Domain::LaneArea, id)) {
            Ok(reading) => {
                e2_sensors.insert(id.clone(), reading);
            }
            Err(e) => omit(EntityCategory::LaneArea, id, &e),
        }
    }

    let e2_aggregated = aggregate_by_edge(&e2_sensors);

    Snapshot {
        tick,
        simulation_time,
        captured_at: Utc::now(),
        vehicles,
        traffic_lights,
        e1_sensors,
        e2_sensors,
        e2_aggregated,
        lanes: topology.lanes.clone(),
        omitted,
    }
}

/// Roll lane-area readings up per approach edge.
///
/// Vehicle counts are summed; speed and occupancy are averaged over the
/// sensors that reported this tick. Sensors whose id carries no direction
/// are left out, and an edge with no reporting sensor gets no entry.
#[allow(clippy::arithmetic_side_effects)]
pub fn aggregate_by_edge(
    readings: &BTreeMap<String, DetectorReading>,
) -> BTreeMap<CardinalDirection, EdgeAggregate> {
    let mut edges: BTreeMap<CardinalDirection, EdgeAggregate> = BTreeMap::new();
    for reading in readings.values() {
        let Some(descriptor) = &reading.descriptor else {
            continue;
        };
        let edge = edges.entry(descriptor.direction).or_insert(EdgeAggregate {
            edge_id: descriptor.direction,
            vehicle_count: 0,
            mean_speed: 0.0,
            occupancy: 0.0,
            sensor_count: 0,
        });
        edge.vehicle_count = edge.vehicle_count.saturating_add(reading.vehicle_count);
        edge.mean_speed += reading.mean_speed;
        edge.occupancy += reading.occupancy;
        edge.sensor_count = edge.sensor_count.saturating_add(1);
    }
    for edge in edges.values_mut() {
        let n = f64::from(edge.sensor_count.max(1));
        edge.mean_speed /= n;
        edge.occupancy /= n;
    }
    edges
}

fn var<'a>(vars: &'a VariableMap, id: u8) -> Result<&'a TraciValue, EntityReadError> {
    vars.get(&id).ok_or(EntityReadError::MissingVariable(id))
}

fn f64_var(vars: &VariableMap, id: u8) -> Result<f64, EntityReadError> {
    let value = var(vars, id)?;
    value.as_f64().ok_or(EntityReadError::BadValue {
        var: id,
        found: value.type_name(),
    })
}

fn i32_var(vars: &VariableMap, id: u8) -> Result<i32, EntityReadError> {
    let value = var(vars, id)?;
    value.as_i32().ok_or(EntityReadError::BadValue {
        var: id,
        found: value.type_name(),
    })
}

fn string_var(vars: &VariableMap, id: u8) -> Result<String, EntityReadError> {
    let value = var(vars, id)?;
    value.as_str().map(str::to_owned).ok_or(EntityReadError::BadValue {
        var: id,
        found: value.type_name(),
    })
}

fn read_traffic_light(
    id: &str,
    vars: Option<&VariableMap>,
) -> Result<TrafficLightState, EntityReadError> {
    let vars = vars.ok_or(EntityReadError::NoResult)?;
    Ok(TrafficLightState {
        id: id.to_owned(),
        red_yellow_green_state: string_var(vars, TL_RED_YELLOW_GREEN_STATE)?,
        current_phase: i32_var(vars, TL_CURRENT_PHASE)?,
        phase_duration: f64_var(vars, TL_PHASE_DURATION)?,
        spent_duration: f64_var(vars, TL_SPENT_DURATION)?,
        next_switch: f64_var(vars, TL_NEXT_SWITCH)?,
        current_program: string_var(vars, TL_CURRENT_PROGRAM)?,
    })
}

fn read_detector(id: &str, vars: Option<&VariableMap>) -> Result<DetectorReading, EntityReadError> {
    let vars = vars.ok_or(EntityReadError::NoResult)?;
    let raw_count = i32_var(vars, LAST_STEP_VEHICLE_NUMBER)?;
    let vehicle_count = u32::try_from(raw_count).map_err(|_negative| EntityReadError::BadValue {
        var: LAST_STEP_VEHICLE_NUMBER,
        found: "negative int",
    })?;
    Ok(DetectorReading {
        id: id.to_owned(),
        vehicle_count,
        occupancy: f64_var(vars, LAST_STEP_OCCUPANCY)?,
        mean_speed: f64_var(vars, LAST_STEP_MEAN_SPEED)?,
        descriptor: SensorDescriptor::parse(id),
    })
}

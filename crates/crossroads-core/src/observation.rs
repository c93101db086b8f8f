//! Observation vectors for the learning loop.
//!
//! An [`ObservationSource`] turns a snapshot into an [`ObservationValue`]:
//! scalars, nested arrays, shaped numeric tensors, and string-keyed maps.
//! [`ObservationValue::to_json`] normalizes any of these into plain JSON
//! numbers and lists so streaming clients never see non-finite floats or
//! shape metadata.

use std::collections::BTreeMap;

use crossroads_types::Snapshot;
use serde_json::{Number, Value};

use crate::config::ObservationConfig;

/// A derived observation before JSON normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationValue {
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// Boolean scalar.
    Bool(bool),
    /// Heterogeneous list.
    Array(Vec<ObservationValue>),
    /// Row-major numeric tensor.
    Tensor {
        /// Extent of each dimension.
        shape: Vec<usize>,
        /// Flat row-major data.
        data: Vec<f64>,
    },
    /// String-keyed record.
    Map(BTreeMap<String, ObservationValue>),
}

impl ObservationValue {
    /// Normalize into plain JSON.
    ///
    /// Non-finite floats become `null`. Tensors become nested lists
    /// following their shape; a tensor whose shape does not match its data
    /// length is emitted flat.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(v) => Value::from(*v),
            Self::Float(v) => float(*v),
            Self::Bool(v) => Value::Bool(*v),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Tensor { shape, data } => tensor(shape, data),
            Self::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn tensor(shape: &[usize], data: &[f64]) -> Value {
    let expected = shape.iter().try_fold(1_usize, |acc, d| acc.checked_mul(*d));
    if shape.is_empty() || expected != Some(data.len()) {
        return Value::Array(data.iter().copied().map(float).collect());
    }
    nest(shape, data)
}

fn nest(shape: &[usize], data: &[f64]) -> Value {
    match shape.split_first() {
        None | Some((_, [])) => Value::Array(data.iter().copied().map(float).collect()),
        Some((outer, inner)) => {
            let stride = data.len().checked_div(*outer).unwrap_or(0).max(1);
            Value::Array(data.chunks(stride).map(|chunk| nest(inner, chunk)).collect())
        }
    }
}

/// Produces the observation sent to observation-mode clients.
pub trait ObservationSource: Send + Sync {
    /// Observe one snapshot.
    fn observe(&self, snapshot: &Snapshot) -> ObservationValue;
}

/// Built-in observation: phase one-hot, then total queued vehicles.
///
/// `vector` is `num_phases` one-hot entries for the configured signal's
/// current phase followed by the lane-area vehicle total; `sensors` maps
/// each lane-area detector to its vehicle count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseQueueObservation {
    signal_id: Option<String>,
    num_phases: u32,
}

impl PhaseQueueObservation {
    /// Source from configuration.
    pub fn from_config(config: &ObservationConfig) -> Self {
        Self {
            signal_id: config.signal_id.clone(),
            num_phases: config.num_phases,
        }
    }
}

impl ObservationSource for PhaseQueueObservation {
    #[allow(clippy::cast_precision_loss)]
    fn observe(&self, snapshot: &Snapshot) -> ObservationValue {
        let light = match &self.signal_id {
            Some(id) => snapshot.traffic_lights.get(id),
            None => snapshot.traffic_lights.values().next(),
        };
        let width = usize::try_from(self.num_phases).unwrap_or(0);
        let mut data = vec![0.0; width];
        if let Some(slot) = light
            .and_then(|l| usize::try_from(l.current_phase).ok())
            .and_then(|phase| data.get_mut(phase))
        {
            *slot = 1.0;
        }
        data.push(snapshot.queued_vehicles() as f64);

        let sensors = snapshot
            .e2_sensors
            .iter()
            .map(|(id, r)| (id.clone(), ObservationValue::Int(i64::from(r.vehicle_count))))
            .collect();

        let mut map = BTreeMap::new();
        map.insert(
            String::from("vector"),
            ObservationValue::Tensor {
                shape: vec![data.len()],
                data,
            },
        );
        map.insert(String::from("sensors"), ObservationValue::Map(sensors));
        ObservationValue::Map(map)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use crossroads_types::{DetectorReading, TrafficLightState};
    use serde_json::json;

    use super::*;

    fn snapshot(phase: i32, counts: &[(&str, u32)]) -> Snapshot {
        let mut traffic_lights = BTreeMap::new();
        traffic_lights.insert(
            String::from("J1"),
            TrafficLightState {
                id: String::from("J1"),
                red_yellow_green_state: String::from("GGrr"),
                current_phase: phase,
                phase_duration: 30.0,
                spent_duration: 1.0,
                next_switch: 30.0,
                current_program: String::from("0"),
            },
        );
        let e2_sensors = counts
            .iter()
            .map(|(id, n)| {
                (
                    (*id).to_owned(),
                    DetectorReading {
                        id: (*id).to_owned(),
                        vehicle_count: *n,
                        occupancy: 0.0,
                        mean_speed: 0.0,
                        descriptor: None,
                    },
                )
            })
            .collect();
        Snapshot {
            tick: 1,
            simulation_time: 1.0,
            captured_at: Utc::now(),
            vehicles: 0,
            traffic_lights,
            e1_sensors: BTreeMap::new(),
            e2_sensors,
            e2_aggregated: BTreeMap::new(),
            lanes: BTreeMap::new(),
            omitted: Vec::new(),
        }
    }

    #[test]
    fn non_finite_floats_become_null() {
        let value = ObservationValue::Array(vec![
            ObservationValue::Float(f64::NAN),
            ObservationValue::Float(f64::INFINITY),
            ObservationValue::Float(1.5),
        ]);
        assert_eq!(value.to_json(), json!([null, null, 1.5]));
    }

    #[test]
    fn tensors_nest_by_shape() {
        let value = ObservationValue::Tensor {
            shape: vec![2, 3],
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        };
        assert_eq!(value.to_json(), json!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
    }

    #[test]
    fn mismatched_tensor_is_flat() {
        let value = ObservationValue::Tensor {
            shape: vec![4, 4],
            data: vec![1.0, 2.0],
        };
        assert_eq!(value.to_json(), json!([1.0, 2.0]));
    }

    #[test]
    fn nested_maps_and_scalars_normalize() {
        let mut inner = BTreeMap::new();
        inner.insert(String::from("ok"), ObservationValue::Bool(true));
        inner.insert(String::from("n"), ObservationValue::Int(-3));
        let value = ObservationValue::Map(inner);
        assert_eq!(value.to_json(), json!({"n": -3, "ok": true}));
    }

    #[test]
    fn default_observation_encodes_phase_and_queue() {
        let source = PhaseQueueObservation {
            signal_id: None,
            num_phases: 4,
        };
        let obs = source
            .observe(&snapshot(2, &[("E2_W0", 3), ("E2_N0", 4)]))
            .to_json();
        assert_eq!(obs["vector"], json!([0.0, 0.0, 1.0, 0.0, 7.0]));
        assert_eq!(obs["sensors"]["E2_W0"], 3);
    }

    #[test]
    fn out_of_range_phase_leaves_one_hot_empty() {
        let source = PhaseQueueObservation {
            signal_id: Some(String::from("J1")),
            num_phases: 2,
        };
        let obs = source.observe(&snapshot(5, &[])).to_json();
        assert_eq!(obs["vector"], json!([0.0, 0.0, 0.0]));
    }
}

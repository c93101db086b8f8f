//! Object domains addressable over the control port.

use crate::constants::{
    CMD_GET_INDUCTIONLOOP_VARIABLE, CMD_GET_LANE_VARIABLE, CMD_GET_LANEAREA_VARIABLE,
    CMD_GET_SIM_VARIABLE, CMD_GET_TL_VARIABLE, CMD_GET_VEHICLE_VARIABLE,
    CMD_SUBSCRIBE_INDUCTIONLOOP_VARIABLE, CMD_SUBSCRIBE_LANE_VARIABLE,
    CMD_SUBSCRIBE_LANEAREA_VARIABLE, CMD_SUBSCRIBE_SIM_VARIABLE, CMD_SUBSCRIBE_TL_VARIABLE,
    CMD_SUBSCRIBE_VEHICLE_VARIABLE, RESPONSE_OFFSET,
};

/// A family of simulator objects sharing one get/subscribe command pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Domain {
    /// Induction loops (E1 detectors).
    InductionLoop,
    /// Lane area detectors (E2).
    LaneArea,
    /// Signal controllers.
    TrafficLight,
    /// Lanes.
    Lane,
    /// Vehicles.
    Vehicle,
    /// The simulation itself (object id is the empty string).
    Simulation,
}

impl Domain {
    /// Command id for reading one variable.
    pub const fn get_command(self) -> u8 {
        match self {
            Self::InductionLoop => CMD_GET_INDUCTIONLOOP_VARIABLE,
            Self::LaneArea => CMD_GET_LANEAREA_VARIABLE,
            Self::TrafficLight => CMD_GET_TL_VARIABLE,
            Self::Lane => CMD_GET_LANE_VARIABLE,
            Self::Vehicle => CMD_GET_VEHICLE_VARIABLE,
            Self::Simulation => CMD_GET_SIM_VARIABLE,
        }
    }

    /// Command id for a variable subscription.
    pub const fn subscribe_command(self) -> u8 {
        match self {
            Self::InductionLoop => CMD_SUBSCRIBE_INDUCTIONLOOP_VARIABLE,
            Self::LaneArea => CMD_SUBSCRIBE_LANEAREA_VARIABLE,
            Self::TrafficLight => CMD_SUBSCRIBE_TL_VARIABLE,
            Self::Lane => CMD_SUBSCRIBE_LANE_VARIABLE,
            Self::Vehicle => CMD_SUBSCRIBE_VEHICLE_VARIABLE,
            Self::Simulation => CMD_SUBSCRIBE_SIM_VARIABLE,
        }
    }

    /// Map a subscription response id back to its domain.
    pub const fn from_subscription_response(response: u8) -> Option<Self> {
        match response.wrapping_sub(RESPONSE_OFFSET) {
            CMD_SUBSCRIBE_INDUCTIONLOOP_VARIABLE => Some(Self::InductionLoop),
            CMD_SUBSCRIBE_LANEAREA_VARIABLE => Some(Self::LaneArea),
            CMD_SUBSCRIBE_TL_VARIABLE => Some(Self::TrafficLight),
            CMD_SUBSCRIBE_LANE_VARIABLE => Some(Self::Lane),
            CMD_SUBSCRIBE_VEHICLE_VARIABLE => Some(Self::Vehicle),
            CMD_SUBSCRIBE_SIM_VARIABLE => Some(Self::Simulation),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_responses_map_back_to_domains() {
        for domain in [
            Domain::InductionLoop,
            Domain::LaneArea,
            Domain::TrafficLight,
            Domain::Lane,
            Domain::Vehicle,
            Domain::Simulation,
        ] {
            let response = domain.subscribe_command().wrapping_add(RESPONSE_OFFSET);
            assert_eq!(Domain::from_subscription_response(response), Some(domain));
        }
        assert_eq!(Domain::from_subscription_response(0x42), None);
    }
}

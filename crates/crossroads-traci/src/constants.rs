//! Numeric identifiers of the control protocol.
//!
//! Only the subset the orchestrator speaks is listed here: the handshake,
//! stepping, closing, and get/set/subscribe for the entity domains the
//! telemetry snapshot covers.

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Handshake: query protocol API version.
pub const CMD_GETVERSION: u8 = 0x00;
/// Advance the simulation (target time `0.0` = one tick).
pub const CMD_SIMSTEP: u8 = 0x02;
/// Close the connection and end the simulation.
pub const CMD_CLOSE: u8 = 0x7F;

/// Get a variable of an induction loop.
pub const CMD_GET_INDUCTIONLOOP_VARIABLE: u8 = 0xA0;
/// Get a variable of a signal controller.
pub const CMD_GET_TL_VARIABLE: u8 = 0xA2;
/// Get a variable of a lane.
pub const CMD_GET_LANE_VARIABLE: u8 = 0xA3;
/// Get a variable of a vehicle (or the vehicle domain).
pub const CMD_GET_VEHICLE_VARIABLE: u8 = 0xA4;
/// Get a variable of the simulation.
pub const CMD_GET_SIM_VARIABLE: u8 = 0xAB;
/// Get a variable of a lane area detector.
pub const CMD_GET_LANEAREA_VARIABLE: u8 = 0xAD;

/// Set a variable of a signal controller.
pub const CMD_SET_TL_VARIABLE: u8 = 0xC2;

/// Subscribe to variables of an induction loop.
pub const CMD_SUBSCRIBE_INDUCTIONLOOP_VARIABLE: u8 = 0xD0;
/// Subscribe to variables of a signal controller.
pub const CMD_SUBSCRIBE_TL_VARIABLE: u8 = 0xD2;
/// Subscribe to variables of a lane.
pub const CMD_SUBSCRIBE_LANE_VARIABLE: u8 = 0xD3;
/// Subscribe to variables of a vehicle.
pub const CMD_SUBSCRIBE_VEHICLE_VARIABLE: u8 = 0xD4;
/// Subscribe to variables of the simulation.
pub const CMD_SUBSCRIBE_SIM_VARIABLE: u8 = 0xDB;
/// Subscribe to variables of a lane area detector.
pub const CMD_SUBSCRIBE_LANEAREA_VARIABLE: u8 = 0xDD;

/// Offset from a get/subscribe command id to its response id.
pub const RESPONSE_OFFSET: u8 = 0x10;

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

/// Command succeeded.
pub const RTYPE_OK: u8 = 0x00;
/// Command not implemented by the simulator.
pub const RTYPE_NOTIMPLEMENTED: u8 = 0x01;
/// Command failed.
pub const RTYPE_ERR: u8 = 0xFF;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Unsigned byte.
pub const TYPE_UBYTE: u8 = 0x07;
/// Signed byte.
pub const TYPE_BYTE: u8 = 0x08;
/// Big-endian `i32`.
pub const TYPE_INTEGER: u8 = 0x09;
/// Big-endian `f64`.
pub const TYPE_DOUBLE: u8 = 0x0B;
/// Length-prefixed string.
pub const TYPE_STRING: u8 = 0x0C;
/// Count-prefixed list of strings.
pub const TYPE_STRINGLIST: u8 = 0x0E;
/// Count-prefixed list of typed values.
pub const TYPE_COMPOUND: u8 = 0x0F;

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// All object ids of a domain (string list).
pub const ID_LIST: u8 = 0x00;
/// Number of objects in a domain (int).
pub const ID_COUNT: u8 = 0x01;

/// Vehicles seen by a detector during the last step (int).
pub const LAST_STEP_VEHICLE_NUMBER: u8 = 0x10;
/// Mean speed during the last step (double).
pub const LAST_STEP_MEAN_SPEED: u8 = 0x11;
/// Occupancy during the last step (double, percent).
pub const LAST_STEP_OCCUPANCY: u8 = 0x13;

/// Signal string of a controller (string).
pub const TL_RED_YELLOW_GREEN_STATE: u8 = 0x20;
/// Active phase index (int, set).
pub const TL_PHASE_INDEX: u8 = 0x22;
/// Duration of the active phase (double).
pub const TL_PHASE_DURATION: u8 = 0x24;
/// Active phase index (int, get/subscribe).
pub const TL_CURRENT_PHASE: u8 = 0x28;
/// Id of the running program (string).
pub const TL_CURRENT_PROGRAM: u8 = 0x29;
/// Absolute time of the next switch (double).
pub const TL_NEXT_SWITCH: u8 = 0x2D;
/// Time spent in the active phase (double).
pub const TL_SPENT_DURATION: u8 = 0x38;

/// Current simulation time in seconds (double).
pub const VAR_TIME: u8 = 0x66;

/// Begin/end sentinel meaning "for the whole simulation".
pub const INVALID_DOUBLE_VALUE: f64 = -1_073_741_824.0;

/// Oldest protocol API version the client understands.
pub const MIN_API_VERSION: i32 = 18;

//! Shared type definitions for the Crossroads traffic orchestrator.
//!
//! This crate is the single source of truth for the values that cross a
//! crate or process boundary: session state, per-tick telemetry
//! snapshots, and the streaming wire format. Types flow downstream to
//! `TypeScript` via `ts-rs` for the browser stream debugger.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for sessions and subscriptions
//! - [`enums`] -- Session state, stream mode, entity categories, directions
//! - [`structs`] -- Per-entity telemetry records and the [`Snapshot`]
//! - [`stream`] -- The JSON object pushed to streaming clients

pub mod enums;
pub mod ids;
pub mod stream;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{CardinalDirection, EntityCategory, SessionState, StreamMode};
pub use ids::{SessionId, SubscriptionId};
pub use stream::StreamMessage;
pub use structs::{
    DetectorReading, EdgeAggregate, OmittedEntity, SensorDescriptor, Snapshot, TrafficLightState,
};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation for the stream debugger.

    #[test]
    fn export_bindings() {
        // ts-rs writes the files to `bindings/` relative to the crate root.
        use ts_rs::TS;

        let _ = crate::ids::SessionId::export_all();
        let _ = crate::ids::SubscriptionId::export_all();

        let _ = crate::enums::SessionState::export_all();
        let _ = crate::enums::StreamMode::export_all();
        let _ = crate::enums::EntityCategory::export_all();
        let _ = crate::enums::CardinalDirection::export_all();

        let _ = crate::structs::SensorDescriptor::export_all();
        let _ = crate::structs::TrafficLightState::export_all();
        let _ = crate::structs::DetectorReading::export_all();
        let _ = crate::structs::EdgeAggregate::export_all();
        let _ = crate::structs::OmittedEntity::export_all();
        let _ = crate::structs::Snapshot::export_all();

        let _ = crate::stream::StreamMessage::export_all();
    }
}

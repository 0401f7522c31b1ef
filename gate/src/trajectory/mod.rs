//! Trajectory Model — canonical turn sequence and incident representation
//!
//! Consumers (replay, taxonomy scoring, lifecycle) only read these types.
//! A trajectory is validated once at construction: positions must be
//! strictly increasing and contiguous from 1.

pub mod incident;
pub mod types;

pub use incident::{
    Fingerprint, Incident, IncidentRecord, RootCauseFactor, Severity, TurnRecord,
    TRIGGER_METADATA_KEY,
};
pub use types::{ActorRole, SafetyLabel, Trajectory, Turn};

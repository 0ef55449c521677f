//! Shared type definitions for the stimulus perception engine.
//!
//! Everything that crosses a thread boundary (producers, worker jobs) or a
//! process boundary (external task executors) is defined here and is
//! serde-serializable.
//!
//! # Modules
//!
//! - [`ids`] -- Typed identifiers (agent UUIDs, sanitized world/type/event keys)
//! - [`geometry`] -- Block and continuous positions, grid cells
//! - [`event`] -- Stimulus events and producer emission requests
//! - [`compute`] -- Clustering and scoring snapshots and results

pub mod compute;
pub mod event;
pub mod geometry;
pub mod ids;

// Re-export all public types at crate root for convenience.
pub use compute::{
    AgentSnapshot, GroupComputeResult, GroupConfig, ScoreCandidate, ScoreRequest, ScoreResult,
};
pub use event::{EmitRequest, StimulusEvent};
pub use geometry::{CELL_SIZE, CellKey, IntVec3, Vec3};
pub use ids::{AgentId, EventId, EventTypeId, WorldId};

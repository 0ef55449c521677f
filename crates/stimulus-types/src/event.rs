//! Stimulus events and the producer-facing emission request.

use serde::{Deserialize, Serialize};

use crate::geometry::IntVec3;
use crate::ids::{AgentId, EventId, EventTypeId, WorldId};

/// A decaying, positioned signal that agents may react to.
///
/// Everything except `ticks_remaining` is fixed at emission. The store keeps
/// its own copy and is the only place the countdown advances; values handed
/// out by queries are snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusEvent {
    /// Event identifier (derived or producer supplied).
    pub event_id: EventId,
    /// Event type.
    pub type_id: EventTypeId,
    /// Block the event originates from.
    pub position: IntVec3,
    /// World the event was emitted in.
    pub world_id: WorldId,
    /// Unobstructed reach in blocks (> 0).
    pub range: f64,
    /// Unobstructed strength (> 0).
    pub weight: f64,
    /// Steps left before the event expires.
    pub ticks_remaining: i32,
    /// Lifetime the event was emitted with.
    pub lifetime: i32,
    /// Store step at which the event was accepted.
    pub occurred_at_step: u64,
    /// Whether the event was synthesized rather than observed in-world.
    pub is_virtual: bool,
    /// Agent that caused the event, if any.
    pub source_agent_id: Option<AgentId>,
}

impl StimulusEvent {
    /// Ranking used for capacity eviction: `weight + range / 1000`.
    pub fn capacity_score(&self) -> f64 {
        self.weight + self.range / 1000.0
    }

    /// Whether the event is still inside its novelty window.
    ///
    /// Fresh means the remaining life exceeds `lifetime - window`.
    pub const fn is_fresh(&self, novelty_window: i32) -> bool {
        self.ticks_remaining > self.lifetime.saturating_sub(novelty_window)
    }
}

/// Raw emission from a producer, validated by the store on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitRequest {
    /// Event type name.
    pub type_id: String,
    /// Source block.
    pub position: IntVec3,
    /// World name.
    pub world_id: String,
    /// Unobstructed reach in blocks.
    pub range: f64,
    /// Unobstructed strength.
    pub weight: f64,
    /// Number of steps the event lives for.
    pub lifetime_steps: i32,
    /// Explicit event id; derived from type and metadata when absent.
    pub event_id: Option<String>,
    /// Producer metadata folded into a derived event id.
    pub metadata: Option<String>,
    /// Marks a synthesized event.
    pub is_virtual: bool,
    /// Agent that caused the event.
    pub source_agent_id: Option<AgentId>,
}

impl EmitRequest {
    /// Build a request with the required fields.
    pub fn new(
        type_id: impl Into<String>,
        position: IntVec3,
        world_id: impl Into<String>,
        range: f64,
        weight: f64,
        lifetime_steps: i32,
    ) -> Self {
        Self {
            type_id: type_id.into(),
            position,
            world_id: world_id.into(),
            range,
            weight,
            lifetime_steps,
            event_id: None,
            metadata: None,
            is_virtual: false,
            source_agent_id: None,
        }
    }

    /// Use an explicit event id instead of deriving one.
    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Attach producer metadata used when deriving the event id.
    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Record the agent responsible for the event.
    #[must_use]
    pub const fn with_source(mut self, agent: AgentId) -> Self {
        self.source_agent_id = Some(agent);
        self
    }

    /// Mark the event as virtual.
    #[must_use]
    pub const fn virtual_event(mut self) -> Self {
        self.is_virtual = true;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(weight: f64, range: f64, remaining: i32, lifetime: i32) -> StimulusEvent {
        StimulusEvent {
            event_id: EventId::parse("e").unwrap(),
            type_id: EventTypeId::parse("t").unwrap(),
            position: IntVec3::default(),
            world_id: WorldId::parse("w").unwrap(),
            range,
            weight,
            ticks_remaining: remaining,
            lifetime,
            occurred_at_step: 0,
            is_virtual: false,
            source_agent_id: None,
        }
    }

    #[test]
    fn capacity_score_favours_weight() {
        let strong = event(2.0, 10.0, 5, 5);
        let wide = event(1.0, 900.0, 5, 5);
        assert!(strong.capacity_score() > wide.capacity_score());
    }

    #[test]
    fn freshness_tracks_remaining_life() {
        assert!(event(1.0, 1.0, 20, 20).is_fresh(5));
        assert!(event(1.0, 1.0, 16, 20).is_fresh(5));
        assert!(!event(1.0, 1.0, 15, 20).is_fresh(5));
    }
}

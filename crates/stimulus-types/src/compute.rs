//! Snapshots handed to background compute jobs and the results they return.
//!
//! Jobs only ever see these owned copies, never live simulation state, so
//! they can run on worker threads or be serialized to an external executor.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;
use crate::ids::{AgentId, EventId, WorldId};

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

/// Point-in-time view of one agent for clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Agent identifier.
    pub id: AgentId,
    /// Agent position.
    pub position: Vec3,
    /// Current health; healthier agents are preferred as leaders.
    pub health: f64,
    /// Dead agents are ignored.
    pub alive: bool,
}

/// Parameters of the leader/follower clustering pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Maximum horizontal distance from a member to its leader.
    pub group_radius: f64,
    /// Upper bound on the number of leaders.
    pub max_leaders: usize,
    /// Maximum followers per leader (the leader is not counted).
    pub max_group_size: usize,
    /// Leaders must be more than `group_radius * multiplier` apart.
    pub leader_spacing_multiplier: f64,
    /// Angular sectors around a leader used to pick edge agents.
    pub num_sectors: usize,
    /// Farthest members kept per sector.
    pub edge_agents_per_sector: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            group_radius: 24.0,
            max_leaders: 8,
            max_group_size: 16,
            leader_spacing_multiplier: 1.5,
            num_sectors: 8,
            edge_agents_per_sector: 1,
        }
    }
}

/// Output of one clustering run over a world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupComputeResult {
    /// World the agents were sampled from.
    pub world_id: WorldId,
    /// Every grouped agent mapped to its leader; leaders map to themselves.
    pub agent_id_to_leader_id: BTreeMap<AgentId, AgentId>,
    /// Outermost followers per angular sector, keyed by leader.
    pub edge_agents_by_leader_id: BTreeMap<AgentId, BTreeSet<AgentId>>,
    /// Alive agents no leader could take.
    pub deserted_agent_ids: BTreeSet<AgentId>,
}

impl GroupComputeResult {
    /// An empty result for `world_id`.
    pub const fn empty(world_id: WorldId) -> Self {
        Self {
            world_id,
            agent_id_to_leader_id: BTreeMap::new(),
            edge_agents_by_leader_id: BTreeMap::new(),
            deserted_agent_ids: BTreeSet::new(),
        }
    }

    /// Agents that lead a group.
    pub fn leaders(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.agent_id_to_leader_id
            .iter()
            .filter(|(agent, leader)| agent == leader)
            .map(|(agent, _)| *agent)
    }

    /// Followers of `leader`, excluding the leader itself.
    pub fn members_of(&self, leader: AgentId) -> impl Iterator<Item = AgentId> + '_ {
        self.agent_id_to_leader_id
            .iter()
            .filter(move |(agent, l)| **l == leader && **agent != leader)
            .map(|(agent, _)| *agent)
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// One event an agent could react to, as seen at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCandidate {
    /// Event identifier (unique within a request).
    pub event_id: EventId,
    /// Event source position.
    pub position: Vec3,
    /// Step the event was emitted.
    pub occurred_at_step: u64,
    /// Effective reach.
    pub range: f64,
    /// Effective strength.
    pub weight: f64,
    /// Fraction of strength surviving obstruction, in `[0, 1]`.
    pub muffling_factor: f64,
}

/// Per-agent scoring request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRequest {
    /// Agent the request is for.
    pub agent_id: AgentId,
    /// Agent position.
    pub position: Vec3,
    /// Step the request was built.
    pub current_step: u64,
    /// Event the agent is already reacting to.
    pub current_event_id: Option<EventId>,
    /// Candidate events.
    pub candidates: Vec<ScoreCandidate>,
    /// Hysteresis ratio an alternative must beat.
    pub switch_ratio: f64,
    /// Bonus for recently emitted events.
    pub novelty_bonus: f64,
    /// Age in steps under which the bonus applies.
    pub novelty_window: u64,
}

/// Outcome of scoring one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Agent the result is for.
    pub agent_id: AgentId,
    /// Chosen event, if any candidate was reachable.
    pub chosen_event_id: Option<EventId>,
    /// Score of the chosen event (0 when nothing was chosen).
    pub score: f64,
}

impl ScoreResult {
    /// A result with no pick.
    pub const fn none(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            chosen_event_id: None,
            score: 0.0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn leaders_and_members_are_derived_from_mapping() {
        let leader = AgentId::new();
        let follower = AgentId::new();
        let mut result = GroupComputeResult::empty(WorldId::parse("w").unwrap());
        result.agent_id_to_leader_id.insert(leader, leader);
        result.agent_id_to_leader_id.insert(follower, leader);

        assert_eq!(result.leaders().collect::<Vec<_>>(), vec![leader]);
        assert_eq!(result.members_of(leader).collect::<Vec<_>>(), vec![follower]);
    }

    #[test]
    fn group_result_survives_json() {
        let leader = AgentId::new();
        let mut result = GroupComputeResult::empty(WorldId::parse("w").unwrap());
        result.agent_id_to_leader_id.insert(leader, leader);
        result
            .edge_agents_by_leader_id
            .insert(leader, BTreeSet::from([AgentId::new()]));

        let value = serde_json::to_value(&result).unwrap();
        let back: GroupComputeResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn group_config_fills_missing_fields() {
        let cfg: GroupConfig = serde_json::from_str(r#"{"max_leaders": 3}"#).unwrap();
        assert_eq!(cfg.max_leaders, 3);
        assert_eq!(cfg.num_sectors, GroupConfig::default().num_sectors);
    }
}

//! Per-agent memo of asynchronous scoring results.
//!
//! The synchronous lookup and the background scorer are two cooperating
//! decision sources. A background result, once drained, is served by the
//! fast path of `find_best` until it is older than the advisory TTL; after
//! that the synchronous scan takes over again until a newer result lands.
//! Entries also remember the hash of the last submitted candidate set so
//! identical submissions inside the cooldown can be suppressed.

use std::collections::HashMap;

use dashmap::DashMap;
use stimulus_types::{AgentId, EventId, ScoreResult};

use super::index::EventKey;

/// Range and weight of a candidate as they were when it was submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedCandidate {
    /// Stored event the candidate refers to.
    pub key: EventKey,
    /// Effective range at submission time.
    pub range: f64,
    /// Effective weight at submission time.
    pub weight: f64,
}

/// The event chosen by the last drained scoring result.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryPick {
    /// Stored event that was chosen.
    pub key: EventKey,
    /// Effective range recorded at choice time.
    pub range: f64,
    /// Effective weight recorded at choice time.
    pub weight: f64,
    /// Score assigned by the scorer.
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
struct AdvisoryEntry {
    pick: Option<AdvisoryPick>,
    result_at_step: Option<u64>,
    submitted_hash: Option<u64>,
    submitted_at_step: u64,
    submitted: HashMap<EventId, SubmittedCandidate>,
}

impl AdvisoryEntry {
    fn result_is_fresh(&self, step: u64, ttl: u64) -> bool {
        self.result_at_step
            .is_some_and(|at| step.saturating_sub(at) <= ttl)
    }

    fn last_touched(&self) -> u64 {
        self.result_at_step
            .unwrap_or(0)
            .max(self.submitted_at_step)
    }
}

/// Concurrent map of advisory entries keyed by agent.
#[derive(Debug, Default)]
pub struct AdvisoryCache {
    entries: DashMap<AgentId, AdvisoryEntry>,
}

impl AdvisoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The agent's advisory pick if it was computed within `ttl` steps.
    pub fn fresh_pick(&self, agent: AgentId, step: u64, ttl: u64) -> Option<AdvisoryPick> {
        let entry = self.entries.get(&agent)?;
        if !entry.result_is_fresh(step, ttl) {
            return None;
        }
        entry.pick.clone()
    }

    /// Whether a candidate set with `hash` should be submitted now.
    ///
    /// Submission is suppressed only when the same hash went out within
    /// `cooldown` steps and a fresh result already exists.
    pub fn should_submit(&self, agent: AgentId, hash: u64, step: u64, cooldown: u64, ttl: u64) -> bool {
        let Some(entry) = self.entries.get(&agent) else {
            return true;
        };
        let same_recent = entry.submitted_hash == Some(hash)
            && step.saturating_sub(entry.submitted_at_step) <= cooldown;
        !(same_recent && entry.result_is_fresh(step, ttl))
    }

    /// Remember what was submitted for `agent`.
    pub fn record_submission(
        &self,
        agent: AgentId,
        hash: u64,
        step: u64,
        submitted: HashMap<EventId, SubmittedCandidate>,
    ) {
        let mut entry = self.entries.entry(agent).or_default();
        entry.submitted_hash = Some(hash);
        entry.submitted_at_step = step;
        entry.submitted = submitted;
    }

    /// Fold a drained scoring result into the agent's entry.
    ///
    /// A chosen event that was not part of the last submission cannot be
    /// resolved to a stored event and is recorded as "no pick". Returns
    /// `false` when the agent has no entry (it was pruned meanwhile).
    pub fn apply(&self, result: &ScoreResult, step: u64) -> bool {
        let Some(mut entry) = self.entries.get_mut(&result.agent_id) else {
            return false;
        };
        entry.pick = result
            .chosen_event_id
            .as_ref()
            .and_then(|id| entry.submitted.get(id))
            .map(|c| AdvisoryPick {
                key: c.key.clone(),
                range: c.range,
                weight: c.weight,
                score: result.score,
            });
        entry.result_at_step = Some(step);
        true
    }

    /// Drop an agent's pick, keeping its submission record.
    pub fn invalidate_pick(&self, agent: AgentId) {
        if let Some(mut entry) = self.entries.get_mut(&agent) {
            entry.pick = None;
            entry.result_at_step = None;
        }
    }

    /// Remove entries untouched for more than `max_age` steps.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self, step: u64, max_age: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| step.saturating_sub(e.last_touched()) <= max_age);
        before.saturating_sub(self.entries.len())
    }

    /// Number of agents with an entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no agent has an entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stimulus_types::{IntVec3, WorldId};

    fn submitted(id: &str) -> HashMap<EventId, SubmittedCandidate> {
        let event_id = EventId::parse(id).unwrap();
        HashMap::from([(
            event_id.clone(),
            SubmittedCandidate {
                key: EventKey {
                    world_id: WorldId::parse("w").unwrap(),
                    position: IntVec3::default(),
                    event_id,
                },
                range: 8.0,
                weight: 2.0,
            },
        )])
    }

    fn result(agent: AgentId, id: Option<&str>) -> ScoreResult {
        ScoreResult {
            agent_id: agent,
            chosen_event_id: id.map(|s| EventId::parse(s).unwrap()),
            score: 1.5,
        }
    }

    #[test]
    fn pick_is_served_until_ttl() {
        let cache = AdvisoryCache::new();
        let agent = AgentId::new();
        cache.record_submission(agent, 7, 0, submitted("e"));
        assert!(cache.apply(&result(agent, Some("e")), 1));

        let pick = cache.fresh_pick(agent, 4, 3).unwrap();
        assert_eq!(pick.key.event_id.as_str(), "e");
        assert!((pick.range - 8.0).abs() < f64::EPSILON);
        assert!(cache.fresh_pick(agent, 5, 3).is_none());
    }

    #[test]
    fn unknown_choice_records_no_pick() {
        let cache = AdvisoryCache::new();
        let agent = AgentId::new();
        cache.record_submission(agent, 7, 0, submitted("e"));
        assert!(cache.apply(&result(agent, Some("other")), 0));
        assert!(cache.fresh_pick(agent, 0, 10).is_none());
        assert!(!cache.apply(&result(AgentId::new(), Some("e")), 0));
    }

    #[test]
    fn identical_submission_suppressed_only_with_fresh_result() {
        let cache = AdvisoryCache::new();
        let agent = AgentId::new();
        assert!(cache.should_submit(agent, 7, 0, 5, 10));

        cache.record_submission(agent, 7, 0, submitted("e"));
        // No result yet.
        assert!(cache.should_submit(agent, 7, 1, 5, 10));

        cache.apply(&result(agent, None), 1);
        assert!(!cache.should_submit(agent, 7, 2, 5, 10));
        // Different candidate set.
        assert!(cache.should_submit(agent, 8, 2, 5, 10));
        // Cooldown elapsed.
        assert!(cache.should_submit(agent, 7, 6, 5, 10));
    }

    #[test]
    fn prune_drops_idle_agents() {
        let cache = AdvisoryCache::new();
        let idle = AgentId::new();
        let busy = AgentId::new();
        cache.record_submission(idle, 1, 0, HashMap::new());
        cache.record_submission(busy, 1, 9, HashMap::new());
        assert_eq!(cache.prune(10, 5), 1);
        assert_eq!(cache.len(), 1);
    }
}

//! Concurrent spatial store of stimulus events.
//!
//! Producers call [`SpatialStimulusStore::add_event`] from any thread. The
//! authoritative thread calls [`SpatialStimulusStore::tick`] once per step
//! and [`SpatialStimulusStore::find_best`] per agent.
//!
//! A single read-write lock guards the event map, the grid and overflow
//! indexes, and the dedup window. The advisory cache, the per-agent
//! overrides, and the attenuation cache are concurrent maps updated one key
//! at a time, so they sit outside that lock.
//!
//! # Lookup
//!
//! `find_best` combines two decision sources. A fresh advisory pick from
//! the background scorer is returned straight away when its event still
//! exists and the agent is inside the range recorded for it. Otherwise the
//! neighborhood is scanned synchronously: candidates are ranked by a cheap
//! score, the top few are attenuated in order, and the scan stops once no
//! remaining candidate could beat the current best. Either way a bounded
//! candidate set is handed to the [`ComputeScheduler`] for rescoring, unless
//! an identical set went out recently and its result is still fresh.
//!
//! # Modules
//!
//! - [`advisory`] -- per-agent memo of background scoring results
//! - [`dedup`] -- two-step duplicate emission window
//! - [`index`] -- event map with grid and overflow indexes
//! - [`shortlist`] -- bounded top-K candidate list

pub mod advisory;
pub mod dedup;
pub mod index;
pub mod shortlist;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash as _, Hasher as _};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use stimulus_types::{
    AgentId, EmitRequest, EventId, EventTypeId, ScoreCandidate, ScoreRequest, ScoreResult,
    StimulusEvent, Vec3, WorldId,
};
use tracing::{debug, trace};

use crate::attenuation::{AttenuationEngine, RaycastKey};
use crate::config::{AdvisoryConfig, ScoringConfig, StimulusConfig, StoreConfig};
use crate::scheduler::ComputeScheduler;

use self::advisory::{AdvisoryCache, SubmittedCandidate};
pub use self::index::EventKey;
use self::index::StoreIndex;
use self::shortlist::{Candidate, Shortlist};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Why an emission was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Malformed identifiers, position, range, weight, or lifetime.
    Invalid,
    /// The event type is not on the configured allow-list.
    NotAllowed,
    /// The same type was emitted at the same block within two steps.
    Duplicate,
    /// An event with the same identity and at least this weight exists.
    WeakerThanExisting,
    /// The store is full and this event ranks no better than the worst.
    BelowCapacityFloor,
}

/// Result of [`SpatialStimulusStore::add_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// Stored as a new event.
    Inserted,
    /// Replaced a weaker event with the same identity.
    Replaced,
    /// Stored after evicting the globally worst event.
    Evicted {
        /// The event that made room.
        evicted: Box<StimulusEvent>,
    },
    /// Not stored.
    Rejected(RejectReason),
}

impl AddOutcome {
    /// Whether the event is now in the store.
    pub const fn is_stored(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Per-agent filtering applied by [`SpatialStimulusStore::find_best`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOverride {
    /// Event types the agent never reacts to.
    pub ignored_types: HashSet<EventTypeId>,
    /// Farthest distance the agent listens, regardless of event range.
    pub max_range: Option<f64>,
}

/// One agent's lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentQuery {
    /// The agent.
    pub agent_id: AgentId,
    /// World the agent is in.
    pub world_id: WorldId,
    /// Feet position; selects the grid neighborhood.
    pub position: Vec3,
    /// Listening position used for distances and attenuation.
    pub eye_position: Vec3,
    /// Event the agent is currently reacting to.
    pub current_event_id: Option<EventId>,
}

/// Counters from one [`SpatialStimulusStore::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Step number after the tick.
    pub step: u64,
    /// Events that reached the end of their lifetime.
    pub expired: usize,
    /// Events still stored.
    pub remaining: usize,
    /// Local raycast cache entries evicted.
    pub raycasts_evicted: usize,
    /// Advisory entries pruned.
    pub advisory_pruned: usize,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StoreSettings {
    store: StoreConfig,
    advisory: AdvisoryConfig,
    scoring: ScoringConfig,
    allow_list: Option<HashSet<EventTypeId>>,
}

impl StoreSettings {
    fn from_config(config: &StimulusConfig) -> Self {
        let allow_list = config.event_types.allow_list.as_ref().map(|types| {
            types
                .iter()
                .filter_map(|t| EventTypeId::parse(t))
                .collect::<HashSet<_>>()
        });
        Self {
            store: config.store.clone(),
            advisory: config.advisory.clone(),
            scoring: config.scoring.clone(),
            allow_list,
        }
    }

    fn allows(&self, type_id: &EventTypeId) -> bool {
        self.allow_list
            .as_ref()
            .is_none_or(|allowed| allowed.contains(type_id))
    }

    fn novelty_window(&self) -> i32 {
        i32::try_from(self.store.novelty_window_steps).unwrap_or(i32::MAX)
    }

    fn approx_score(&self, event: &StimulusEvent) -> f64 {
        if event.is_fresh(self.novelty_window()) {
            event.weight + self.store.novelty_bonus
        } else {
            event.weight
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Grid-indexed, capacity-bounded collection of stimulus events.
pub struct SpatialStimulusStore {
    index: RwLock<StoreIndex>,
    settings: RwLock<Arc<StoreSettings>>,
    advisory: AdvisoryCache,
    overrides: DashMap<AgentId, AgentOverride>,
    attenuation: AttenuationEngine,
}

impl SpatialStimulusStore {
    /// Create an empty store.
    pub fn new(config: &StimulusConfig, attenuation: AttenuationEngine) -> Self {
        Self {
            index: RwLock::new(StoreIndex::default()),
            settings: RwLock::new(Arc::new(StoreSettings::from_config(config))),
            advisory: AdvisoryCache::new(),
            overrides: DashMap::new(),
            attenuation,
        }
    }

    fn settings(&self) -> Arc<StoreSettings> {
        Arc::clone(&self.settings.read())
    }

    /// Apply new settings.
    ///
    /// Rebuilds the allow-list, reindexes events if the large-range
    /// threshold changed, evicts the worst events if the capacity shrank,
    /// and clears the local raycast cache.
    pub fn reconfigure(&self, config: &StimulusConfig) {
        let settings = Arc::new(StoreSettings::from_config(config));
        let old = std::mem::replace(&mut *self.settings.write(), Arc::clone(&settings));

        let mut index = self.index.write();
        if (old.store.large_range_threshold - settings.store.large_range_threshold).abs() > f64::EPSILON {
            index.reindex(settings.store.large_range_threshold);
        }
        let mut trimmed = 0_usize;
        while index.len() > settings.store.max_events_tracked {
            let Some(worst) = index.worst().map(|(k, _)| k.clone()) else {
                break;
            };
            index.remove(&worst);
            trimmed = trimmed.saturating_add(1);
        }
        drop(index);

        self.attenuation.reconfigure(&config.attenuation);
        debug!(trimmed, "stimulus store reconfigured");
    }

    /// Register filtering for one agent.
    pub fn set_agent_override(&self, agent: AgentId, rules: AgentOverride) {
        self.overrides.insert(agent, rules);
    }

    /// Remove an agent's filtering and advisory state.
    pub fn forget_agent(&self, agent: AgentId) {
        self.overrides.remove(&agent);
        self.advisory.invalidate_pick(agent);
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Whether the store holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Steps completed so far.
    pub fn current_step(&self) -> u64 {
        self.index.read().step
    }

    /// A stored event by identity.
    pub fn get(&self, key: &EventKey) -> Option<StimulusEvent> {
        self.index.read().get(key).cloned()
    }

    /// Every stored event of `world`, in no particular order.
    pub fn events_in(&self, world: &WorldId) -> Vec<StimulusEvent> {
        self.index
            .read()
            .events()
            .filter(|e| &e.world_id == world)
            .cloned()
            .collect()
    }

    /// The per-agent advisory cache.
    pub const fn advisory(&self) -> &AdvisoryCache {
        &self.advisory
    }

    /// The attenuation engine.
    pub const fn attenuation(&self) -> &AttenuationEngine {
        &self.attenuation
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    /// Store an emission if it passes validation, dedup, identity, and
    /// capacity rules. Never fails; rejections are reported in the outcome.
    pub fn add_event(&self, request: EmitRequest) -> AddOutcome {
        let settings = self.settings();
        let Some(mut event) = validate(&request) else {
            return AddOutcome::Rejected(RejectReason::Invalid);
        };
        if !settings.allows(&event.type_id) {
            trace!(type_id = %event.type_id, "event type not allow-listed");
            return AddOutcome::Rejected(RejectReason::NotAllowed);
        }

        let mut index = self.index.write();
        event.occurred_at_step = index.step;

        let dedup_key = StoreIndex::dedup_key(&event);
        if index.dedup.contains(&dedup_key) {
            return AddOutcome::Rejected(RejectReason::Duplicate);
        }

        let key = EventKey::of(&event);
        let threshold = settings.store.large_range_threshold;
        if let Some(existing) = index.get(&key) {
            if existing.weight >= event.weight {
                return AddOutcome::Rejected(RejectReason::WeakerThanExisting);
            }
            index.put(event, threshold);
            index.dedup.record(dedup_key);
            return AddOutcome::Replaced;
        }

        let mut evicted = None;
        if index.len() >= settings.store.max_events_tracked {
            let Some((worst_key, worst)) = index.worst() else {
                return AddOutcome::Rejected(RejectReason::BelowCapacityFloor);
            };
            if event.capacity_score() <= worst.capacity_score() {
                return AddOutcome::Rejected(RejectReason::BelowCapacityFloor);
            }
            let worst_key = worst_key.clone();
            evicted = index.remove(&worst_key);
        }
        index.put(event, threshold);
        index.dedup.record(dedup_key);
        drop(index);

        match evicted {
            Some(evicted) => AddOutcome::Evicted {
                evicted: Box::new(evicted),
            },
            None => AddOutcome::Inserted,
        }
    }

    // -----------------------------------------------------------------------
    // Step maintenance
    // -----------------------------------------------------------------------

    /// Advance one step: decay every event, drop expired ones, rotate the
    /// dedup window, and expire cached raycasts and idle advisory entries.
    pub fn tick(&self) -> TickReport {
        let (step, expired, remaining) = {
            let mut index = self.index.write();
            let expired = index.decay();
            index.dedup.rotate();
            index.step = index.step.saturating_add(1);
            (index.step, expired, index.len())
        };

        let settings = self.settings();
        let raycasts_evicted = self.attenuation.maintain(step);
        let advisory_pruned = self.advisory.prune(
            step,
            settings
                .advisory
                .advisory_result_ttl_steps
                .saturating_add(settings.advisory.submit_cooldown_steps),
        );

        TickReport {
            step,
            expired,
            remaining,
            raycasts_evicted,
            advisory_pruned,
        }
    }

    /// Fold drained background scoring results into the advisory cache.
    ///
    /// Returns the number of results applied.
    pub fn apply_score_results<I>(&self, results: I) -> usize
    where
        I: IntoIterator<Item = ScoreResult>,
    {
        let step = self.current_step();
        results
            .into_iter()
            .filter(|r| self.advisory.apply(r, step))
            .count()
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Best event for one agent right now, or `None`.
    ///
    /// Never fails: an attenuation error drops only the event it concerns
    /// and scheduler errors skip the background submission. The
    /// neighborhood is taken around the cell of the eye position, which is
    /// also where reach is measured from.
    pub fn find_best(&self, query: &AgentQuery, scheduler: &dyn ComputeScheduler) -> Option<StimulusEvent> {
        if !query.position.is_finite() || !query.eye_position.is_finite() {
            debug!(agent_id = %query.agent_id, "ignoring lookup with non-finite position");
            return None;
        }
        let settings = self.settings();
        let step = self.current_step();

        if let Some(event) = self.advisory_pick(query, &settings, step) {
            return Some(event);
        }

        let snapshot = self
            .index
            .read()
            .neighborhood(&query.world_id, query.eye_position.block().cell());
        let rules = self.overrides.get(&query.agent_id).map(|r| r.value().clone());

        let mut shortlist = Shortlist::new(settings.advisory.shortlist_size);
        let mut pool: HashMap<EventId, Candidate> = HashMap::new();
        for event in snapshot {
            if !settings.allows(&event.type_id) {
                continue;
            }
            if rules.as_ref().is_some_and(|r| r.ignored_types.contains(&event.type_id)) {
                continue;
            }
            let distance = query.eye_position.distance(event.position.center());
            let reach = rules
                .as_ref()
                .and_then(|r| r.max_range)
                .map_or(event.range, |cap| cap.min(event.range));
            if distance > reach {
                continue;
            }
            let candidate = Candidate {
                approx_score: settings.approx_score(&event),
                distance,
                event,
            };
            let better = pool
                .get(&candidate.event.event_id)
                .is_none_or(|c| candidate.approx_score > c.approx_score);
            if better {
                pool.insert(candidate.event.event_id.clone(), candidate.clone());
            }
            shortlist.offer(candidate);
        }

        let mut muffling: HashMap<EventKey, f64> = HashMap::new();
        let pick = self.pick_attenuated(query, shortlist.into_sorted(), step, &mut muffling);

        self.submit_async(query, &settings, step, pool, &muffling, scheduler);
        pick
    }

    /// Serve a fresh advisory pick if its event is still reachable.
    fn advisory_pick(&self, query: &AgentQuery, settings: &StoreSettings, step: u64) -> Option<StimulusEvent> {
        let pick = self.advisory.fresh_pick(
            query.agent_id,
            step,
            settings.advisory.advisory_result_ttl_steps,
        )?;
        if pick.key.world_id != query.world_id {
            return None;
        }
        let event = self.get(&pick.key)?;
        let distance = query.eye_position.distance(event.position.center());
        (distance <= pick.range).then_some(event)
    }

    /// Attenuate candidates in rank order until none can beat the best.
    ///
    /// Records the muffling factor of every candidate it attenuates.
    fn pick_attenuated(
        &self,
        query: &AgentQuery,
        ranked: Vec<Candidate>,
        step: u64,
        muffling: &mut HashMap<EventKey, f64>,
    ) -> Option<StimulusEvent> {
        let mut best: Option<(f64, f64, StimulusEvent)> = None;
        for candidate in ranked {
            // True scores never exceed approximate ones.
            if best.as_ref().is_some_and(|(s, _, _)| candidate.approx_score <= *s) {
                break;
            }
            let event = candidate.event;
            let attenuated = match self.attenuation.attenuate(
                &event.world_id,
                event.position,
                query.eye_position,
                event.range,
                event.weight,
                &event.event_id,
                step,
            ) {
                Ok(a) => a,
                Err(e) => {
                    debug!(
                        agent_id = %query.agent_id,
                        event_id = %event.event_id,
                        error = %e,
                        "attenuation failed, skipping event"
                    );
                    continue;
                }
            };
            if event.weight > 0.0 {
                muffling.insert(EventKey::of(&event), (attenuated.weight / event.weight).clamp(0.0, 1.0));
            }
            if candidate.distance > attenuated.range {
                continue;
            }
            let score = candidate.approx_score - event.weight + attenuated.weight;
            let wins = best.as_ref().is_none_or(|(s, d, _)| {
                score > *s || ((score - *s).abs() <= f64::EPSILON && candidate.distance < *d)
            });
            if wins {
                best = Some((score, candidate.distance, event));
            }
        }
        best.map(|(_, _, event)| event)
    }

    /// Hand the candidate pool to the background scorer unless suppressed.
    fn submit_async(
        &self,
        query: &AgentQuery,
        settings: &StoreSettings,
        step: u64,
        pool: HashMap<EventId, Candidate>,
        muffling: &HashMap<EventKey, f64>,
        scheduler: &dyn ComputeScheduler,
    ) {
        if pool.is_empty() {
            return;
        }
        let mut ranked: Vec<Candidate> = pool.into_values().collect();
        ranked.sort_by(|a, b| {
            b.approx_score
                .total_cmp(&a.approx_score)
                .then_with(|| a.distance.total_cmp(&b.distance))
        });
        ranked.truncate(settings.advisory.max_async_candidates);

        let mut ids: Vec<&str> = ranked.iter().map(|c| c.event.event_id.as_str()).collect();
        ids.sort_unstable();
        let mut hasher = DefaultHasher::new();
        query.world_id.hash(&mut hasher);
        ids.hash(&mut hasher);
        let hash = hasher.finish();

        if !self.advisory.should_submit(
            query.agent_id,
            hash,
            step,
            settings.advisory.submit_cooldown_steps,
            settings.advisory.advisory_result_ttl_steps,
        ) {
            trace!(agent_id = %query.agent_id, "identical candidate set recently scored, skipping");
            return;
        }

        let mut submitted = HashMap::with_capacity(ranked.len());
        let candidates: Vec<ScoreCandidate> = ranked
            .into_iter()
            .map(|c| {
                let key = EventKey::of(&c.event);
                let factor = muffling
                    .get(&key)
                    .copied()
                    .or_else(|| self.cached_muffling(query, &c.event, step))
                    .unwrap_or(1.0);
                submitted.insert(
                    c.event.event_id.clone(),
                    SubmittedCandidate {
                        key,
                        range: c.event.range * factor,
                        weight: c.event.weight * factor,
                    },
                );
                ScoreCandidate {
                    event_id: c.event.event_id,
                    position: c.event.position.center(),
                    occurred_at_step: c.event.occurred_at_step,
                    range: c.event.range,
                    weight: c.event.weight,
                    muffling_factor: factor,
                }
            })
            .collect();

        let request = ScoreRequest {
            agent_id: query.agent_id,
            position: query.eye_position,
            current_step: step,
            current_event_id: query.current_event_id.clone(),
            candidates,
            switch_ratio: settings.scoring.switch_ratio,
            novelty_bonus: settings.store.novelty_bonus,
            novelty_window: u64::from(settings.store.novelty_window_steps),
        };
        match scheduler.submit_score_compute(vec![request]) {
            Ok(()) => self.advisory.record_submission(query.agent_id, hash, step, submitted),
            Err(e) => debug!(agent_id = %query.agent_id, error = %e, "score submission failed"),
        }
    }

    fn cached_muffling(&self, query: &AgentQuery, event: &StimulusEvent, step: u64) -> Option<f64> {
        let key = RaycastKey {
            world_id: event.world_id.clone(),
            event_id: event.event_id.clone(),
            listener: query.eye_position.block(),
            source: event.position,
        };
        let factors = self.attenuation.peek(&key, step)?;
        Some(factors.weight.clamp(0.0, 1.0))
    }
}

impl std::fmt::Debug for SpatialStimulusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialStimulusStore")
            .field("events", &self.len())
            .field("step", &self.current_step())
            .field("advisory_entries", &self.advisory.len())
            .field("attenuation", &self.attenuation)
            .finish_non_exhaustive()
    }
}

/// Turn a raw emission into an event, or `None` if any field is unusable.
fn validate(request: &EmitRequest) -> Option<StimulusEvent> {
    let Some(type_id) = EventTypeId::parse(&request.type_id) else {
        debug!(type_id = %request.type_id, "rejecting event with invalid type id");
        return None;
    };
    let Some(world_id) = WorldId::parse(&request.world_id) else {
        debug!(world_id = %request.world_id, "rejecting event with invalid world id");
        return None;
    };
    let event_id = match request.event_id.as_deref() {
        Some(raw) => {
            let Some(id) = EventId::parse(raw) else {
                debug!(event_id = raw, "rejecting event with invalid event id");
                return None;
            };
            id
        }
        None => EventId::derive(&type_id, request.metadata.as_deref()),
    };
    let usable = |v: f64| v.is_finite() && v > 0.0;
    if !usable(request.range) || !usable(request.weight) || request.lifetime_steps <= 0 {
        debug!(
            type_id = %type_id,
            range = request.range,
            weight = request.weight,
            lifetime = request.lifetime_steps,
            "rejecting event with non-positive range, weight, or lifetime"
        );
        return None;
    }
    Some(StimulusEvent {
        event_id,
        type_id,
        position: request.position,
        world_id,
        range: request.range,
        weight: request.weight,
        ticks_remaining: request.lifetime_steps,
        lifetime: request.lifetime_steps,
        occurred_at_step: 0,
        is_virtual: request.is_virtual,
        source_agent_id: request.source_agent_id,
    })
}

//! The authoritative per-step driver.
//!
//! [`StimulusRuntime`] owns the store, the compute scheduler, and the
//! main-thread bridge, and runs them in a fixed order each step:
//!
//! 1. **Advisory intake** -- drain finished scoring results into the
//!    advisory cache.
//! 2. **Decay** -- tick the store (event countdown, dedup window, cache
//!    maintenance).
//! 3. **Lookup** -- `find_best` for every alive agent.
//! 4. **Clustering** -- submit a group job for each world whose interval
//!    has elapsed.
//! 5. **Group intake** -- drain finished clustering results into the
//!    summary, where the host consumes them once.
//! 6. **Bridge** -- run queued callbacks within the step budget.
//!
//! Producers never go through the runtime; they hold a clone of
//! [`StimulusRuntime::store`] and call `add_event` from their own threads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use stimulus_types::{
    AgentId, AgentSnapshot, EventId, GroupComputeResult, StimulusEvent, Vec3, WorldId,
};
use tracing::{debug, info, warn};

use crate::attenuation::{AttenuationEngine, ObstructionQuery};
use crate::bridge::{DrainReport, MainThreadBridge};
use crate::config::{ConfigError, StimulusConfig};
use crate::scheduler::{ComputeScheduler, SchedulerManager};
use crate::store::{AgentQuery, SpatialStimulusStore, TickReport};

/// What the host tells the runtime about one agent each step.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentState {
    /// Agent identifier.
    pub id: AgentId,
    /// World the agent is in.
    pub world_id: WorldId,
    /// Feet position.
    pub position: Vec3,
    /// Listening position.
    pub eye_position: Vec3,
    /// Current health.
    pub health: f64,
    /// Dead agents are skipped.
    pub alive: bool,
    /// Event the agent is reacting to, if any.
    pub current_event_id: Option<EventId>,
}

impl AgentState {
    fn query(&self) -> AgentQuery {
        AgentQuery {
            agent_id: self.id,
            world_id: self.world_id.clone(),
            position: self.position,
            eye_position: self.eye_position,
            current_event_id: self.current_event_id.clone(),
        }
    }

    const fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            position: self.position,
            health: self.health,
            alive: self.alive,
        }
    }
}

/// Everything that happened in one step.
#[derive(Debug, Clone)]
pub struct StepSummary {
    /// Store maintenance counters.
    pub tick: TickReport,
    /// Scoring results folded into the advisory cache.
    pub score_results_applied: usize,
    /// Best event per agent; agents with nothing in reach are absent.
    pub picks: BTreeMap<AgentId, StimulusEvent>,
    /// Worlds a clustering job was submitted for.
    pub group_jobs_submitted: usize,
    /// Clustering results that finished since the last step.
    pub groups: Vec<GroupComputeResult>,
    /// Bridge drain outcome.
    pub bridge: DrainReport,
}

/// Drives the store, scheduler, and bridge from the authoritative thread.
pub struct StimulusRuntime {
    config: StimulusConfig,
    store: Arc<SpatialStimulusStore>,
    scheduler: Arc<SchedulerManager>,
    bridge: Arc<MainThreadBridge>,
    last_group_step: HashMap<WorldId, u64>,
}

impl StimulusRuntime {
    /// Build a runtime with a local scheduler and a step-end-only bridge.
    pub fn new(config: StimulusConfig, obstruction: Arc<dyn ObstructionQuery>) -> Self {
        let attenuation = AttenuationEngine::new(obstruction, &config.attenuation);
        Self {
            store: Arc::new(SpatialStimulusStore::new(&config, attenuation)),
            scheduler: Arc::new(SchedulerManager::new(&config.scheduler)),
            bridge: Arc::new(MainThreadBridge::new(&config.bridge)),
            last_group_step: HashMap::new(),
            config,
        }
    }

    /// Replace the compute scheduler, e.g. one with an external executor.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerManager) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    /// Replace the attenuation engine, e.g. one with an external cache.
    #[must_use]
    pub fn with_attenuation(mut self, attenuation: AttenuationEngine) -> Self {
        self.store = Arc::new(SpatialStimulusStore::new(&self.config, attenuation));
        self
    }

    /// Replace the bridge, e.g. one with a drain scheduler.
    #[must_use]
    pub fn with_bridge(mut self, bridge: MainThreadBridge) -> Self {
        self.bridge = Arc::new(bridge);
        self
    }

    /// The store, for producers.
    pub fn store(&self) -> Arc<SpatialStimulusStore> {
        Arc::clone(&self.store)
    }

    /// The compute scheduler.
    pub fn scheduler(&self) -> Arc<SchedulerManager> {
        Arc::clone(&self.scheduler)
    }

    /// The main-thread bridge, for background callers.
    pub fn bridge(&self) -> Arc<MainThreadBridge> {
        Arc::clone(&self.bridge)
    }

    /// The active configuration.
    pub const fn config(&self) -> &StimulusConfig {
        &self.config
    }

    /// Run one authoritative step.
    pub fn step(&mut self, agents: &[AgentState]) -> StepSummary {
        let scheduler = Arc::clone(&self.scheduler);

        let score_results_applied = self
            .store
            .apply_score_results(scheduler.drain_score_results());
        let tick = self.store.tick();

        let mut picks = BTreeMap::new();
        for agent in agents.iter().filter(|a| a.alive) {
            if let Some(event) = self.store.find_best(&agent.query(), scheduler.as_ref()) {
                picks.insert(agent.id, event);
            }
        }

        let group_jobs_submitted = self.submit_groups(tick.step, agents);
        let groups = scheduler.drain_group_results();
        let bridge = self.bridge.on_step_end();

        debug!(
            step = tick.step,
            events = tick.remaining,
            picks = picks.len(),
            groups = groups.len(),
            "step complete"
        );
        StepSummary {
            tick,
            score_results_applied,
            picks,
            group_jobs_submitted,
            groups,
            bridge,
        }
    }

    /// Submit a clustering job for every world that is due.
    fn submit_groups(&mut self, step: u64, agents: &[AgentState]) -> usize {
        let interval = self.config.scheduler.group_interval_steps;
        let mut by_world: BTreeMap<&WorldId, Vec<AgentSnapshot>> = BTreeMap::new();
        for agent in agents {
            by_world
                .entry(&agent.world_id)
                .or_default()
                .push(agent.snapshot());
        }

        let mut submitted = 0_usize;
        for (world, snapshots) in by_world {
            let due = self
                .last_group_step
                .get(world)
                .is_none_or(|last| step.saturating_sub(*last) >= interval);
            if !due {
                continue;
            }
            match self.scheduler.submit_group_compute(
                world.clone(),
                snapshots,
                self.config.clustering.clone(),
            ) {
                Ok(()) => {
                    self.last_group_step.insert(world.clone(), step);
                    submitted = submitted.saturating_add(1);
                }
                Err(e) => warn!(world = %world, error = %e, "group submission failed"),
            }
        }
        submitted
    }

    /// Validate and apply a new configuration.
    ///
    /// Store settings, attenuation settings, and bridge budgets change in
    /// place. The scheduler is rebuilt on next use; queued results survive.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] and leaves the runtime unchanged if
    /// the configuration is out of range.
    pub fn reload(&mut self, config: StimulusConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.store.reconfigure(&config);
        self.scheduler.rebuild(&config.scheduler);
        self.bridge.reconfigure(&config.bridge);
        self.config = config;
        info!(
            max_events = self.config.store.max_events_tracked,
            backend = ?self.config.scheduler.backend,
            "stimulus configuration reloaded"
        );
        Ok(())
    }
}

impl std::fmt::Debug for StimulusRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StimulusRuntime")
            .field("store", &self.store)
            .field("scheduler", &self.scheduler)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::{Duration, Instant};

    use stimulus_types::{EmitRequest, IntVec3};

    use super::*;
    use crate::attenuation::OpenField;

    fn agent(x: f64, health: f64) -> AgentState {
        AgentState {
            id: AgentId::new(),
            world_id: WorldId::parse("overworld").unwrap(),
            position: Vec3::new(x, 64.0, 0.5),
            eye_position: Vec3::new(x, 64.5, 0.5),
            health,
            alive: true,
            current_event_id: None,
        }
    }

    fn runtime() -> StimulusRuntime {
        StimulusRuntime::new(StimulusConfig::default(), Arc::new(OpenField))
    }

    /// Step until clustering results arrive or a second passes.
    fn step_until_groups(runtime: &mut StimulusRuntime, agents: &[AgentState]) -> Vec<GroupComputeResult> {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(1) {
            let summary = runtime.step(agents);
            if !summary.groups.is_empty() {
                return summary.groups;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Vec::new()
    }

    #[test]
    fn step_picks_for_alive_agents_only() {
        let mut runtime = runtime();
        let store = runtime.store();
        assert!(
            store
                .add_event(EmitRequest::new("bell", IntVec3::new(0, 64, 0), "overworld", 16.0, 1.0, 20))
                .is_stored()
        );
        let near = agent(4.5, 10.0);
        let mut dead = agent(3.5, 10.0);
        dead.alive = false;

        let summary = runtime.step(&[near.clone(), dead.clone()]);
        assert_eq!(summary.tick.step, 1);
        assert!(summary.picks.contains_key(&near.id));
        assert!(!summary.picks.contains_key(&dead.id));
    }

    #[test]
    fn group_results_arrive_in_a_later_summary() {
        let mut runtime = runtime();
        let leader = agent(0.5, 20.0);
        let follower = agent(3.5, 5.0);
        let groups = step_until_groups(&mut runtime, &[leader.clone(), follower.clone()]);
        let result = groups.first().unwrap();
        assert_eq!(result.agent_id_to_leader_id.get(&follower.id), Some(&leader.id));
    }

    #[test]
    fn groups_are_submitted_once_per_interval() {
        let mut config = StimulusConfig::default();
        config.scheduler.group_interval_steps = 3;
        let mut runtime = StimulusRuntime::new(config, Arc::new(OpenField));
        let agents = [agent(0.5, 1.0)];

        let submitted: Vec<usize> = (0..7)
            .map(|_| runtime.step(&agents).group_jobs_submitted)
            .collect();
        assert_eq!(submitted, [1, 0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn bridge_tasks_run_at_step_end() {
        let mut runtime = runtime();
        let bridge = runtime.bridge();
        bridge.submit(|| Ok(()));
        bridge.submit(|| Err(anyhow::anyhow!("nope")));
        let summary = runtime.step(&[]);
        assert_eq!(summary.bridge.succeeded, 1);
        assert_eq!(summary.bridge.failed, 1);
    }

    #[test]
    fn invalid_reload_is_rejected_without_changes() {
        let mut runtime = runtime();
        let mut bad = StimulusConfig::default();
        bad.store.max_events_tracked = 0;
        assert!(matches!(runtime.reload(bad), Err(ConfigError::Invalid { .. })));
        assert_eq!(runtime.config(), &StimulusConfig::default());

        let mut good = StimulusConfig::default();
        good.scheduler.worker_threads = 1;
        runtime.reload(good.clone()).unwrap();
        assert_eq!(runtime.config(), &good);
        assert!(runtime.scheduler().active_name().is_none());
    }
}

//! Stimulus engine demonstration binary.
//!
//! Wires the perception engine to a walled demo world: producer threads
//! emit sound events into the shared store while the step loop ticks the
//! store, picks the best audible event for every agent, and walks agents
//! toward what they heard.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration from `stimulus-config.yaml`
//! 3. Build the walled demo world
//! 4. Build the compute scheduler (external executor when configured)
//! 5. Assemble the runtime and spawn agents
//! 6. Start producer threads and the bridge heartbeat
//! 7. Run the step loop
//! 8. Shut down and log the result

mod demo;
mod error;
mod executor;
mod producer;
mod world;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stimulus_core::config::{SchedulerBackend, StimulusConfig};
use stimulus_core::runtime::StimulusRuntime;
use stimulus_core::scheduler::SchedulerManager;
use tokio::runtime::Handle;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::executor::TokioExecutor;
use crate::producer::Producers;
use crate::world::WalledWorld;

/// Configuration file looked up in the working directory.
const CONFIG_PATH: &str = "stimulus-config.yaml";

/// Steps between progress log lines.
const REPORT_EVERY_STEPS: u64 = 50;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration is invalid or a producer thread
/// cannot be started or panics.
#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("stimulus-engine starting");

    // 2. Load configuration.
    let config = load_config()?;
    let demo = demo::load_demo_config(Path::new(CONFIG_PATH))?;
    info!(
        max_events_tracked = config.store.max_events_tracked,
        backend = ?config.scheduler.backend,
        worker_threads = config.scheduler.worker_threads,
        agents = demo.agents,
        producers = demo.producers,
        steps = demo.steps,
        "Configuration loaded"
    );

    // 3. Build the demo world.
    let world_id = demo.world()?;
    let world = WalledWorld::new(world_id.clone(), demo.wall_spacing);
    let floor_y = world.floor_y();
    info!(
        world = %world_id,
        wall_spacing = demo.wall_spacing,
        world_size = demo.world_size,
        "Demo world created"
    );

    // 4. Build the compute scheduler.
    let mut scheduler = SchedulerManager::new(&config.scheduler);
    if config.scheduler.backend == SchedulerBackend::External {
        let executor = TokioExecutor::new(Handle::current(), config.scheduler.worker_threads.max(1));
        scheduler = scheduler.with_external_executor(Arc::new(executor), Handle::current());
        info!("External executor registered");
    }

    // 5. Assemble the runtime and agents.
    let mut runtime = StimulusRuntime::new(config, Arc::new(world)).with_scheduler(scheduler);
    let mut agents = demo::spawn_agents(&demo, &world_id, floor_y);
    info!(agents = agents.len(), "Agents spawned");

    // 6. Start producers and a heartbeat that reports through the bridge.
    let producers = Producers::spawn(&demo, &runtime.store(), floor_y)?;
    let heartbeat = {
        let bridge = runtime.bridge();
        let store = runtime.store();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await;
            loop {
                interval.tick().await;
                let store = Arc::clone(&store);
                bridge.submit(move || {
                    info!(
                        step = store.current_step(),
                        events = store.len(),
                        "Store heartbeat"
                    );
                    Ok(())
                });
            }
        })
    };

    // 7. Run the step loop.
    let mut interval = tokio::time::interval(Duration::from_millis(demo.step_interval_ms));
    let mut rng = rand::rng();
    let mut picks_total: u64 = 0;
    let mut groups_total: u64 = 0;

    for step in 1..=demo.steps {
        interval.tick().await;
        let summary = runtime.step(&agents);
        demo::move_agents(&mut agents, &summary.picks, demo.world_size, &mut rng);

        picks_total = picks_total.saturating_add(u64::try_from(summary.picks.len()).unwrap_or(u64::MAX));
        for groups in &summary.groups {
            groups_total = groups_total.saturating_add(1);
            debug!(
                world = %groups.world_id,
                leaders = groups.leaders().count(),
                deserted = groups.deserted_agent_ids.len(),
                "Clustering result received"
            );
        }

        if step.checked_rem(REPORT_EVERY_STEPS) == Some(0) {
            info!(
                step = summary.tick.step,
                events = summary.tick.remaining,
                expired = summary.tick.expired,
                picks = summary.picks.len(),
                advisory_applied = summary.score_results_applied,
                scheduler = runtime.scheduler().active_name(),
                bridge_ran = summary.bridge.ran(),
                "Step report"
            );
        }
    }

    // 8. Shut down.
    heartbeat.abort();
    let emitted = producers.emitted();
    let accepted = producers.accepted();
    producers.shutdown()?;
    let leftover = runtime.bridge().drain();

    info!(
        steps = demo.steps,
        emitted,
        accepted,
        picks_total,
        groups_total,
        bridge_leftover = leftover.ran(),
        "stimulus-engine shutdown complete"
    );

    Ok(())
}

/// Load the engine configuration from `stimulus-config.yaml`.
///
/// Looks for the config file relative to the current working directory.
fn load_config() -> Result<StimulusConfig, EngineError> {
    let config_path = Path::new(CONFIG_PATH);
    if config_path.exists() {
        Ok(StimulusConfig::from_file(config_path)?)
    } else {
        info!("Config file not found, using defaults");
        let mut config = StimulusConfig::default();
        config.scheduler.apply_env_overrides();
        Ok(config)
    }
}

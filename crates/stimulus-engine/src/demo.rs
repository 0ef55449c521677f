//! Demo run configuration and agent movement.
//!
//! The `demo` section of `stimulus-config.yaml` sizes the demonstration:
//! how many agents wander the walled world, how many producer threads emit
//! events, and how long the step loop runs. Agents walk one block per step
//! toward the event they picked and wander randomly otherwise.

use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use serde::Deserialize;
use stimulus_core::runtime::AgentState;
use stimulus_types::{AgentId, StimulusEvent, Vec3, WorldId};

use crate::error::EngineError;

/// Height of an agent's ears above its feet.
const EYE_HEIGHT: f64 = 1.62;

/// Blocks an agent moves per step toward its target.
const WALK_SPEED: f64 = 1.0;

// -----------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------

/// Sizing of the demonstration run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DemoConfig {
    /// Name of the demo world.
    #[serde(default = "default_world_id")]
    pub world_id: String,

    /// Agents placed in the world.
    #[serde(default = "default_agents")]
    pub agents: usize,

    /// Producer threads emitting events.
    #[serde(default = "default_producers")]
    pub producers: usize,

    /// Steps to run before shutting down.
    #[serde(default = "default_steps")]
    pub steps: u64,

    /// Wall-clock interval between steps.
    #[serde(default = "default_step_interval_ms")]
    pub step_interval_ms: u64,

    /// Events each producer emits per interval.
    #[serde(default = "default_events_per_producer_step")]
    pub events_per_producer_step: usize,

    /// Side length of the square play area in blocks.
    #[serde(default = "default_world_size")]
    pub world_size: i32,

    /// Blocks between parallel walls.
    #[serde(default = "default_wall_spacing")]
    pub wall_spacing: i32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            world_id: default_world_id(),
            agents: default_agents(),
            producers: default_producers(),
            steps: default_steps(),
            step_interval_ms: default_step_interval_ms(),
            events_per_producer_step: default_events_per_producer_step(),
            world_size: default_world_size(),
            wall_spacing: default_wall_spacing(),
        }
    }
}

impl DemoConfig {
    /// The demo world's identifier.
    pub fn world(&self) -> Result<WorldId, EngineError> {
        WorldId::parse(&self.world_id).ok_or_else(|| EngineError::Demo {
            message: format!("invalid world id {:?}", self.world_id),
        })
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.world_size < 1 {
            return Err(EngineError::Demo {
                message: String::from("world_size must be at least 1"),
            });
        }
        if self.wall_spacing < 2 {
            return Err(EngineError::Demo {
                message: String::from("wall_spacing must be at least 2"),
            });
        }
        if self.step_interval_ms == 0 {
            return Err(EngineError::Demo {
                message: String::from("step_interval_ms must be positive"),
            });
        }
        self.world().map(|_| ())
    }
}

fn default_world_id() -> String {
    String::from("demo")
}

const fn default_agents() -> usize {
    40
}

const fn default_producers() -> usize {
    4
}

const fn default_steps() -> u64 {
    400
}

const fn default_step_interval_ms() -> u64 {
    50
}

const fn default_events_per_producer_step() -> usize {
    3
}

const fn default_world_size() -> i32 {
    96
}

const fn default_wall_spacing() -> i32 {
    16
}

/// Load the `demo` section from the YAML file at `path`.
///
/// A missing file or a file without a `demo` key yields defaults.
pub fn load_demo_config(path: &Path) -> Result<DemoConfig, EngineError> {
    if !path.exists() {
        return Ok(DemoConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| EngineError::Demo {
        message: format!("failed to read config file: {e}"),
    })?;

    // Parse the full YAML and extract just the "demo" section.
    let raw: serde_yml::Value = serde_yml::from_str(&contents).map_err(|e| EngineError::Demo {
        message: format!("failed to parse config YAML: {e}"),
    })?;
    let config = match raw.get("demo") {
        Some(value) => {
            serde_yml::from_value(value.clone()).map_err(|e| EngineError::Demo {
                message: format!("failed to parse demo config: {e}"),
            })?
        }
        None => DemoConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

// -----------------------------------------------------------------------
// Agents
// -----------------------------------------------------------------------

/// Place `config.agents` agents uniformly over the play area.
pub fn spawn_agents(config: &DemoConfig, world_id: &WorldId, floor_y: i32) -> Vec<AgentState> {
    let mut rng = rand::rng();
    let size = f64::from(config.world_size);
    (0..config.agents)
        .map(|_| {
            let position = Vec3::new(
                rng.random_range(0.0..size),
                f64::from(floor_y),
                rng.random_range(0.0..size),
            );
            AgentState {
                id: AgentId::new(),
                world_id: world_id.clone(),
                position,
                eye_position: eye(position),
                health: rng.random_range(5.0..20.0),
                alive: true,
                current_event_id: None,
            }
        })
        .collect()
}

/// Walk every alive agent toward its pick, or wander without one.
pub fn move_agents(
    agents: &mut [AgentState],
    picks: &BTreeMap<AgentId, StimulusEvent>,
    world_size: i32,
    rng: &mut impl Rng,
) {
    let max = f64::from(world_size);
    for agent in agents.iter_mut().filter(|a| a.alive) {
        let pick = picks.get(&agent.id);
        let (dx, dz) = match pick {
            Some(event) => {
                let target = event.position.center();
                let (dx, dz) = (target.x - agent.position.x, target.z - agent.position.z);
                let length = dx.hypot(dz);
                if length <= WALK_SPEED {
                    (dx, dz)
                } else {
                    (dx / length * WALK_SPEED, dz / length * WALK_SPEED)
                }
            }
            None => (rng.random_range(-0.5..0.5), rng.random_range(-0.5..0.5)),
        };
        agent.position = Vec3::new(
            (agent.position.x + dx).clamp(0.0, max),
            agent.position.y,
            (agent.position.z + dz).clamp(0.0, max),
        );
        agent.eye_position = eye(agent.position);
        agent.current_event_id = pick.map(|e| e.event_id.clone());
    }
}

fn eye(feet: Vec3) -> Vec3 {
    Vec3::new(feet.x, feet.y + EYE_HEIGHT, feet.z)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use stimulus_types::{EventId, EventTypeId, IntVec3};

    use super::*;

    #[test]
    fn demo_section_fills_defaults() {
        let config: DemoConfig = serde_yml::from_str("agents: 3\nsteps: 10\n").unwrap();
        assert_eq!(config.agents, 3);
        assert_eq!(config.steps, 10);
        assert_eq!(config.world_size, default_world_size());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_demo_values_are_rejected() {
        let config = DemoConfig {
            wall_spacing: 1,
            ..DemoConfig::default()
        };
        assert!(config.validate().is_err());
        let config = DemoConfig {
            world_id: String::from("  "),
            ..DemoConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn agents_walk_toward_their_pick() {
        let world = WorldId::parse("demo").unwrap();
        let config = DemoConfig {
            agents: 1,
            ..DemoConfig::default()
        };
        let mut agents = spawn_agents(&config, &world, 64);
        let agent = agents.first_mut().unwrap();
        agent.position = Vec3::new(10.0, 64.0, 0.5);

        let event = StimulusEvent {
            event_id: EventId::parse("bell").unwrap(),
            type_id: EventTypeId::parse("bell").unwrap(),
            position: IntVec3::new(0, 64, 0),
            world_id: world,
            range: 16.0,
            weight: 1.0,
            ticks_remaining: 10,
            lifetime: 10,
            occurred_at_step: 0,
            is_virtual: false,
            source_agent_id: None,
        };
        let id = agents.first().unwrap().id;
        let picks = BTreeMap::from([(id, event)]);
        move_agents(&mut agents, &picks, 96, &mut rand::rng());

        let moved = agents.first().unwrap();
        assert!((moved.position.x - 9.0).abs() < 1e-9);
        assert_eq!(moved.current_event_id.as_ref().map(EventId::as_str), Some("bell"));
        assert!((moved.eye_position.y - (64.0 + EYE_HEIGHT)).abs() < 1e-9);
    }
}

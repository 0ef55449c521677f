//! Configuration loading and typed config structures.
//!
//! The canonical configuration lives in `stimulus-config.yaml`. This module
//! defines strongly-typed structs that mirror the YAML structure, a loader,
//! and [`StimulusConfig::validate`] which the runtime calls on startup and on
//! every reload.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use stimulus_types::{CELL_SIZE, GroupConfig};

use crate::attenuation::Material;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid configuration: {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StimulusConfig {
    /// Spatial store limits and freshness scoring.
    #[serde(default)]
    pub store: StoreConfig,

    /// Advisory (asynchronous) decision handoff.
    #[serde(default)]
    pub advisory: AdvisoryConfig,

    /// Obstruction attenuation and its cache.
    #[serde(default)]
    pub attenuation: AttenuationConfig,

    /// Background compute scheduling.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Leader/follower clustering parameters.
    #[serde(default)]
    pub clustering: GroupConfig,

    /// Asynchronous re-scoring parameters.
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Main-thread bridge drain budget.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Event type filtering.
    #[serde(default)]
    pub event_types: EventTypesConfig,
}

impl StimulusConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values for the scheduler:
    /// - `STIMULUS_SCHEDULER_BACKEND` overrides `scheduler.backend`
    /// - `STIMULUS_WORKER_THREADS` overrides `scheduler.worker_threads`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.scheduler.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Check every value the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.store;
        ensure(s.max_events_tracked > 0, "store.max_events_tracked", "must be at least 1")?;
        ensure(
            s.large_range_threshold > 0.0 && s.large_range_threshold <= CELL_SIZE,
            "store.large_range_threshold",
            format!("must be in (0, {CELL_SIZE}]"),
        )?;
        ensure(
            s.novelty_bonus.is_finite() && s.novelty_bonus >= 0.0,
            "store.novelty_bonus",
            "must be finite and non-negative",
        )?;

        let a = &self.advisory;
        ensure(a.shortlist_size > 0, "advisory.shortlist_size", "must be at least 1")?;
        ensure(a.max_async_candidates > 0, "advisory.max_async_candidates", "must be at least 1")?;

        let at = &self.attenuation;
        ensure(at.max_segments > 0, "attenuation.max_segments", "must be at least 1")?;
        ensure(
            at.raycast_cache_capacity > 0,
            "attenuation.raycast_cache_capacity",
            "must be at least 1",
        )?;
        for factor in at.material_factors.values() {
            ensure(
                (0.0..=1.0).contains(factor),
                "attenuation.material_factors",
                "every factor must be in [0, 1]",
            )?;
        }

        let sc = &self.scheduler;
        ensure(sc.worker_threads > 0, "scheduler.worker_threads", "must be at least 1")?;
        ensure(sc.queue_capacity > 0, "scheduler.queue_capacity", "must be at least 1")?;
        ensure(sc.group_interval_steps > 0, "scheduler.group_interval_steps", "must be at least 1")?;

        let c = &self.clustering;
        ensure(
            c.group_radius.is_finite() && c.group_radius > 0.0,
            "clustering.group_radius",
            "must be positive",
        )?;
        ensure(
            c.leader_spacing_multiplier.is_finite() && c.leader_spacing_multiplier >= 0.0,
            "clustering.leader_spacing_multiplier",
            "must be non-negative",
        )?;

        ensure(
            self.scoring.switch_ratio.is_finite() && self.scoring.switch_ratio >= 0.0,
            "scoring.switch_ratio",
            "must be finite and non-negative",
        )?;

        let b = &self.bridge;
        ensure(b.max_tasks_per_step > 0, "bridge.max_tasks_per_step", "must be at least 1")?;
        ensure(
            b.step_budget_ms.is_finite() && b.step_budget_ms > 0.0,
            "bridge.step_budget_ms",
            "must be positive",
        )?;
        Ok(())
    }
}

fn ensure(ok: bool, field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: reason.into(),
        })
    }
}

/// Spatial store configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of events held at once.
    #[serde(default = "default_max_events_tracked")]
    pub max_events_tracked: usize,

    /// Events with a range above this bypass the grid.
    #[serde(default = "default_large_range_threshold")]
    pub large_range_threshold: f64,

    /// Score bonus for events inside their novelty window.
    #[serde(default = "default_novelty_bonus")]
    pub novelty_bonus: f64,

    /// Steps after emission an event counts as novel.
    #[serde(default = "default_novelty_window_steps")]
    pub novelty_window_steps: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_events_tracked: default_max_events_tracked(),
            large_range_threshold: default_large_range_threshold(),
            novelty_bonus: default_novelty_bonus(),
            novelty_window_steps: default_novelty_window_steps(),
        }
    }
}

/// Advisory decision handoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdvisoryConfig {
    /// Steps an asynchronous pick stays authoritative.
    #[serde(default = "default_advisory_result_ttl_steps")]
    pub advisory_result_ttl_steps: u64,

    /// Steps before an identical candidate set is resubmitted.
    #[serde(default = "default_submit_cooldown_steps")]
    pub submit_cooldown_steps: u64,

    /// Size of the synchronous top-K shortlist.
    #[serde(default = "default_shortlist_size")]
    pub shortlist_size: usize,

    /// Maximum candidates submitted for asynchronous scoring.
    #[serde(default = "default_max_async_candidates")]
    pub max_async_candidates: usize,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            advisory_result_ttl_steps: default_advisory_result_ttl_steps(),
            submit_cooldown_steps: default_submit_cooldown_steps(),
            shortlist_size: default_shortlist_size(),
            max_async_candidates: default_max_async_candidates(),
        }
    }
}

/// Obstruction attenuation configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttenuationConfig {
    /// Maximum obstructing segments visited per ray.
    #[serde(default = "default_max_segments")]
    pub max_segments: u32,

    /// Steps a cached attenuation stays valid.
    #[serde(default = "default_raycast_cache_ttl_steps")]
    pub raycast_cache_ttl_steps: u64,

    /// Maximum entries in the local attenuation cache.
    #[serde(default = "default_raycast_cache_capacity")]
    pub raycast_cache_capacity: usize,

    /// Multiplicative factor applied per obstructing segment.
    #[serde(default = "default_material_factors")]
    pub material_factors: BTreeMap<Material, f64>,
}

impl Default for AttenuationConfig {
    fn default() -> Self {
        Self {
            max_segments: default_max_segments(),
            raycast_cache_ttl_steps: default_raycast_cache_ttl_steps(),
            raycast_cache_capacity: default_raycast_cache_capacity(),
            material_factors: default_material_factors(),
        }
    }
}

/// Which compute scheduler implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerBackend {
    /// In-process worker pool.
    #[default]
    Local,
    /// External task executor, with the local pool as fallback.
    External,
}

/// Background compute scheduling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerConfig {
    /// Preferred implementation.
    #[serde(default)]
    pub backend: SchedulerBackend,

    /// Local worker threads.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Queued jobs before the oldest is discarded.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Wall-clock budget per job.
    #[serde(default = "default_job_budget_ms")]
    pub job_budget_ms: u64,

    /// Time allowed for an external submission before falling back.
    #[serde(default = "default_external_timeout_ms")]
    pub external_timeout_ms: u64,

    /// Steps between clustering submissions per world.
    #[serde(default = "default_group_interval_steps")]
    pub group_interval_steps: u64,
}

impl SchedulerConfig {
    /// Override scheduler settings with environment variables when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STIMULUS_SCHEDULER_BACKEND") {
            match val.trim().to_ascii_lowercase().as_str() {
                "local" => self.backend = SchedulerBackend::Local,
                "external" => self.backend = SchedulerBackend::External,
                other => tracing::warn!(value = other, "ignoring unknown scheduler backend"),
            }
        }
        if let Ok(val) = std::env::var("STIMULUS_WORKER_THREADS") {
            match val.trim().parse::<usize>() {
                Ok(threads) => self.worker_threads = threads,
                Err(e) => tracing::warn!(error = %e, "ignoring invalid worker thread count"),
            }
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backend: SchedulerBackend::Local,
            worker_threads: default_worker_threads(),
            queue_capacity: default_queue_capacity(),
            job_budget_ms: default_job_budget_ms(),
            external_timeout_ms: default_external_timeout_ms(),
            group_interval_steps: default_group_interval_steps(),
        }
    }
}

/// Asynchronous scoring configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoringConfig {
    /// An alternative must reach `current * switch_ratio` to replace the
    /// current target.
    #[serde(default = "default_switch_ratio")]
    pub switch_ratio: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            switch_ratio: default_switch_ratio(),
        }
    }
}

/// Main-thread bridge configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeConfig {
    /// Maximum callbacks run per drain.
    #[serde(default = "default_max_tasks_per_step")]
    pub max_tasks_per_step: usize,

    /// Wall-clock budget per drain in milliseconds.
    #[serde(default = "default_step_budget_ms")]
    pub step_budget_ms: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_step: default_max_tasks_per_step(),
            step_budget_ms: default_step_budget_ms(),
        }
    }
}

/// Event type filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventTypesConfig {
    /// When set, only these event types are stored and considered.
    #[serde(default)]
    pub allow_list: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_max_events_tracked() -> usize {
    512
}

const fn default_large_range_threshold() -> f64 {
    16.0
}

const fn default_novelty_bonus() -> f64 {
    0.5
}

const fn default_novelty_window_steps() -> u32 {
    10
}

const fn default_advisory_result_ttl_steps() -> u64 {
    10
}

const fn default_submit_cooldown_steps() -> u64 {
    5
}

const fn default_shortlist_size() -> usize {
    24
}

const fn default_max_async_candidates() -> usize {
    64
}

const fn default_max_segments() -> u32 {
    8
}

const fn default_raycast_cache_ttl_steps() -> u64 {
    20
}

const fn default_raycast_cache_capacity() -> usize {
    4096
}

fn default_material_factors() -> BTreeMap<Material, f64> {
    BTreeMap::from([
        (Material::Air, 1.0),
        (Material::Foliage, 0.85),
        (Material::Glass, 0.8),
        (Material::Liquid, 0.7),
        (Material::Wood, 0.6),
        (Material::Stone, 0.4),
        (Material::Metal, 0.5),
        (Material::Wool, 0.2),
        (Material::Other, 0.5),
    ])
}

const fn default_worker_threads() -> usize {
    2
}

const fn default_queue_capacity() -> usize {
    64
}

const fn default_job_budget_ms() -> u64 {
    20
}

const fn default_external_timeout_ms() -> u64 {
    50
}

const fn default_group_interval_steps() -> u64 {
    20
}

const fn default_switch_ratio() -> f64 {
    1.25
}

const fn default_max_tasks_per_step() -> usize {
    64
}

const fn default_step_budget_ms() -> f64 {
    0.5
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StimulusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.max_events_tracked, 512);
        assert_eq!(config.advisory.shortlist_size, 24);
        assert_eq!(config.advisory.max_async_candidates, 64);
        assert_eq!(config.clustering, GroupConfig::default());
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r"
store:
  max_events_tracked: 32
  large_range_threshold: 12.0
  novelty_bonus: 1.0
  novelty_window_steps: 4

advisory:
  advisory_result_ttl_steps: 6
  submit_cooldown_steps: 2

attenuation:
  max_segments: 3
  raycast_cache_ttl_steps: 40
  material_factors:
    stone: 0.25
    wool: 0.1

scheduler:
  worker_threads: 4
  job_budget_ms: 5
  group_interval_steps: 10

clustering:
  group_radius: 12.0
  max_leaders: 3

scoring:
  switch_ratio: 1.5

bridge:
  max_tasks_per_step: 8
  step_budget_ms: 1.0

event_types:
  allow_list:
    - footstep
    - explosion
";

        let config = StimulusConfig::parse(yaml).unwrap();
        assert_eq!(config.store.max_events_tracked, 32);
        assert_eq!(config.advisory.submit_cooldown_steps, 2);
        assert_eq!(config.attenuation.max_segments, 3);
        assert_eq!(config.attenuation.material_factors.get(&Material::Wool), Some(&0.1));
        assert_eq!(config.clustering.max_leaders, 3);
        assert_eq!(config.clustering.num_sectors, 8);
        assert_eq!(config.bridge.max_tasks_per_step, 8);
        assert_eq!(
            config.event_types.allow_list,
            Some(vec!["footstep".to_owned(), "explosion".to_owned()])
        );
    }

    #[test]
    fn parse_minimal_yaml() {
        let config = StimulusConfig::parse("store:\n  max_events_tracked: 7\n").unwrap();
        assert_eq!(config.store.max_events_tracked, 7);
        assert_eq!(config.advisory.advisory_result_ttl_steps, 10);
    }

    #[test]
    fn parse_empty_yaml() {
        assert!(StimulusConfig::parse("").is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = StimulusConfig::parse("store:\n  large_range_threshold: 64.0\n");
        assert!(matches!(
            err,
            Err(ConfigError::Invalid { field: "store.large_range_threshold", .. })
        ));

        let err = StimulusConfig::parse("attenuation:\n  material_factors:\n    stone: 1.5\n");
        assert!(matches!(
            err,
            Err(ConfigError::Invalid { field: "attenuation.material_factors", .. })
        ));
    }

    #[test]
    fn load_project_config_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("stimulus-config.yaml");
        if path.exists() {
            let config = StimulusConfig::from_file(&path);
            assert!(config.is_ok(), "Failed to load project config: {config:?}");
        }
    }
}

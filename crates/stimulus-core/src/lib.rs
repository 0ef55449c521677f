//! Spatial stimulus store, background compute, and step orchestration for
//! the stimulus perception engine.
//!
//! Producers emit decaying events into a grid-indexed store from any
//! thread. The authoritative simulation thread asks the store for each
//! agent's best event every step, while clustering and re-scoring run as
//! deadline-bounded jobs on a worker pool (or an external executor) and
//! hand their results back through queues drained on that thread.
//!
//! # Modules
//!
//! - [`attenuation`] -- Obstruction raycasts, material factors, and the
//!   raycast result cache.
//! - [`bridge`] -- Budgeted queue of callbacks run on the authoritative
//!   thread.
//! - [`clustering`] -- Greedy leader/follower grouping of agents.
//! - [`config`] -- Configuration loading from `stimulus-config.yaml` into
//!   strongly-typed structs.
//! - [`deadline`] -- Injectable clocks and wall-clock deadlines for jobs.
//! - [`runtime`] -- [`StimulusRuntime`], the per-step driver.
//! - [`scheduler`] -- [`ComputeScheduler`] trait with local, external, and
//!   managed implementations.
//! - [`scoring`] -- Batch scoring of stimulus candidates with hysteresis.
//! - [`store`] -- [`SpatialStimulusStore`] and its indexes and caches.
//!
//! [`StimulusRuntime`]: runtime::StimulusRuntime
//! [`ComputeScheduler`]: scheduler::ComputeScheduler
//! [`SpatialStimulusStore`]: store::SpatialStimulusStore

pub mod attenuation;
pub mod bridge;
pub mod clustering;
pub mod config;
pub mod deadline;
pub mod runtime;
pub mod scheduler;
pub mod scoring;
pub mod store;

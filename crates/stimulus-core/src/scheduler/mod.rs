//! Background compute scheduling for clustering and scoring jobs.
//!
//! The authoritative thread hands snapshots to a [`ComputeScheduler`] and
//! drains finished results in a later step. Jobs are pure functions over
//! their snapshot; their only effect is a value pushed onto the shared
//! [`ResultQueues`].
//!
//! # Modules
//!
//! - [`local`] -- bounded worker thread pool
//! - [`external`] -- adapter over a pluggable distributed task executor
//! - [`manager`] -- selects, caches, and rebuilds the active implementation

pub mod external;
pub mod local;
pub mod manager;

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use stimulus_types::{AgentSnapshot, GroupComputeResult, GroupConfig, ScoreRequest, ScoreResult, WorldId};

use crate::deadline::Deadline;
use crate::{clustering, scoring};

pub use external::{ExecutorError, ExternalComputeScheduler, ExternalTaskExecutor};
pub use local::LocalComputeScheduler;
pub use manager::SchedulerManager;

/// Errors that can occur while submitting or collecting compute jobs.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The worker pool has shut down.
    #[error("scheduler {name} is shut down")]
    ShutDown {
        /// Name of the scheduler.
        name: &'static str,
    },

    /// The external executor rejected or failed the job.
    #[error("external executor failed: {source}")]
    Executor {
        /// The underlying executor error.
        #[from]
        source: ExecutorError,
    },

    /// The external executor did not answer in time.
    #[error("external job timed out after {timeout_ms}ms")]
    Timeout {
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The external executor answered with a value of unexpected shape.
    #[error("external job returned an unexpected value: {source}")]
    Decode {
        /// The underlying decode error.
        #[from]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComputeJob {
    /// Cluster the agents of one world into groups.
    Group {
        /// World the snapshot belongs to.
        world_id: WorldId,
        /// Agent snapshots.
        agents: Vec<AgentSnapshot>,
        /// Clustering parameters.
        config: GroupConfig,
        /// Wall-clock budget in milliseconds.
        budget_ms: u64,
    },
    /// Score stimulus candidates for a batch of agents.
    Score {
        /// Per-agent requests.
        requests: Vec<ScoreRequest>,
        /// Wall-clock budget in milliseconds.
        budget_ms: u64,
    },
}

/// The value produced by a [`ComputeJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutput {
    /// Result of a [`ComputeJob::Group`].
    Group(GroupComputeResult),
    /// Results of a [`ComputeJob::Score`].
    Score(Vec<ScoreResult>),
}

impl ComputeJob {
    /// Short label for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Group { .. } => "group",
            Self::Score { .. } => "score",
        }
    }

    /// The job's own wall-clock budget.
    pub const fn budget(&self) -> Duration {
        match self {
            Self::Group { budget_ms, .. } | Self::Score { budget_ms, .. } => {
                Duration::from_millis(*budget_ms)
            }
        }
    }

    /// Run the job to completion or until `deadline` passes.
    pub fn run(&self, deadline: &Deadline) -> JobOutput {
        match self {
            Self::Group {
                world_id,
                agents,
                config,
                ..
            } => JobOutput::Group(clustering::compute_groups(
                world_id.clone(),
                agents,
                config,
                deadline,
            )),
            Self::Score { requests, .. } => {
                JobOutput::Score(scoring::score_batch(requests, deadline))
            }
        }
    }

    /// Decode a value returned by an external executor for this job.
    ///
    /// Group jobs expect a serialized [`GroupComputeResult`], score jobs a
    /// list of [`ScoreResult`].
    pub fn decode(&self, value: serde_json::Value) -> Result<JobOutput, SchedulerError> {
        Ok(match self {
            Self::Group { .. } => JobOutput::Group(serde_json::from_value(value)?),
            Self::Score { .. } => JobOutput::Score(serde_json::from_value(value)?),
        })
    }
}

// ---------------------------------------------------------------------------
// Result queues
// ---------------------------------------------------------------------------

/// Unbounded multi-producer queues of finished results.
///
/// Clones share the same channels, so results enqueued by a scheduler that
/// has since been replaced are still drained.
#[derive(Debug, Clone)]
pub struct ResultQueues {
    group_tx: Sender<GroupComputeResult>,
    group_rx: Receiver<GroupComputeResult>,
    score_tx: Sender<ScoreResult>,
    score_rx: Receiver<ScoreResult>,
}

impl ResultQueues {
    /// Create empty queues.
    pub fn new() -> Self {
        let (group_tx, group_rx) = crossbeam_channel::unbounded();
        let (score_tx, score_rx) = crossbeam_channel::unbounded();
        Self {
            group_tx,
            group_rx,
            score_tx,
            score_rx,
        }
    }

    /// Enqueue a job's output.
    pub fn publish(&self, output: JobOutput) {
        // Both receivers live in `self`, so sends cannot fail.
        match output {
            JobOutput::Group(result) => {
                let _ = self.group_tx.send(result);
            }
            JobOutput::Score(results) => {
                for result in results {
                    let _ = self.score_tx.send(result);
                }
            }
        }
    }

    /// Take every queued clustering result.
    pub fn drain_groups(&self) -> Vec<GroupComputeResult> {
        self.group_rx.try_iter().collect()
    }

    /// Take every queued scoring result.
    pub fn drain_scores(&self) -> Vec<ScoreResult> {
        self.score_rx.try_iter().collect()
    }

    /// Number of queued results of both kinds.
    pub fn pending(&self) -> usize {
        self.group_rx.len().saturating_add(self.score_rx.len())
    }
}

impl Default for ResultQueues {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Scheduler trait
// ---------------------------------------------------------------------------

/// Submits compute jobs and hands back their results.
///
/// Submission never blocks on the work itself. Results appear in the
/// scheduler's queues some time later and are taken with the `drain_*`
/// methods, normally once per step on the authoritative thread.
pub trait ComputeScheduler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Wall-clock budget given to each job.
    fn job_budget_ms(&self) -> u64;

    /// Queues this scheduler publishes into.
    fn queues(&self) -> &ResultQueues;

    /// Enqueue a prepared job.
    fn submit(&self, job: ComputeJob) -> Result<(), SchedulerError>;

    /// Enqueue a clustering job for one world.
    fn submit_group_compute(
        &self,
        world_id: WorldId,
        agents: Vec<AgentSnapshot>,
        config: GroupConfig,
    ) -> Result<(), SchedulerError> {
        self.submit(ComputeJob::Group {
            world_id,
            agents,
            config,
            budget_ms: self.job_budget_ms(),
        })
    }

    /// Enqueue a scoring job for a batch of agents.
    fn submit_score_compute(&self, requests: Vec<ScoreRequest>) -> Result<(), SchedulerError> {
        self.submit(ComputeJob::Score {
            requests,
            budget_ms: self.job_budget_ms(),
        })
    }

    /// Take every finished clustering result.
    fn drain_group_results(&self) -> Vec<GroupComputeResult> {
        self.queues().drain_groups()
    }

    /// Take every finished scoring result.
    fn drain_score_results(&self) -> Vec<ScoreResult> {
        self.queues().drain_scores()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use stimulus_types::{AgentId, Vec3};

    use super::*;

    fn score_job() -> ComputeJob {
        ComputeJob::Score {
            requests: vec![ScoreRequest {
                agent_id: AgentId::new(),
                position: Vec3::new(0.0, 0.0, 0.0),
                current_step: 0,
                current_event_id: None,
                candidates: Vec::new(),
                switch_ratio: 1.25,
                novelty_bonus: 0.5,
                novelty_window: 10,
            }],
            budget_ms: 5,
        }
    }

    #[test]
    fn jobs_serialize_with_kind_tag() {
        let job = score_job();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["kind"], "score");
        let back: ComputeJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let job = score_job();
        let err = job.decode(serde_json::json!({"not": "a list"}));
        assert!(matches!(err, Err(SchedulerError::Decode { .. })));

        let ok = job.decode(serde_json::json!([])).unwrap();
        assert_eq!(ok, JobOutput::Score(Vec::new()));
    }

    #[test]
    fn queues_are_shared_between_clones() {
        let queues = ResultQueues::new();
        let other = queues.clone();
        other.publish(score_job().run(&Deadline::unbounded()));
        assert_eq!(queues.pending(), 1);
        assert_eq!(queues.drain_scores().len(), 1);
        assert_eq!(other.pending(), 0);
    }
}

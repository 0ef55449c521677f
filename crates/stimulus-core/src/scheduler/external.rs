//! Adapter forwarding compute jobs to a pluggable external executor.
//!
//! Each submission is probed for availability first. The executor's future
//! is driven on a tokio runtime handle under a timeout; its JSON answer is
//! decoded into the job's expected output. Any failure along the way
//! (unavailable, rejected, timed out, wrong shape) reruns the job on the
//! local worker pool, so a result is produced either way.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{
    ComputeJob, ComputeScheduler, JobOutput, LocalComputeScheduler, ResultQueues, SchedulerError,
};
use crate::config::SchedulerConfig;

const NAME: &str = "external";

/// Errors reported by an external task executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor cannot take work right now.
    #[error("executor unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The executor accepted the job but failed to run it.
    #[error("executor job failed: {message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },
}

/// A distributed task executor provided by the host.
///
/// The returned future resolves to the job's output serialized as JSON:
/// a `GroupComputeResult` object for group jobs, a list of `ScoreResult`
/// for score jobs.
pub trait ExternalTaskExecutor: Send + Sync {
    /// Whether the executor can currently accept work.
    fn is_available(&self) -> bool;

    /// Start running `job` remotely.
    fn submit(
        &self,
        job: &ComputeJob,
    ) -> Result<BoxFuture<'static, Result<serde_json::Value, ExecutorError>>, ExecutorError>;
}

/// [`ComputeScheduler`] backed by an [`ExternalTaskExecutor`] with a local
/// fallback.
pub struct ExternalComputeScheduler {
    executor: Arc<dyn ExternalTaskExecutor>,
    runtime: Handle,
    timeout: Duration,
    fallback: Arc<LocalComputeScheduler>,
    queues: ResultQueues,
    job_budget_ms: u64,
}

impl ExternalComputeScheduler {
    /// Create the adapter. Results from both paths land in `queues`.
    pub fn new(
        executor: Arc<dyn ExternalTaskExecutor>,
        runtime: Handle,
        config: &SchedulerConfig,
        queues: ResultQueues,
    ) -> Self {
        let fallback = Arc::new(LocalComputeScheduler::new(config, queues.clone()));
        Self {
            executor,
            runtime,
            timeout: Duration::from_millis(config.external_timeout_ms),
            fallback,
            queues,
            job_budget_ms: config.job_budget_ms,
        }
    }

    /// The local pool used when the executor fails.
    pub fn fallback(&self) -> &LocalComputeScheduler {
        &self.fallback
    }
}

impl ComputeScheduler for ExternalComputeScheduler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn job_budget_ms(&self) -> u64 {
        self.job_budget_ms
    }

    fn queues(&self) -> &ResultQueues {
        &self.queues
    }

    fn submit(&self, job: ComputeJob) -> Result<(), SchedulerError> {
        if !self.executor.is_available() {
            debug!(kind = job.kind(), "external executor unavailable, running locally");
            return self.fallback.submit(job);
        }
        let pending = match self.executor.submit(&job) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(kind = job.kind(), error = %e, "external submission failed, running locally");
                return self.fallback.submit(job);
            }
        };

        let timeout = self.timeout;
        let queues = self.queues.clone();
        let fallback = Arc::clone(&self.fallback);
        self.runtime.spawn(async move {
            match await_output(&job, pending, timeout).await {
                Ok(output) => queues.publish(output),
                Err(e) => {
                    warn!(kind = job.kind(), error = %e, "external job failed, running locally");
                    if let Err(e) = fallback.submit(job) {
                        warn!(error = %e, "local fallback rejected job");
                    }
                }
            }
        });
        Ok(())
    }
}

async fn await_output(
    job: &ComputeJob,
    pending: BoxFuture<'static, Result<serde_json::Value, ExecutorError>>,
    timeout: Duration,
) -> Result<JobOutput, SchedulerError> {
    let value = tokio::time::timeout(timeout, pending)
        .await
        .map_err(|_elapsed| SchedulerError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })??;
    job.decode(value)
}

impl std::fmt::Debug for ExternalComputeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalComputeScheduler")
            .field("timeout", &self.timeout)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

//! External task executor backed by the tokio blocking pool.
//!
//! [`TokioExecutor`] stands in for a distributed executor: each job is
//! serialized to JSON as it would be for a remote worker, run on
//! `spawn_blocking`, and its output handed back as JSON. It reports itself
//! unavailable while too many jobs are in flight, which sends further
//! submissions to the local pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use stimulus_core::deadline::Deadline;
use stimulus_core::scheduler::{ComputeJob, ExecutorError, ExternalTaskExecutor, JobOutput};
use tokio::runtime::Handle;

/// Runs compute jobs on a tokio runtime's blocking pool.
#[derive(Debug)]
pub struct TokioExecutor {
    runtime: Handle,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
}

impl TokioExecutor {
    /// An executor on `runtime` accepting up to `max_in_flight` jobs.
    pub fn new(runtime: Handle, max_in_flight: usize) -> Self {
        Self {
            runtime,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight,
        }
    }
}

/// Decrements the in-flight counter when a job ends, however it ends.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ExternalTaskExecutor for TokioExecutor {
    fn is_available(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) < self.max_in_flight
    }

    fn submit(
        &self,
        job: &ComputeJob,
    ) -> Result<BoxFuture<'static, Result<serde_json::Value, ExecutorError>>, ExecutorError> {
        let payload = serde_json::to_value(job).map_err(|e| ExecutorError::Failed {
            message: format!("failed to serialize {} job: {e}", job.kind()),
        })?;

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight(Arc::clone(&self.in_flight));
        let task = self.runtime.spawn_blocking(move || {
            let _guard = guard;
            run_serialized(payload)
        });

        Ok(async move {
            task.await.map_err(|e| ExecutorError::Failed {
                message: format!("executor task failed: {e}"),
            })?
        }
        .boxed())
    }
}

/// Decode a job, run it under its own budget, and encode the output.
fn run_serialized(payload: serde_json::Value) -> Result<serde_json::Value, ExecutorError> {
    let job: ComputeJob = serde_json::from_value(payload).map_err(|e| ExecutorError::Failed {
        message: format!("malformed job payload: {e}"),
    })?;
    let encoded = match job.run(&Deadline::after(job.budget())) {
        JobOutput::Group(result) => serde_json::to_value(result),
        JobOutput::Score(results) => serde_json::to_value(results),
    };
    encoded.map_err(|e| ExecutorError::Failed {
        message: format!("failed to serialize {} output: {e}", job.kind()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use stimulus_types::{AgentId, AgentSnapshot, GroupConfig, Vec3, WorldId};

    use super::*;

    fn group_job() -> ComputeJob {
        ComputeJob::Group {
            world_id: WorldId::parse("demo").unwrap(),
            agents: vec![AgentSnapshot {
                id: AgentId::new(),
                position: Vec3::new(0.0, 64.0, 0.0),
                health: 10.0,
                alive: true,
            }],
            config: GroupConfig::default(),
            budget_ms: 50,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_job_and_returns_decodable_output() {
        let executor = TokioExecutor::new(Handle::current(), 4);
        let job = group_job();
        let value = executor.submit(&job).unwrap().await.unwrap();
        let JobOutput::Group(result) = job.decode(value).unwrap() else {
            panic!("group job produced score output");
        };
        assert_eq!(result.leaders().count(), 1);
        assert!(executor.is_available());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn saturated_executor_reports_unavailable() {
        let executor = TokioExecutor::new(Handle::current(), 0);
        assert!(!executor.is_available());
    }

    #[test]
    fn malformed_payload_is_a_failure() {
        let err = run_serialized(serde_json::json!({"kind": "nope"})).unwrap_err();
        assert!(matches!(err, ExecutorError::Failed { .. }));
    }
}

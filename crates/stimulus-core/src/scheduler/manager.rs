//! Chooses and caches the active [`ComputeScheduler`].
//!
//! The first use builds either the external adapter (when configured, an
//! executor is registered, and it reports itself available) or the local
//! pool, then keeps it. [`SchedulerManager::rebuild`] drops the cached
//! implementation so the next use builds a fresh one from the new
//! configuration. Every implementation publishes into the manager's
//! [`ResultQueues`], so results queued before a rebuild are still drained.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::info;

use super::{
    ComputeJob, ComputeScheduler, ExternalComputeScheduler, ExternalTaskExecutor,
    LocalComputeScheduler, ResultQueues, SchedulerError,
};
use crate::config::{SchedulerBackend, SchedulerConfig};

#[derive(Clone)]
struct ExternalBackend {
    executor: Arc<dyn ExternalTaskExecutor>,
    runtime: Handle,
}

/// Lazily built, rebuildable compute scheduler.
pub struct SchedulerManager {
    config: RwLock<SchedulerConfig>,
    external: Option<ExternalBackend>,
    active: RwLock<Option<Arc<dyn ComputeScheduler>>>,
    queues: ResultQueues,
}

impl SchedulerManager {
    /// Create a manager; nothing is started until first use.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            config: RwLock::new(config.clone()),
            external: None,
            active: RwLock::new(None),
            queues: ResultQueues::new(),
        }
    }

    /// Register an external executor driven on `runtime`.
    #[must_use]
    pub fn with_external_executor(
        mut self,
        executor: Arc<dyn ExternalTaskExecutor>,
        runtime: Handle,
    ) -> Self {
        self.external = Some(ExternalBackend { executor, runtime });
        self
    }

    /// The active implementation, building it if needed.
    pub fn active(&self) -> Arc<dyn ComputeScheduler> {
        if let Some(active) = self.active.read().as_ref() {
            return Arc::clone(active);
        }
        let mut slot = self.active.write();
        if let Some(active) = slot.as_ref() {
            return Arc::clone(active);
        }
        let built = self.build();
        *slot = Some(Arc::clone(&built));
        built
    }

    /// Name of the active implementation, if one has been built.
    pub fn active_name(&self) -> Option<&'static str> {
        self.active.read().as_ref().map(|a| a.name())
    }

    /// Replace the configuration and discard the cached implementation.
    ///
    /// Queued results are kept.
    pub fn rebuild(&self, config: &SchedulerConfig) {
        *self.config.write() = config.clone();
        let previous = self.active.write().take();
        info!(
            previous = previous.as_ref().map(|p| p.name()),
            backend = ?config.backend,
            "compute scheduler will be rebuilt"
        );
        drop(previous);
    }

    fn build(&self) -> Arc<dyn ComputeScheduler> {
        let config = self.config.read().clone();
        if config.backend == SchedulerBackend::External {
            if let Some(backend) = self.external.as_ref() {
                if backend.executor.is_available() {
                    info!(timeout_ms = config.external_timeout_ms, "using external compute scheduler");
                    return Arc::new(ExternalComputeScheduler::new(
                        Arc::clone(&backend.executor),
                        backend.runtime.clone(),
                        &config,
                        self.queues.clone(),
                    ));
                }
                info!("external executor unavailable at startup, using local compute scheduler");
            } else {
                info!("no external executor registered, using local compute scheduler");
            }
        }
        Arc::new(LocalComputeScheduler::new(&config, self.queues.clone()))
    }
}

impl ComputeScheduler for SchedulerManager {
    fn name(&self) -> &'static str {
        "manager"
    }

    fn job_budget_ms(&self) -> u64 {
        self.config.read().job_budget_ms
    }

    fn queues(&self) -> &ResultQueues {
        &self.queues
    }

    fn submit(&self, job: ComputeJob) -> Result<(), SchedulerError> {
        self.active().submit(job)
    }
}

impl std::fmt::Debug for SchedulerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerManager")
            .field("active", &self.active_name())
            .field("external_registered", &self.external.is_some())
            .field("pending_results", &self.queues.pending())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures::FutureExt as _;
    use futures::future::BoxFuture;
    use stimulus_types::{AgentId, ScoreResult};

    use super::*;
    use crate::scheduler::{ExecutorError, JobOutput};

    struct Available(bool);

    impl ExternalTaskExecutor for Available {
        fn is_available(&self) -> bool {
            self.0
        }

        fn submit(
            &self,
            _job: &ComputeJob,
        ) -> Result<BoxFuture<'static, Result<serde_json::Value, ExecutorError>>, ExecutorError> {
            Ok(async { Ok(serde_json::json!([])) }.boxed())
        }
    }

    fn external_config() -> SchedulerConfig {
        SchedulerConfig {
            backend: SchedulerBackend::External,
            worker_threads: 1,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn builds_local_lazily() {
        let manager = SchedulerManager::new(&SchedulerConfig::default());
        assert!(manager.active_name().is_none());
        assert_eq!(manager.active().name(), "local");
        assert_eq!(manager.active_name(), Some("local"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn picks_external_only_when_available() {
        let manager = SchedulerManager::new(&external_config())
            .with_external_executor(Arc::new(Available(true)), Handle::current());
        assert_eq!(manager.active().name(), "external");

        let manager = SchedulerManager::new(&external_config())
            .with_external_executor(Arc::new(Available(false)), Handle::current());
        assert_eq!(manager.active().name(), "local");

        let manager = SchedulerManager::new(&external_config());
        assert_eq!(manager.active().name(), "local");
    }

    #[test]
    fn rebuild_keeps_queued_results() {
        let manager = SchedulerManager::new(&SchedulerConfig::default());
        let agent = AgentId::new();
        manager
            .queues()
            .publish(JobOutput::Score(vec![ScoreResult::none(agent)]));
        let _ = manager.active();

        manager.rebuild(&SchedulerConfig {
            worker_threads: 3,
            ..SchedulerConfig::default()
        });
        assert!(manager.active_name().is_none());

        manager.submit_score_compute(Vec::new()).unwrap();
        assert_eq!(manager.active_name(), Some("local"));
        let drained = manager.drain_score_results();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained.first().unwrap().agent_id, agent);
    }
}

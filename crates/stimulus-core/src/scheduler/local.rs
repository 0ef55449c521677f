//! In-process worker pool.
//!
//! A fixed set of named threads pull jobs from a bounded queue. When the
//! queue is full the oldest queued job is discarded to make room, since a
//! newer snapshot supersedes it. A panicking job is caught and logged; the
//! worker keeps running.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::{ComputeJob, ComputeScheduler, ResultQueues, SchedulerError};
use crate::config::SchedulerConfig;
use crate::deadline::Deadline;

const NAME: &str = "local";

#[derive(Debug, Default)]
struct PoolState {
    jobs: VecDeque<ComputeJob>,
    shutdown: bool,
}

impl PoolState {
    /// Queue `job`, returning the oldest job if it had to make room.
    fn push(&mut self, job: ComputeJob, capacity: usize) -> Option<ComputeJob> {
        let dropped = if self.jobs.len() >= capacity {
            self.jobs.pop_front()
        } else {
            None
        };
        self.jobs.push_back(job);
        dropped
    }
}

#[derive(Debug)]
struct PoolShared {
    state: Mutex<PoolState>,
    ready: Condvar,
    capacity: usize,
    discarded: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Bounded worker thread pool running compute jobs.
#[derive(Debug)]
pub struct LocalComputeScheduler {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    queues: ResultQueues,
    job_budget_ms: u64,
}

impl LocalComputeScheduler {
    /// Start `config.worker_threads` workers publishing into `queues`.
    ///
    /// A worker that fails to spawn is logged and skipped; with no workers
    /// at all, submissions report [`SchedulerError::ShutDown`].
    pub fn new(config: &SchedulerConfig, queues: ResultQueues) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            ready: Condvar::new(),
            capacity: config.queue_capacity.max(1),
            discarded: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(config.worker_threads);
        for index in 0..config.worker_threads.max(1) {
            let shared = Arc::clone(&shared);
            let queues = queues.clone();
            let spawned = thread::Builder::new()
                .name(format!("stimulus-compute-{index}"))
                .spawn(move || worker_loop(&shared, &queues));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(index, error = %e, "failed to spawn compute worker"),
            }
        }
        if workers.is_empty() {
            shared.state.lock().shutdown = true;
        }

        info!(
            workers = workers.len(),
            queue_capacity = shared.capacity,
            "local compute scheduler started"
        );
        Self {
            shared,
            workers,
            queues,
            job_budget_ms: config.job_budget_ms,
        }
    }

    /// Jobs dropped because the queue was full.
    pub fn discarded(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }

    /// Jobs that ran to completion.
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Jobs that panicked.
    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }
}

impl ComputeScheduler for LocalComputeScheduler {
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
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Err(SchedulerError::ShutDown { name: NAME });
            }
            if let Some(dropped) = state.push(job, self.shared.capacity) {
                self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = dropped.kind(),
                    capacity = self.shared.capacity,
                    "compute queue full, discarding oldest job"
                );
            }
        }
        self.shared.ready.notify_one();
        Ok(())
    }
}

impl Drop for LocalComputeScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.jobs.clear();
        }
        self.shared.ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("compute worker exited abnormally");
            }
        }
        debug!("local compute scheduler stopped");
    }
}

fn worker_loop(shared: &PoolShared, queues: &ResultQueues) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                shared.ready.wait(&mut state);
            }
        };

        let deadline = Deadline::after(job.budget());
        match panic::catch_unwind(AssertUnwindSafe(|| job.run(&deadline))) {
            Ok(output) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
                queues.publish(output);
            }
            Err(_) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                error!(kind = job.kind(), "compute job panicked, no result produced");
            }
        }
    }
}

//! Marshals work from any thread onto the authoritative simulation thread.
//!
//! Producers and background tasks [`submit`](MainThreadBridge::submit)
//! closures; the authoritative thread runs them at the end of each step,
//! bounded by a task count and a wall-clock budget. A failing or panicking
//! task is logged and the drain continues with the next one.
//!
//! When the host supplies a [`DrainScheduler`], a submission that finds no
//! drain pending also asks the host to run one "soon". A compare-and-set
//! flag keeps at most one such drain outstanding, and a scheduled drain
//! that leaves work behind schedules the next one itself.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::config::BridgeConfig;
use crate::deadline::{Clock, Deadline, SystemClock};

/// A unit of work for the authoritative thread.
pub type BridgeTask = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Host hook that runs a closure on the authoritative thread later.
pub trait DrainScheduler: Send + Sync {
    /// Run `drain` on the authoritative thread at the next opportunity.
    fn schedule(&self, drain: Box<dyn FnOnce() + Send>);
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that returned `Ok`.
    pub succeeded: usize,
    /// Tasks that returned an error or panicked.
    pub failed: usize,
    /// Tasks still queued afterwards.
    pub remaining: usize,
}

impl DrainReport {
    /// Tasks run during the pass.
    pub const fn ran(&self) -> usize {
        self.succeeded.saturating_add(self.failed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    max_tasks: usize,
    time: Duration,
}

impl Budget {
    fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_tasks: config.max_tasks_per_step,
            time: Duration::try_from_secs_f64(config.step_budget_ms.max(0.0) / 1000.0)
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// Budgeted queue of callbacks for the authoritative thread.
pub struct MainThreadBridge {
    tx: Sender<BridgeTask>,
    rx: Receiver<BridgeTask>,
    budget: RwLock<Budget>,
    clock: Arc<dyn Clock>,
    hook: Option<Arc<dyn DrainScheduler>>,
    drain_scheduled: AtomicBool,
    failures: AtomicU64,
}

impl MainThreadBridge {
    /// Create a bridge drained only at step end.
    pub fn new(config: &BridgeConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            budget: RwLock::new(Budget::from_config(config)),
            clock: Arc::new(SystemClock),
            hook: None,
            drain_scheduled: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    /// Also drain between steps through the host's scheduler.
    #[must_use]
    pub fn with_drain_scheduler(mut self, hook: Arc<dyn DrainScheduler>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Measure the time budget on `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply new budgets.
    pub fn reconfigure(&self, config: &BridgeConfig) {
        *self.budget.write() = Budget::from_config(config);
    }

    /// Queue a task. Safe to call from any thread.
    pub fn submit<F>(self: &Arc<Self>, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.tx.send(Box::new(task));
        self.request_drain();
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Total tasks that failed since creation.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Whether a scheduled drain is outstanding.
    pub fn drain_scheduled(&self) -> bool {
        self.drain_scheduled.load(Ordering::Acquire)
    }

    /// Drain at the end of an authoritative step.
    pub fn on_step_end(&self) -> DrainReport {
        if self.rx.is_empty() {
            return DrainReport::default();
        }
        self.drain()
    }

    /// Run queued tasks until the queue is empty or a budget runs out.
    ///
    /// At least one task runs per pass, so a zero time budget still makes
    /// progress.
    pub fn drain(&self) -> DrainReport {
        let budget = *self.budget.read();
        let deadline = Deadline::with_clock(Arc::clone(&self.clock), budget.time);
        let mut report = DrainReport::default();

        while report.ran() < budget.max_tasks {
            if report.ran() > 0 && deadline.is_expired() {
                break;
            }
            let Ok(task) = self.rx.try_recv() else {
                break;
            };
            match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(())) => report.succeeded = report.succeeded.saturating_add(1),
                Ok(Err(e)) => {
                    report.failed = report.failed.saturating_add(1);
                    warn!(error = %e, "bridge task failed");
                }
                Err(_) => {
                    report.failed = report.failed.saturating_add(1);
                    error!("bridge task panicked");
                }
            }
        }

        self.failures.fetch_add(
            u64::try_from(report.failed).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        report.remaining = self.rx.len();
        if report.remaining > 0 {
            debug!(
                ran = report.ran(),
                remaining = report.remaining,
                "bridge budget exhausted"
            );
        }
        report
    }

    fn request_drain(self: &Arc<Self>) {
        let Some(hook) = self.hook.as_ref() else {
            return;
        };
        if self
            .drain_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let bridge = Arc::clone(self);
        hook.schedule(Box::new(move || bridge.scheduled_drain()));
    }

    fn scheduled_drain(self: &Arc<Self>) {
        let report = self.drain();
        self.drain_scheduled.store(false, Ordering::Release);
        if report.remaining > 0 || !self.rx.is_empty() {
            self.request_drain();
        }
    }
}

impl std::fmt::Debug for MainThreadBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadBridge")
            .field("pending", &self.pending())
            .field("drain_scheduled", &self.drain_scheduled())
            .field("has_hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

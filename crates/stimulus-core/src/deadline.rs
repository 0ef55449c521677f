//! Wall-clock budgets for cooperative, interruptible algorithms.
//!
//! Every loop that may run long (clustering, scoring, bridge drains) takes a
//! [`Deadline`] and returns what it has computed so far once the deadline
//! passes. The time source is a [`Clock`] so tests can drive it by hand.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed_micros: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_micros: AtomicU64::new(0),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.elapsed_micros.fetch_add(micros, Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = Duration::from_micros(self.elapsed_micros.load(Ordering::Acquire));
        self.origin.checked_add(elapsed).unwrap_or(self.origin)
    }
}

/// A point in time after which cooperative work should stop.
#[derive(Debug, Clone)]
pub struct Deadline {
    clock: Arc<dyn Clock>,
    expires_at: Option<Instant>,
}

impl Deadline {
    /// A deadline `budget` from now on the system clock.
    pub fn after(budget: Duration) -> Self {
        Self::with_clock(Arc::new(SystemClock), budget)
    }

    /// A deadline `budget` from now on `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>, budget: Duration) -> Self {
        let now = clock.now();
        Self {
            expires_at: Some(now.checked_add(budget).unwrap_or(now)),
            clock,
        }
    }

    /// A deadline that never expires.
    pub fn unbounded() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            expires_at: None,
        }
    }

    /// Whether the budget is used up.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| self.clock.now() >= at)
    }

    /// Time left before expiry; `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(self.clock.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_deadline_expires_when_advanced() {
        let clock = Arc::new(ManualClock::new());
        let deadline = Deadline::with_clock(clock.clone(), Duration::from_millis(10));
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::from_millis(10)));

        clock.advance(Duration::from_millis(4));
        assert!(!deadline.is_expired());

        clock.advance(Duration::from_millis(6));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn zero_budget_is_immediately_expired() {
        let clock = Arc::new(ManualClock::new());
        assert!(Deadline::with_clock(clock, Duration::ZERO).is_expired());
    }

    #[test]
    fn unbounded_never_expires() {
        let deadline = Deadline::unbounded();
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().is_none());
    }
}

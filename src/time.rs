// Licensed under the Apache License, Version 2.0.

//! Monotonic time helpers.
//!
//! Every deadline and interval in this crate is expressed in nanoseconds
//! since an arbitrary, process-local epoch (`std::time::Instant`), matching
//! spec.md's `lagopus_chrono_t` which is always a relative-or-absolute
//! nanosecond count with `-1` meaning "forever". We keep that `-1`-means-
//! forever convention at the public API boundary ([`Timeout`]) but use
//! `Option<Duration>` internally once parsed, since `None` is a better fit
//! for `std::sync::Condvar::wait_timeout`.

use std::time::{Duration, Instant};

/// A point in time on the monotonic clock, used for timed-queue wakeups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AbsTime(Instant);

impl AbsTime {
    pub fn now() -> Self {
        AbsTime(Instant::now())
    }

    pub fn after(d: Duration) -> Self {
        AbsTime(Instant::now() + d)
    }

    pub fn plus(self, d: Duration) -> Self {
        AbsTime(self.0 + d)
    }

    /// Duration remaining until this instant, or `Duration::ZERO` if it has
    /// already passed.
    pub fn remaining(self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn has_passed(self) -> bool {
        Instant::now() >= self.0
    }

    pub fn inner(self) -> Instant {
        self.0
    }
}

/// A timeout as accepted by the public API: `-1` means wait forever, any
/// other (non-negative) nanosecond count is an upper bound.
///
/// This mirrors spec.md §5 "Timeout semantics: `timeout_ns == -1` means wait
/// forever."
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    Forever,
    Nanos(i64),
}

impl Timeout {
    pub fn from_nsec(nsec: i64) -> Self {
        if nsec < 0 {
            Timeout::Forever
        } else {
            Timeout::Nanos(nsec)
        }
    }

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Forever => None,
            Timeout::Nanos(n) => Some(Duration::from_nanos(n as u64)),
        }
    }
}

/// A budget of remaining wait time, charged against as elapsed time passes.
///
/// spec.md §4.3 `wait(timeout_ns)`: "Waits for every worker to finish within
/// `timeout_ns` (distributed across workers, charged as elapsed time)." A
/// single deadline computed once up front and re-queried per worker gives
/// exactly that semantics without each waiter needing to do its own
/// bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineBudget {
    deadline: Option<Instant>,
}

impl DeadlineBudget {
    pub fn new(timeout: Timeout) -> Self {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        DeadlineBudget { deadline }
    }

    /// Remaining time, or `None` if the budget is unbounded.
    ///
    /// Returns `Some(Duration::ZERO)` rather than `None` once the deadline
    /// has passed, so callers can still attempt a final non-blocking check.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}

// Licensed under the Apache License, Version 2.0.

//! A callout task and the process-wide state table that outlives it
//! (spec.md §3 "Callout task K").
//!
//! `original_source/src/lib/callout_task.c` keeps an in-struct `m_status`
//! *and* a separate pointer-keyed table so `lagopus_callout_task_state()`
//! still answers `UNKNOWN` instead of dereferencing freed memory once the
//! task itself is gone. SPEC_FULL keeps that split: [`CalloutTask::status`]
//! is the live value consulted by the scheduler; [`TaskStateTable`] is a
//! second, independently-locked map the same status is mirrored into, and
//! which survives the task's own deallocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::time::AbsTime;

pub type TaskId = u64;

/// spec.md §3: "an internal warning" once `exec_ref_count` crosses this.
pub const EXEC_REF_COUNT_WARN_THRESHOLD: u32 = 10;

/// spec.md §3: "`interval ≥ 10 µs` whenever `do_repeat`."
pub const MIN_TASK_INTERVAL: Duration = Duration::from_micros(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Unknown,
    Created,
    Enqueued,
    Dequeued,
    Executing,
    Executed,
    ExecFailed,
    Cancelled,
    Deleting,
}

/// Handed to a task's `proc` while it runs, so `task_reset_interval` can be
/// expressed as a method instead of a free function the proc has to be
/// trusted to call with the right task.
pub struct TaskContext<'a> {
    task: &'a CalloutTask,
}

impl TaskContext<'_> {
    /// Only valid while the task is `EXECUTING` — i.e. only from inside the
    /// task's own `proc` (spec.md §4.4 `task_reset_interval`).
    pub fn reset_interval(&self, interval: Duration) -> Result<()> {
        self.task.reset_interval(interval)
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }
}

pub type TaskProc = Box<dyn FnMut(&TaskContext) -> Result<()> + Send>;

struct TaskInner {
    status: TaskStatus,
    proc: Option<TaskProc>,
    do_repeat: bool,
    is_first: bool,
    is_in_timed_q: bool,
    is_in_bbq: bool,
    initial_delay: Duration,
    interval: Duration,
    last_abstime: Option<AbsTime>,
    next_abstime: Option<AbsTime>,
    /// Set once a canceller has claimed the right to destroy the task; the
    /// executioner checks this after `proc` returns instead of
    /// rescheduling.
    cancel_claimed: bool,
}

/// A schedulable unit of work. `proc`/`arg`/`free_arg` in the reference
/// collapse into one `FnMut` closure, same simplification as
/// [`crate::runnable::Runnable`].
pub struct CalloutTask {
    id: TaskId,
    name: Option<String>,
    inner: Mutex<TaskInner>,
    cond: Condvar,
    exec_ref_count: AtomicU32,
    cancel_ref_count: AtomicU32,
}

fn next_task_id() -> TaskId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl CalloutTask {
    pub fn new(name: impl Into<String>, proc: TaskProc) -> Self {
        CalloutTask {
            id: next_task_id(),
            name: Some(name.into()),
            inner: Mutex::new(TaskInner {
                status: TaskStatus::Created,
                proc: Some(proc),
                do_repeat: false,
                is_first: true,
                is_in_timed_q: false,
                is_in_bbq: false,
                initial_delay: Duration::ZERO,
                interval: Duration::ZERO,
                last_abstime: None,
                next_abstime: None,
                cancel_claimed: false,
            }),
            cond: Condvar::new(),
            exec_ref_count: AtomicU32::new(0),
            cancel_ref_count: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().unwrap().status
    }

    pub(super) fn set_status(&self, status: TaskStatus) {
        self.inner.lock().unwrap().status = status;
    }

    pub fn is_periodic(&self) -> bool {
        self.inner.lock().unwrap().do_repeat
    }

    pub fn next_abstime(&self) -> Option<AbsTime> {
        self.inner.lock().unwrap().next_abstime
    }

    /// spec.md §4.4 `submit_task`: configures the schedule at submission
    /// time. `interval == Duration::ZERO` means one-shot.
    pub(super) fn configure_schedule(&self, initial_delay: Duration, interval: Duration) -> Result<()> {
        if !interval.is_zero() && interval < MIN_TASK_INTERVAL {
            return Err(Error::TooSmall(format!(
                "interval {interval:?} is below the {MIN_TASK_INTERVAL:?} floor"
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.initial_delay = initial_delay;
        inner.interval = interval;
        inner.do_repeat = !interval.is_zero();
        inner.next_abstime = Some(AbsTime::after(initial_delay));
        Ok(())
    }

    fn reset_interval(&self, interval: Duration) -> Result<()> {
        if interval < MIN_TASK_INTERVAL {
            return Err(Error::TooSmall(format!(
                "interval {interval:?} is below the {MIN_TASK_INTERVAL:?} floor"
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.status != TaskStatus::Executing {
            return Err(Error::invalid_state(
                "task_reset_interval is only valid while EXECUTING",
            ));
        }
        inner.interval = interval;
        Ok(())
    }

    /// Runs the bundled `proc` exactly once, without holding the task lock
    /// for the duration of the call — so a proc that calls
    /// [`TaskContext::reset_interval`] does not deadlock against its own
    /// task.
    pub(super) fn invoke_proc(&self) -> Result<()> {
        let taken = self.inner.lock().unwrap().proc.take();
        let Some(mut proc) = taken else {
            return Ok(());
        };
        let ctx = TaskContext { task: self };
        let result = proc(&ctx);
        self.inner.lock().unwrap().proc = Some(proc);
        result
    }

    /// Computes the next firing time for a periodic reschedule:
    /// `last_abstime + interval` (spec.md §4.4 "Executioner").
    pub(super) fn advance_schedule(&self) -> AbsTime {
        let mut inner = self.inner.lock().unwrap();
        let base = inner.next_abstime.unwrap_or_else(AbsTime::now);
        inner.last_abstime = Some(base);
        let next = base.plus(inner.interval);
        inner.next_abstime = Some(next);
        next
    }

    /// Increments `exec_ref_count`, logging the spec.md §3 warning once the
    /// count exceeds [`EXEC_REF_COUNT_WARN_THRESHOLD`].
    pub(super) fn begin_exec(&self) {
        let prior = self.exec_ref_count.fetch_add(1, Ordering::AcqRel);
        if prior + 1 > EXEC_REF_COUNT_WARN_THRESHOLD {
            tracing::warn!(task = self.id, count = prior + 1, "exec_ref_count above warning threshold");
        }
    }

    pub(super) fn end_exec(&self) {
        self.exec_ref_count.fetch_sub(1, Ordering::AcqRel);
        self.cond.notify_all();
    }

    pub(super) fn exec_ref_count(&self) -> u32 {
        self.exec_ref_count.load(Ordering::Acquire)
    }

    pub(super) fn cancel_ref_count(&self) -> u32 {
        self.cancel_ref_count.load(Ordering::Acquire)
    }

    /// Registers this caller as a canceller and waits until no execution is
    /// in flight, returning whether this caller is the one that should
    /// reclaim (destroy) the task.
    pub(super) fn cancel_and_wait_for_drain(&self) -> bool {
        let prior = self.cancel_ref_count.fetch_add(1, Ordering::AcqRel);
        let mut inner = self.inner.lock().unwrap();
        while self.exec_ref_count.load(Ordering::Acquire) > 0 {
            inner = self.cond.wait(inner).unwrap();
        }
        inner.cancel_claimed = true;
        drop(inner);
        let remaining = self.cancel_ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        prior == 0 && remaining == 0
    }

    pub(super) fn is_cancel_claimed(&self) -> bool {
        self.inner.lock().unwrap().cancel_claimed
    }

    pub(super) fn mark_enqueued_in_bbq(&self, v: bool) {
        self.inner.lock().unwrap().is_in_bbq = v;
    }

    pub(super) fn mark_enqueued_in_timed_q(&self, v: bool) {
        self.inner.lock().unwrap().is_in_timed_q = v;
    }

    pub(super) fn is_in_timed_q(&self) -> bool {
        self.inner.lock().unwrap().is_in_timed_q
    }
}

/// Outlives individual [`CalloutTask`]s so [`TaskStateTable::get`] can keep
/// answering after a task handle has been destroyed.
#[derive(Default)]
pub struct TaskStateTable {
    map: Mutex<HashMap<TaskId, TaskStatus>>,
}

impl TaskStateTable {
    pub fn new() -> Self {
        TaskStateTable::default()
    }

    pub fn set(&self, id: TaskId, status: TaskStatus) {
        self.map.lock().unwrap().insert(id, status);
    }

    pub fn get(&self, id: TaskId) -> TaskStatus {
        self.map
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(TaskStatus::Unknown)
    }

    pub fn remove(&self, id: TaskId) {
        self.map.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_schedule_rejects_subfloor_interval() {
        let task = CalloutTask::new("t", Box::new(|_| Ok(())));
        let err = task
            .configure_schedule(Duration::ZERO, Duration::from_micros(1))
            .unwrap_err();
        assert!(matches!(err, Error::TooSmall(_)));
    }

    #[test]
    fn reset_interval_only_valid_while_executing() {
        let task = CalloutTask::new("t", Box::new(|_| Ok(())));
        assert!(task.reset_interval(Duration::from_micros(20)).is_err());
        task.set_status(TaskStatus::Executing);
        assert!(task.reset_interval(Duration::from_micros(20)).is_ok());
    }

    #[test]
    fn state_table_reports_unknown_after_removal() {
        let table = TaskStateTable::new();
        table.set(1, TaskStatus::Enqueued);
        assert_eq!(table.get(1), TaskStatus::Enqueued);
        table.remove(1);
        assert_eq!(table.get(1), TaskStatus::Unknown);
    }

    #[test]
    fn single_canceller_reclaims_when_not_executing() {
        let task = CalloutTask::new("t", Box::new(|_| Ok(())));
        assert!(task.cancel_and_wait_for_drain());
    }
}

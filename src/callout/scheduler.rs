// Licensed under the Apache License, Version 2.0.

//! The callout handler/scheduler: task submission, cancellation, and the
//! master loop (spec.md §4.4 "Callout task, queues, scheduler").

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bbq::Bbq;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::global_state::{GlobalState, GraceLevel, State as GlobalPhase};
use crate::time::{AbsTime, Timeout};

use super::stage::{self, CalloutStage, Executioner};
use super::task::{CalloutTask, TaskId, TaskProc, TaskStateTable, TaskStatus};
use super::queue::TimedQueue;

struct IdleState {
    proc: Box<dyn FnMut() -> Result<()> + Send>,
    interval: Duration,
    next: AbsTime,
}

/// Owns every queue, the timed-queue, the optional worker-backed
/// [`CalloutStage`], and drives the master loop.
pub struct Scheduler {
    global: Arc<GlobalState>,
    state_table: Arc<TaskStateTable>,
    timed_q: Arc<TimedQueue>,
    urgent_q: Arc<Bbq<Arc<CalloutTask>>>,
    idle_q: Arc<Bbq<Arc<CalloutTask>>>,
    global_lock: Arc<Mutex<()>>,
    executioner: Arc<Executioner>,
    callout_stage: Mutex<Option<CalloutStage>>,
    n_workers: usize,
    do_loop: AtomicBool,
    idle: Mutex<Option<IdleState>>,
    jitter: Duration,
    idle_interval_floor: Duration,
    callout_stage_shutdown_timeout: Duration,
}

impl Scheduler {
    /// spec.md §4.4 `initialize_handler`: `idle_interval > 1 ms` whenever an
    /// idle proc is installed, otherwise `INVALID_ARGS`.
    pub fn initialize_handler(
        n_workers: usize,
        idle_proc: Option<Box<dyn FnMut() -> Result<()> + Send>>,
        idle_interval: Duration,
        global: Arc<GlobalState>,
        config: &Config,
    ) -> Result<Self> {
        if idle_proc.is_some() && idle_interval <= Duration::from_millis(1) {
            return Err(Error::invalid_args(
                "idle_interval must exceed 1ms when an idle proc is installed",
            ));
        }

        let state_table = Arc::new(TaskStateTable::new());
        let timed_q = Arc::new(TimedQueue::new());
        let global_lock = Arc::new(Mutex::new(()));
        let urgent_q = Arc::new(Bbq::new(config.callout_task_max));
        let idle_q = Arc::new(Bbq::new(config.callout_task_max));
        let executioner = Arc::new(Executioner::new(
            Arc::clone(&state_table),
            Arc::clone(&timed_q),
            Arc::clone(&global_lock),
        ));

        let callout_stage = if n_workers > 0 {
            static NEXT_ID: AtomicU64 = AtomicU64::new(0);
            let stage_name = format!("callout-stage-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed));
            let cs = CalloutStage::create(
                stage_name,
                n_workers,
                config.callout_task_max,
                Arc::clone(&executioner),
                Arc::clone(&global),
            )?;
            cs.setup()?;
            cs.start()?;
            Some(cs)
        } else {
            None
        };

        let idle = idle_proc.map(|proc| IdleState {
            proc,
            interval: idle_interval,
            next: AbsTime::after(idle_interval),
        });

        Ok(Scheduler {
            global,
            state_table,
            timed_q,
            urgent_q,
            idle_q,
            global_lock,
            executioner,
            callout_stage: Mutex::new(callout_stage),
            n_workers,
            do_loop: AtomicBool::new(false),
            idle: Mutex::new(idle),
            jitter: config.scheduler_jitter,
            idle_interval_floor: config.idle_interval_floor,
            callout_stage_shutdown_timeout: config.callout_stage_shutdown_timeout,
        })
    }

    /// Stops the loop, shuts the callout stage down gracefully with a
    /// bounded timeout (cancelling if it doesn't drain in time), then
    /// drains and discards every remaining queued task.
    pub fn finalize_handler(&self) -> Result<()> {
        self.stop_main_loop();

        if let Some(stage) = self.callout_stage.lock().unwrap().take() {
            stage.shutdown(GraceLevel::Gracefully)?;
            let timeout = Timeout::from_nsec(self.callout_stage_shutdown_timeout.as_nanos() as i64);
            if stage.wait(timeout).is_err() {
                stage.cancel()?;
                let _ = stage.wait(Timeout::Forever);
            }
            stage.destroy()?;
        }

        for t in self.urgent_q.drain_n(usize::MAX) {
            self.state_table.remove(t.id());
        }
        for t in self.idle_q.drain_n(usize::MAX) {
            self.state_table.remove(t.id());
        }
        for t in self.timed_q.drain_all() {
            self.state_table.remove(t.id());
        }
        Ok(())
    }

    /// Waits for global STARTED, then runs the master loop until
    /// [`Self::stop_main_loop`] is called.
    pub fn start_main_loop(&self) -> Result<()> {
        match self.global.wait_for(GlobalPhase::Started, Timeout::Forever) {
            Ok(_) => {}
            Err(Error::NotOperational) => {
                return Err(Error::InvalidStateTransition(
                    "global state reached a shutdown phase before STARTED".into(),
                ))
            }
            Err(e) => return Err(e),
        }
        self.do_loop.store(true, Ordering::Release);
        self.run_loop()
    }

    pub fn stop_main_loop(&self) {
        self.do_loop.store(false, Ordering::Release);
        self.urgent_q.wakeup();
    }

    fn run_loop(&self) -> Result<()> {
        while self.do_loop.load(Ordering::Acquire) {
            let now = AbsTime::now();

            let (due_timed, next_wakeup) = self.timed_q.drain_due(now, self.jitter);
            let (urgent_batch, idle_batch) = {
                let _guard = self.global_lock.lock().unwrap();
                (
                    self.urgent_q.drain_n(usize::MAX),
                    self.idle_q.drain_n(usize::MAX),
                )
            };

            // spec.md §4.4 step 4: timed, then urgent, then idle.
            let mut batch = Vec::with_capacity(due_timed.len() + urgent_batch.len() + idle_batch.len());
            batch.extend(due_timed);
            batch.extend(urgent_batch);
            batch.extend(idle_batch);
            if !batch.is_empty() {
                self.dispatch(batch)?;
            }

            let mut idle_wants_stop = false;
            let (next_idle, cap) = {
                let mut idle_guard = self.idle.lock().unwrap();
                if let Some(idle) = idle_guard.as_mut() {
                    if AbsTime::now() >= idle.next {
                        idle_wants_stop = (idle.proc)().is_err();
                        idle.next = AbsTime::after(idle.interval);
                    }
                    (Some(idle.next), idle.interval)
                } else {
                    (None, self.idle_interval_floor)
                }
            };
            if idle_wants_stop {
                self.do_loop.store(false, Ordering::Release);
                return Ok(());
            }
            let next_wakeup_abs = [next_wakeup, next_idle].into_iter().flatten().min();
            let sleep_for = match next_wakeup_abs {
                Some(t) => t.remaining().min(cap),
                None => cap,
            };

            if sleep_for.is_zero() {
                continue;
            }
            let _ = self
                .urgent_q
                .wait_gettable(Timeout::from_nsec(sleep_for.as_nanos() as i64));
        }
        Ok(())
    }

    fn dispatch(&self, batch: Vec<Arc<CalloutTask>>) -> Result<()> {
        if self.n_workers == 0 {
            stage::exec_inline(&self.executioner, batch);
            Ok(())
        } else {
            let guard = self.callout_stage.lock().unwrap();
            let cs = guard.as_ref().ok_or(Error::NotOperational)?;
            cs.submit_batch(batch)?;
            Ok(())
        }
    }

    /// spec.md §4.4 `create_task`: registers the task in `CREATED`.
    pub fn create_task(&self, name: impl Into<String>, proc: TaskProc) -> Arc<CalloutTask> {
        let task = Arc::new(CalloutTask::new(name, proc));
        self.state_table.set(task.id(), TaskStatus::Created);
        task
    }

    /// `delay_ns < 0` submits to the urgent queue (run as soon as the
    /// master loop next drains it); `delay_ns >= 0` schedules via the timed
    /// queue at `now + delay_ns`. `interval_ns > 0` makes the task periodic
    /// and must be `>= 10µs`.
    pub fn submit_task(&self, task: &Arc<CalloutTask>, delay_ns: i64, interval_ns: i64) -> Result<()> {
        if task.status() != TaskStatus::Created {
            return Err(Error::invalid_state("submit_task is only valid from CREATED"));
        }
        let interval = if interval_ns > 0 {
            Duration::from_nanos(interval_ns as u64)
        } else {
            Duration::ZERO
        };

        if delay_ns < 0 {
            task.configure_schedule(Duration::ZERO, interval)?;
            task.set_status(TaskStatus::Enqueued);
            self.state_table.set(task.id(), TaskStatus::Enqueued);
            task.mark_enqueued_in_bbq(true);
            self.urgent_q.put(Arc::clone(task), Timeout::Forever)?;
        } else {
            let delay = Duration::from_nanos(delay_ns as u64);
            task.configure_schedule(delay, interval)?;
            task.set_status(TaskStatus::Enqueued);
            self.state_table.set(task.id(), TaskStatus::Enqueued);
            task.mark_enqueued_in_timed_q(true);
            self.timed_q.insert(Arc::clone(task), task.next_abstime().unwrap());
            // Wake the scheduler so it can recompute its next timeout.
            self.urgent_q.wakeup();
        }
        Ok(())
    }

    /// Enqueues directly onto the low-priority idle queue, bypassing the
    /// timed/urgent classification (spec.md §3 "bounded FIFO ... idle_q").
    pub fn submit_idle_task(&self, task: &Arc<CalloutTask>) -> Result<()> {
        if task.status() != TaskStatus::Created {
            return Err(Error::invalid_state("submit_idle_task is only valid from CREATED"));
        }
        task.set_status(TaskStatus::Enqueued);
        self.state_table.set(task.id(), TaskStatus::Enqueued);
        task.mark_enqueued_in_bbq(true);
        self.idle_q.put(Arc::clone(task), Timeout::Forever)
    }

    /// spec.md §4.4 `cancel_task`. Always takes the global lock first, for
    /// the whole critical section — see `callout::stage::Executioner` and
    /// SPEC_FULL.md's resolution of the reference's commented "I think we
    /// need the global lock here, but it causes a deadlock".
    pub fn cancel_task(&self, task: &Arc<CalloutTask>) -> Result<()> {
        if matches!(task.status(), TaskStatus::Cancelled | TaskStatus::Deleting) {
            return Err(Error::AlreadyHalted(format!(
                "task {} is already cancelled or being deleted",
                task.id()
            )));
        }
        let _global = self.global_lock.lock().unwrap();

        if task.exec_ref_count() > 0 {
            let is_last = task.cancel_and_wait_for_drain();
            if is_last {
                self.timed_q.remove(task.id());
                task.set_status(TaskStatus::Cancelled);
                self.state_table.set(task.id(), TaskStatus::Cancelled);
            }
            return Ok(());
        }

        if task.is_in_timed_q() {
            self.timed_q.remove(task.id());
        }
        task.set_status(TaskStatus::Cancelled);
        self.state_table.set(task.id(), TaskStatus::Cancelled);
        Ok(())
    }

    /// spec.md §4.4 `exec_task_forcibly`: only from `CREATED`/`ENQUEUED` and
    /// not currently executing.
    pub fn exec_task_forcibly(&self, task: &Arc<CalloutTask>) -> Result<()> {
        match task.status() {
            TaskStatus::Created | TaskStatus::Enqueued => {
                if task.exec_ref_count() > 0 {
                    return Err(Error::AlreadyHalted("task is currently executing".into()));
                }
                self.timed_q.remove(task.id());
                task.set_status(TaskStatus::Dequeued);
                self.state_table.set(task.id(), TaskStatus::Dequeued);
                self.dispatch(vec![Arc::clone(task)])
            }
            other => Err(Error::invalid_state(format!(
                "exec_task_forcibly is invalid from {other:?}"
            ))),
        }
    }

    /// spec.md §4.4 `task_state`: `UNKNOWN` for an unrecognized id.
    pub fn task_state(&self, task_id: TaskId) -> TaskStatus {
        self.state_table.get(task_id)
    }
}

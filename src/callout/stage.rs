// Licensed under the Apache License, Version 2.0.

//! The callout stage: a [`crate::pipeline::Stage`] whose workers execute
//! dispatched tasks (spec.md §4.5 "Callout stage").

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::bbq::Bbq;
use crate::error::{Error, Result};
use crate::global_state::GlobalState;
use crate::pipeline::{DispatchHint, Stage, StageCallbacks, WorkerSignal};
use crate::time::Timeout;

use super::task::{CalloutTask, TaskStateTable, TaskStatus};
use super::queue::TimedQueue;

/// Runs a dispatched task to completion and decides its fate: reschedule
/// (periodic, no canceller waiting), delete (one-shot, failed, or no
/// canceller), or leave for a waiting canceller to reclaim (spec.md §4.4
/// "Executioner").
pub struct Executioner {
    state_table: Arc<TaskStateTable>,
    timed_q: Arc<TimedQueue>,
    global_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Rescheduled,
    Deleted,
    DeferredToCanceller,
}

impl Executioner {
    pub fn new(
        state_table: Arc<TaskStateTable>,
        timed_q: Arc<TimedQueue>,
        global_lock: Arc<Mutex<()>>,
    ) -> Self {
        Executioner {
            state_table,
            timed_q,
            global_lock,
        }
    }

    pub fn exec(&self, task: &Arc<CalloutTask>) -> ExecOutcome {
        // A canceller may have claimed the task after it was handed off to a
        // worker queue but before this callout reached it; honor the
        // cancellation instead of running a dead task's proc.
        if task.status() == TaskStatus::Cancelled {
            return ExecOutcome::Deleted;
        }

        task.begin_exec();
        task.set_status(TaskStatus::Executing);
        self.state_table.set(task.id(), TaskStatus::Executing);

        let result = task.invoke_proc();
        // Drop exec_ref_count (and wake any canceller parked on it) before
        // touching global_lock below. cancel_task holds global_lock for the
        // whole span of cancel_and_wait_for_drain(), so decrementing after
        // acquiring the lock here would deadlock against a canceller that's
        // already waiting for exec_ref_count to reach zero.
        task.end_exec();

        let outcome = if result.is_ok() && task.is_periodic() && task.cancel_ref_count() == 0 {
            let next = task.advance_schedule();
            task.set_status(TaskStatus::Enqueued);
            self.state_table.set(task.id(), TaskStatus::Enqueued);
            task.mark_enqueued_in_timed_q(true);
            self.timed_q.insert(Arc::clone(task), next);
            ExecOutcome::Rescheduled
        } else {
            let final_status = if result.is_err() {
                TaskStatus::ExecFailed
            } else {
                TaskStatus::Executed
            };
            if let Err(e) = &result {
                tracing::warn!(task = task.id(), error = %e, "callout task proc failed");
            }
            if task.cancel_ref_count() == 0 {
                let _guard = self.global_lock.lock().unwrap();
                self.state_table.set(task.id(), final_status);
                task.set_status(TaskStatus::Deleting);
                ExecOutcome::Deleted
            } else {
                self.state_table.set(task.id(), final_status);
                ExecOutcome::DeferredToCanceller
            }
        };

        outcome
    }
}

/// A pipeline stage specialized for dispatching [`CalloutTask`]s to
/// `n_workers` bounded per-worker queues, fanned out by stride round robin.
pub struct CalloutStage {
    stage: Stage<Arc<CalloutTask>>,
    worker_queues: Vec<Arc<Bbq<Arc<CalloutTask>>>>,
    last_q: AtomicUsize,
    shutdown_requested: Arc<AtomicBool>,
}

const FETCH_TIMEOUT: Timeout = Timeout::Nanos(1_000_000_000);
const MAX_FETCH_BATCH: usize = 256;

impl CalloutStage {
    pub fn create(
        name: impl Into<String>,
        n_workers: usize,
        queue_capacity: usize,
        executioner: Arc<Executioner>,
        global: Arc<GlobalState>,
    ) -> Result<Self> {
        let worker_queues: Vec<Arc<Bbq<Arc<CalloutTask>>>> = (0..n_workers)
            .map(|_| Arc::new(Bbq::new(queue_capacity)))
            .collect();
        let shutdown_requested = Arc::new(AtomicBool::new(false));

        let sched_queues = worker_queues.clone();
        let sched: crate::pipeline::SchedFn<Arc<CalloutTask>> = Box::new(move |batch, hint| {
            let idx = match hint {
                DispatchHint::Worker(i) => i,
                DispatchHint::Inline => 0,
            };
            let q = sched_queues
                .get(idx)
                .ok_or_else(|| Error::NotFound(format!("callout worker queue {idx}")))?;
            let requested = batch.len();
            match q.put_n(batch, Timeout::Nanos(0)) {
                Ok(accepted) if accepted < requested => {
                    tracing::warn!(worker = idx, requested, accepted, "callout stage queue accepted fewer tasks than submitted");
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(Error::TimedOut) => Ok(()),
                Err(e) => Err(e),
            }
        });

        let fetch_queues = worker_queues.clone();
        let fetch_shutdown_requested = Arc::clone(&shutdown_requested);
        let fetch: crate::pipeline::FetchFn<Arc<CalloutTask>> = Box::new(move |idx, buf| {
            let q = &fetch_queues[idx];
            match q.wait_gettable(FETCH_TIMEOUT) {
                Ok(()) => {
                    buf.extend(q.drain_n(MAX_FETCH_BATCH));
                    Ok(WorkerSignal::Continue)
                }
                Err(Error::WakeupRequested) if q.size() > 0 => {
                    buf.extend(q.drain_n(MAX_FETCH_BATCH));
                    Ok(WorkerSignal::Continue)
                }
                // A `GRACEFULLY` shutdown means "let this worker's
                // in-flight iteration finish, then stop" (spec.md §4.3);
                // once the queue is also empty there is nothing left to
                // finish.
                Err(Error::WakeupRequested) | Err(Error::TimedOut)
                    if fetch_shutdown_requested.load(Ordering::Acquire) && q.size() == 0 =>
                {
                    Ok(WorkerSignal::StopGraceful)
                }
                Err(Error::WakeupRequested) => Ok(WorkerSignal::Continue),
                Err(Error::TimedOut) => Ok(WorkerSignal::Continue),
                Err(Error::NotOperational) => Ok(WorkerSignal::StopNow),
                Err(e) => Err(e),
            }
        });

        let exec = Arc::clone(&executioner);
        let main: crate::pipeline::MainFn<Arc<CalloutTask>> = Box::new(move |_idx, buf| {
            for task in buf.drain(..) {
                exec.exec(&task);
            }
            Ok(WorkerSignal::Continue)
        });

        let finalize_queues = worker_queues.clone();
        let finalize: crate::pipeline::FinalizeFn = Box::new(move |canceled| {
            if canceled {
                for q in &finalize_queues {
                    q.wakeup();
                }
            }
        });

        let freeup_queues = worker_queues.clone();
        let freeup: crate::pipeline::FreeupFn = Box::new(move || {
            for q in &freeup_queues {
                q.shutdown(|_task| {});
            }
        });

        let callbacks = StageCallbacks {
            setup: None,
            pre_pause: None,
            fetch: Some(fetch),
            main,
            throw: None,
            sched,
            shutdown: None,
            finalize: Some(finalize),
            freeup: Some(freeup),
        };

        let stage = Stage::create(name, n_workers, 1, queue_capacity, callbacks, global)?;

        Ok(CalloutStage {
            stage,
            worker_queues,
            last_q: AtomicUsize::new(0),
            shutdown_requested,
        })
    }

    pub fn setup(&self) -> Result<()> {
        self.stage.setup()
    }

    pub fn start(&self) -> Result<()> {
        self.shutdown_requested.store(false, Ordering::Release);
        self.stage.start()
    }

    /// spec.md §4.5: "if `n_workers == 1`, submit the whole batch with
    /// `hint=0`. Otherwise fan out with stride `max(1, n_tasks/n_workers)`,
    /// incrementing `last_q` each submit so that queues are visited round
    /// robin across iterations."
    pub fn submit_batch(&self, tasks: Vec<Arc<CalloutTask>>) -> Result<usize> {
        if tasks.is_empty() {
            return Ok(0);
        }
        let n_workers = self.worker_queues.len();
        if n_workers == 1 {
            let n = tasks.len();
            self.stage.submit(tasks, DispatchHint::Worker(0))?;
            return Ok(n);
        }

        let stride = (tasks.len() / n_workers).max(1);
        let mut submitted = 0usize;
        for chunk in tasks.chunks(stride) {
            let q = self.last_q.fetch_add(1, Ordering::Relaxed) % n_workers;
            self.stage.submit(chunk.to_vec(), DispatchHint::Worker(q))?;
            submitted += chunk.len();
        }
        Ok(submitted)
    }

    pub fn shutdown(&self, level: crate::global_state::GraceLevel) -> Result<()> {
        self.shutdown_requested.store(true, Ordering::Release);
        let result = self.stage.shutdown(level);
        for q in &self.worker_queues {
            q.wakeup();
        }
        result
    }

    pub fn cancel(&self) -> Result<()> {
        self.stage.cancel()
    }

    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        self.stage.wait(timeout)
    }

    pub fn destroy(&self) -> Result<()> {
        self.stage.destroy()
    }

    pub fn state(&self) -> crate::pipeline::StageState {
        self.stage.state()
    }
}

/// Used by [`super::scheduler::Scheduler`] when `n_workers == 0` to run
/// tasks on the master thread itself instead of fanning out to a stage.
pub fn exec_inline(executioner: &Executioner, tasks: Vec<Arc<CalloutTask>>) {
    for task in &tasks {
        executioner.exec(task);
    }
}

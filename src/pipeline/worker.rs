// Licensed under the Apache License, Version 2.0.

//! The worker loop (spec.md §4.3 "Worker loop shape (four variants)").
//!
//! Which of the four variants a worker runs is picked once, at stage
//! creation, from which of `fetch`/`throw` are present (`main` is mandatory).
//! Rather than branching on `Option::is_some()` on every iteration, the
//! choice is captured in [`LoopKind`] and the running worker matches on it
//! once per loop body — closer to the reference's function-pointer dispatch
//! than a pile of `if let`s re-checked every pass.

use std::sync::Arc;

use crate::error::Result;
use crate::global_state::{GraceLevel, State as GlobalPhase};
use crate::thread_handle::{CancelToken, ThreadHandle};
use crate::time::Timeout;

use super::StageShared;

/// The three-way return convention of the reference's `WORKER_LOOP` macro:
/// `st > 0` keeps looping unconditionally, `st == 0` keeps looping only
/// while no shutdown has been requested, `st < 0` stops immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Continue,
    StopGraceful,
    StopNow,
}

pub(super) enum LoopKind {
    FetchMainThrow,
    FetchMain,
    MainThrow,
    MainOnly,
}

impl LoopKind {
    pub(super) fn select(has_fetch: bool, has_throw: bool) -> Self {
        match (has_fetch, has_throw) {
            (true, true) => LoopKind::FetchMainThrow,
            (true, false) => LoopKind::FetchMain,
            (false, true) => LoopKind::MainThrow,
            (false, false) => LoopKind::MainOnly,
        }
    }
}

/// One pipeline worker: an index stable for the worker's lifetime, its own
/// batch buffer, and the [`ThreadHandle`] running its loop.
pub struct Worker<E> {
    pub(super) index: usize,
    pub(super) thread: Arc<ThreadHandle>,
    pub(super) buffer: Arc<std::sync::Mutex<Vec<E>>>,
}

impl<E> Worker<E> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn thread(&self) -> &Arc<ThreadHandle> {
        &self.thread
    }

    /// Replaces the worker's batch buffer, returning the old one (spec.md
    /// §4.3 `set/get_worker_event_buffer`: "the old buffer is freed via its
    /// previous freeup; the new buffer becomes owned by the worker").
    pub fn set_event_buffer(&self, new_buffer: Vec<E>) -> Vec<E> {
        std::mem::replace(&mut self.buffer.lock().unwrap(), new_buffer)
    }
}

/// Runs one full worker-loop body (fetch/main/throw per [`LoopKind`], the
/// pause/maintenance protocol on request, and the loop-continuation
/// predicate). Spawned once per worker as the [`ThreadHandle`] main body.
pub(super) fn run<E: Send + 'static>(
    shared: Arc<StageShared<E>>,
    index: usize,
    buffer: Arc<std::sync::Mutex<Vec<E>>>,
    loop_kind: LoopKind,
    cancel: &CancelToken,
) -> Result<()> {
    // Gala opening: do not touch the stage's own bookkeeping until the
    // process-wide global state has reached STARTED. `GlobalState` has no
    // waker registry of its own, so cancellation during this wait is
    // observed by polling the token between short, bounded waits rather
    // than blocking forever on one `wait_for` call.
    loop {
        if cancel.is_cancelled() {
            shared
                .n_canceled_workers
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            return Err(crate::error::Error::Interrupted);
        }
        match shared
            .global
            .wait_for(GlobalPhase::Started, Timeout::Nanos(20_000_000))
        {
            Ok(_) => break,
            Err(crate::error::Error::TimedOut) => continue,
            Err(e) => return Err(e),
        }
    }

    if let Some(hook) = shared.post_start_hook.lock().unwrap().as_ref() {
        hook(index);
    }

    let mut st = WorkerSignal::Continue;
    loop {
        if cancel.is_cancelled() {
            shared
                .n_canceled_workers
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            break;
        }
        if !shared.do_loop.load(std::sync::atomic::Ordering::Acquire) {
            break;
        }

        if shared.pause_requested.load(std::sync::atomic::Ordering::Acquire) {
            super::barrier::run_protocol(&shared);
            continue;
        }

        let mut buf = buffer.lock().unwrap();
        let outcome = match loop_kind {
            LoopKind::MainOnly => (shared.callbacks.main)(index, &mut buf),
            LoopKind::FetchMain => match (shared.callbacks.fetch.as_ref().unwrap())(index, &mut buf) {
                Ok(WorkerSignal::StopNow) => Ok(WorkerSignal::StopNow),
                Ok(_) => (shared.callbacks.main)(index, &mut buf),
                Err(e) => Err(e),
            },
            LoopKind::MainThrow => match (shared.callbacks.main)(index, &mut buf) {
                Err(e) => (shared.callbacks.throw.as_ref().unwrap())(index, e),
                ok => ok,
            },
            LoopKind::FetchMainThrow => {
                let fetched = (shared.callbacks.fetch.as_ref().unwrap())(index, &mut buf);
                match fetched {
                    Ok(WorkerSignal::StopNow) => Ok(WorkerSignal::StopNow),
                    Ok(_) => match (shared.callbacks.main)(index, &mut buf) {
                        Err(e) => (shared.callbacks.throw.as_ref().unwrap())(index, e),
                        ok => ok,
                    },
                    Err(e) => (shared.callbacks.throw.as_ref().unwrap())(index, e),
                }
            }
        };
        drop(buf);

        st = match outcome {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(stage = %shared.name, worker = index, error = %e, "worker callback failed");
                WorkerSignal::StopGraceful
            }
        };

        // spec.md §4.3 `cancel()`: "any worker whose user callback returns
        // >0 while the stage is shutting down has its return coerced to OK
        // so iteration stops cleanly."
        if *shared.shutdown_level.lock().unwrap() == GraceLevel::RightNow
            && st == WorkerSignal::Continue
        {
            st = WorkerSignal::StopGraceful;
        }

        let keep_going = match st {
            WorkerSignal::Continue => true,
            WorkerSignal::StopGraceful => {
                *shared.shutdown_level.lock().unwrap() == GraceLevel::None
            }
            WorkerSignal::StopNow => false,
        };
        if !keep_going {
            if st == WorkerSignal::StopNow {
                shared
                    .n_shutdown_workers
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            } else {
                shared
                    .n_shutdown_workers
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            }
            break;
        }
    }
    Ok(())
}

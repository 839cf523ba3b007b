// Licensed under the Apache License, Version 2.0.

//! Named, multi-worker pipeline stages (spec.md §3 "Pipeline stage S" /
//! "Pipeline worker W", §4.3).
//!
//! A [`Stage`] owns a fixed set of [`worker::Worker`]s, each running one of
//! four loop variants chosen from which of `fetch`/`throw` callbacks are
//! present (`main` is mandatory). Workers pause and resume together under a
//! barrier, and shut down either gracefully (finish the in-flight
//! non-negative iteration) or immediately (cancel every worker).

mod barrier;
pub mod registry;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};

use crate::error::{Error, Result};
use crate::global_state::{GlobalState, GraceLevel};
use crate::thread_handle::{Outcome, ThreadHandle};
use crate::time::Timeout;

pub use worker::{Worker, WorkerSignal};

/// Where a submitted batch should go. Opaque to the runtime beyond this
/// discriminant — resolved in SPEC_FULL.md's "hint type on sched_proc" in
/// favor of a typed enum over the reference's untyped `void*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchHint {
    Inline,
    Worker(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Initialized,
    Setup,
    Started,
    Paused,
    MaintenanceRequested,
    Canceled,
    Shutdown,
    Finalized,
    Destroying,
}

pub type SetupFn = Box<dyn Fn() -> Result<()> + Send + Sync>;
pub type PrePauseFn = Box<dyn Fn() + Send + Sync>;
pub type MainFn<E> = Box<dyn Fn(usize, &mut Vec<E>) -> Result<WorkerSignal> + Send + Sync>;
pub type FetchFn<E> = Box<dyn Fn(usize, &mut Vec<E>) -> Result<WorkerSignal> + Send + Sync>;
pub type ThrowFn<E> = Box<dyn Fn(usize, Error) -> Result<WorkerSignal> + Send + Sync>;
pub type SchedFn<E> = Box<dyn Fn(Vec<E>, DispatchHint) -> Result<()> + Send + Sync>;
pub type ShutdownFn = Box<dyn Fn(GraceLevel) + Send + Sync>;
pub type FinalizeFn = Box<dyn Fn(bool) + Send + Sync>;
pub type FreeupFn = Box<dyn Fn() + Send + Sync>;
pub type PostStartHook = Box<dyn Fn(usize) + Send + Sync>;
pub type MaintenanceFn = Box<dyn FnMut() + Send>;

/// The user-supplied callback bundle a [`Stage`] is built from. `main` and
/// `sched` are mandatory; everything else is optional.
pub struct StageCallbacks<E> {
    pub setup: Option<SetupFn>,
    pub pre_pause: Option<PrePauseFn>,
    pub fetch: Option<FetchFn<E>>,
    pub main: MainFn<E>,
    pub throw: Option<ThrowFn<E>>,
    pub sched: SchedFn<E>,
    pub shutdown: Option<ShutdownFn>,
    pub finalize: Option<FinalizeFn>,
    pub freeup: Option<FreeupFn>,
}

pub(crate) struct StageShared<E> {
    name: String,
    n_workers: usize,
    state: Mutex<StageState>,
    state_cond: Condvar,
    do_loop: AtomicBool,
    pause_requested: AtomicBool,
    pause_barrier: Barrier,
    post_pause_barrier: Barrier,
    pause_lock: Mutex<()>,
    pause_cond: Condvar,
    resume_cond: Condvar,
    n_canceled_workers: AtomicUsize,
    n_shutdown_workers: AtomicUsize,
    canceled_requested: AtomicBool,
    shutdown_level: Mutex<GraceLevel>,
    maintenance: Mutex<Option<MaintenanceFn>>,
    post_start_hook: Mutex<Option<PostStartHook>>,
    callbacks: StageCallbacks<E>,
    global: Arc<GlobalState>,
}

/// A named, multi-worker stage.
pub struct Stage<E> {
    shared: Arc<StageShared<E>>,
    workers: Mutex<Vec<Arc<Worker<E>>>>,
    max_batch: usize,
}

impl<E: Send + 'static> Stage<E> {
    /// spec.md §4.3 `create`: `ALREADY_EXISTS` on a duplicate name,
    /// `INVALID_ARGS` for a zero `event_size`/`max_batch`.
    pub fn create(
        name: impl Into<String>,
        n_workers: usize,
        event_size: usize,
        max_batch: usize,
        callbacks: StageCallbacks<E>,
        global: Arc<GlobalState>,
    ) -> Result<Self> {
        let name = name.into();
        // `event_size` is the reference's bytes-per-event hint; a typed
        // `Stage<E>` already knows `size_of::<E>()`, so it is only
        // validated here, not stored.
        if event_size == 0 {
            return Err(Error::invalid_args("event_size must be non-zero"));
        }
        if max_batch == 0 {
            return Err(Error::invalid_args("max_batch must be non-zero"));
        }
        if n_workers == 0 {
            return Err(Error::invalid_args("n_workers must be non-zero"));
        }
        registry::global().register(&name)?;

        let shared = Arc::new(StageShared {
            name,
            n_workers,
            state: Mutex::new(StageState::Initialized),
            state_cond: Condvar::new(),
            do_loop: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            pause_barrier: Barrier::new(n_workers),
            post_pause_barrier: Barrier::new(n_workers),
            pause_lock: Mutex::new(()),
            pause_cond: Condvar::new(),
            resume_cond: Condvar::new(),
            n_canceled_workers: AtomicUsize::new(0),
            n_shutdown_workers: AtomicUsize::new(0),
            canceled_requested: AtomicBool::new(false),
            shutdown_level: Mutex::new(GraceLevel::None),
            maintenance: Mutex::new(None),
            post_start_hook: Mutex::new(None),
            callbacks,
            global,
        });

        Ok(Stage {
            shared,
            workers: Mutex::new(Vec::new()),
            max_batch,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> StageState {
        *self.shared.state.lock().unwrap()
    }

    /// `INITIALIZED → SETUP`; idempotent from `SETUP`.
    pub fn setup(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        match *state {
            StageState::Initialized => {
                drop(state);
                if let Some(f) = &self.shared.callbacks.setup {
                    f()?;
                }
                *self.shared.state.lock().unwrap() = StageState::Setup;
                Ok(())
            }
            StageState::Setup => Ok(()),
            other => Err(Error::InvalidStateTransition(format!(
                "setup() is invalid from {other:?}"
            ))),
        }
    }

    /// Only from `INITIALIZED/SETUP/FINALIZED`. On any worker-creation
    /// failure already-created workers are cancelled and waited for (not
    /// destroyed), leaving the stage retryable.
    pub fn start(&self) -> Result<()> {
        {
            let state = *self.shared.state.lock().unwrap();
            if !matches!(
                state,
                StageState::Initialized | StageState::Setup | StageState::Finalized
            ) {
                return Err(Error::InvalidStateTransition(format!(
                    "start() is invalid from {state:?}"
                )));
            }
        }

        self.shared.n_canceled_workers.store(0, Ordering::Release);
        self.shared.n_shutdown_workers.store(0, Ordering::Release);
        self.shared.canceled_requested.store(false, Ordering::Release);
        *self.shared.shutdown_level.lock().unwrap() = GraceLevel::None;
        self.shared.do_loop.store(true, Ordering::Release);
        self.shared.pause_requested.store(false, Ordering::Release);

        let has_fetch = self.shared.callbacks.fetch.is_some();
        let has_throw = self.shared.callbacks.throw.is_some();
        let mut created = Vec::with_capacity(self.shared.n_workers);
        for idx in 0..self.shared.n_workers {
            match self.spawn_worker(idx, has_fetch, has_throw) {
                Ok(w) => created.push(w),
                Err(e) => {
                    for w in &created {
                        let _ = w.thread().cancel();
                    }
                    for w in &created {
                        let _ = w.thread().wait(Timeout::Forever);
                    }
                    return Err(e);
                }
            }
        }
        *self.workers.lock().unwrap() = created;
        *self.shared.state.lock().unwrap() = StageState::Started;
        Ok(())
    }

    fn spawn_worker(
        &self,
        idx: usize,
        has_fetch: bool,
        has_throw: bool,
    ) -> Result<Arc<Worker<E>>> {
        let handle = ThreadHandle::create(format!("{}-w{idx}", self.shared.name));
        let buffer = Arc::new(Mutex::new(Vec::with_capacity(self.max_batch)));
        let shared = Arc::clone(&self.shared);
        let loop_kind = worker::LoopKind::select(has_fetch, has_throw);
        let buffer_for_thread = Arc::clone(&buffer);
        let shared_for_finalize = Arc::clone(&self.shared);

        handle.start(
            false,
            move |cancel| worker::run(shared, idx, buffer_for_thread, loop_kind, cancel),
            move |outcome| {
                let was_canceled = matches!(outcome, Outcome::Interrupted);
                if was_canceled {
                    tracing::debug!(stage = %shared_for_finalize.name, worker = idx, "worker finalized after cancellation");
                }
            },
        )?;

        Ok(Arc::new(Worker {
            index: idx,
            thread: handle,
            buffer,
        }))
    }

    /// Only from `STARTED`. Blocks until the stage observes `PAUSED`.
    pub fn pause(&self, timeout: Timeout) -> Result<()> {
        {
            let state = *self.shared.state.lock().unwrap();
            if state != StageState::Started {
                return Err(Error::InvalidStateTransition(format!(
                    "pause() is invalid from {state:?}"
                )));
            }
        }
        self.shared.pause_requested.store(true, Ordering::Release);
        if let Some(hook) = &self.shared.callbacks.pre_pause {
            hook();
        }
        let budget = crate::time::DeadlineBudget::new(timeout);
        let mut guard = self.shared.pause_lock.lock().unwrap();
        loop {
            if *self.shared.state.lock().unwrap() == StageState::Paused {
                return Ok(());
            }
            match budget.remaining() {
                Some(d) if d.is_zero() => return Err(Error::TimedOut),
                Some(d) => {
                    let (g, timed_out) = self.shared.pause_cond.wait_timeout(guard, d).unwrap();
                    guard = g;
                    if timed_out.timed_out()
                        && *self.shared.state.lock().unwrap() != StageState::Paused
                    {
                        return Err(Error::TimedOut);
                    }
                }
                None => guard = self.shared.pause_cond.wait(guard).unwrap(),
            }
        }
    }

    pub fn resume(&self) -> Result<()> {
        let state = *self.shared.state.lock().unwrap();
        if !matches!(state, StageState::Paused | StageState::MaintenanceRequested) {
            return Err(Error::InvalidStateTransition(format!(
                "resume() is invalid from {state:?}"
            )));
        }
        // Clear the predicate and notify while holding pause_lock — the
        // same lock barrier.rs's worker loop holds while re-checking
        // pause_requested — so a worker that has read pause_requested but
        // not yet parked on resume_cond can't miss this wakeup.
        let guard = self.shared.pause_lock.lock().unwrap();
        self.shared.pause_requested.store(false, Ordering::Release);
        self.shared.resume_cond.notify_all();
        drop(guard);
        Ok(())
    }

    /// Only from `STARTED`. The installed closure runs on exactly one
    /// worker while every other worker is parked at the barrier.
    pub fn schedule_maintenance(&self, f: impl FnMut() + Send + 'static) -> Result<()> {
        {
            let state = *self.shared.state.lock().unwrap();
            if state != StageState::Started {
                return Err(Error::InvalidStateTransition(format!(
                    "schedule_maintenance() is invalid from {state:?}"
                )));
            }
        }
        *self.shared.maintenance.lock().unwrap() = Some(Box::new(f));
        self.shared.pause_requested.store(true, Ordering::Release);
        if let Some(hook) = &self.shared.callbacks.pre_pause {
            hook();
        }
        let mut guard = self.shared.pause_lock.lock().unwrap();
        while *self.shared.state.lock().unwrap() != StageState::Started {
            guard = self.shared.pause_cond.wait(guard).unwrap();
        }
        Ok(())
    }

    /// Only from `STARTED`/`PAUSED`. `RIGHT_NOW` also cancels every worker;
    /// `GRACEFULLY` lets the current `st > 0` iteration finish.
    pub fn shutdown(&self, level: GraceLevel) -> Result<()> {
        let state = *self.shared.state.lock().unwrap();
        if !matches!(state, StageState::Started | StageState::Paused) {
            return Err(Error::InvalidStateTransition(format!(
                "shutdown() is invalid from {state:?}"
            )));
        }
        if state == StageState::Paused {
            self.resume()?;
        }
        *self.shared.shutdown_level.lock().unwrap() = level;
        if level == GraceLevel::RightNow {
            self.shared.canceled_requested.store(true, Ordering::Release);
            self.shared.do_loop.store(false, Ordering::Release);
            for w in self.workers.lock().unwrap().iter() {
                let _ = w.thread().cancel();
            }
        }
        if let Some(f) = &self.shared.callbacks.shutdown {
            f(level);
        }
        Ok(())
    }

    /// Only from `STARTED`. Cancels every worker and forces `RIGHT_NOW`.
    pub fn cancel(&self) -> Result<()> {
        let state = *self.shared.state.lock().unwrap();
        if state != StageState::Started {
            return Err(Error::InvalidStateTransition(format!(
                "cancel() is invalid from {state:?}"
            )));
        }
        *self.shared.shutdown_level.lock().unwrap() = GraceLevel::RightNow;
        self.shared.canceled_requested.store(true, Ordering::Release);
        self.shared.do_loop.store(false, Ordering::Release);
        for w in self.workers.lock().unwrap().iter() {
            w.thread().cancel()?;
        }
        Ok(())
    }

    /// Only from `STARTED`. Waits for every worker within `timeout`, then
    /// computes the terminal state and runs `finalize`/`shutdown` exactly
    /// once each.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        let workers = self.workers.lock().unwrap().clone();
        let budget = crate::time::DeadlineBudget::new(timeout);
        let mut exited = 0usize;
        for w in &workers {
            let remaining = match budget.remaining() {
                Some(d) => Timeout::from_nsec(d.as_nanos() as i64),
                None => Timeout::Forever,
            };
            match w.thread().wait(remaining) {
                Ok(()) => exited += 1,
                Err(Error::TimedOut) => return Err(Error::TimedOut),
                Err(e) => return Err(e),
            }
        }
        if exited != workers.len() {
            crate::error::fatal(format!(
                "stage {:?}: {exited} workers exited, expected {}",
                self.shared.name,
                workers.len()
            ));
        }

        let was_canceled = self.shared.canceled_requested.load(Ordering::Acquire)
            || self.shared.n_canceled_workers.load(Ordering::Acquire) > 0;
        let terminal = if was_canceled {
            StageState::Canceled
        } else {
            StageState::Shutdown
        };
        *self.shared.state.lock().unwrap() = terminal;
        self.shared.state_cond.notify_all();

        if let Some(f) = &self.shared.callbacks.finalize {
            f(was_canceled);
        }
        let level = *self.shared.shutdown_level.lock().unwrap();
        if let Some(f) = &self.shared.callbacks.shutdown {
            f(level);
        }
        Ok(())
    }

    /// Cancels and waits (infinite timeout), runs `freeup`, unregisters the
    /// name.
    pub fn destroy(&self) -> Result<()> {
        if self.state() == StageState::Started {
            self.cancel()?;
            self.wait(Timeout::Forever)?;
        }
        self.workers.lock().unwrap().clear();
        if let Some(f) = &self.shared.callbacks.freeup {
            f();
        }
        registry::global().unregister(&self.shared.name);
        *self.shared.state.lock().unwrap() = StageState::Destroying;
        Ok(())
    }

    /// Delegates to the user `sched` callback; `hint` is opaque to the
    /// runtime.
    pub fn submit(&self, events: Vec<E>, hint: DispatchHint) -> Result<()> {
        (self.shared.callbacks.sched)(events, hint)
    }

    /// Releases the pause-related locks if the calling worker is cancelled
    /// while inside `pause()` — installed as the cancellation cleanup for
    /// the master/pause locks (spec.md §4.3 `cancel_janitor`).
    pub fn cancel_janitor(&self) {
        self.shared.pause_requested.store(false, Ordering::Release);
        self.shared.resume_cond.notify_all();
        self.shared.pause_cond.notify_all();
    }

    pub fn set_worker_cpu_affinity(&self, worker_index: usize, cpu: i32) -> Result<()> {
        let workers = self.workers.lock().unwrap();
        let w = workers
            .get(worker_index)
            .ok_or_else(|| Error::NotFound(format!("worker {worker_index}")))?;
        w.thread().set_cpu_affinity(cpu);
        Ok(())
    }

    /// Replaces worker `worker_index`'s batch buffer, returning the old one.
    pub fn set_worker_event_buffer(&self, worker_index: usize, new_buffer: Vec<E>) -> Result<Vec<E>> {
        let workers = self.workers.lock().unwrap();
        let w = workers
            .get(worker_index)
            .ok_or_else(|| Error::NotFound(format!("worker {worker_index}")))?;
        Ok(w.set_event_buffer(new_buffer))
    }

    /// Sets the post-start hook every worker invokes once, right after the
    /// process-wide global state reaches `STARTED`.
    pub fn set_post_start_hook(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.shared.post_start_hook.lock().unwrap() = Some(Box::new(hook));
    }
}

// Licensed under the Apache License, Version 2.0.

//! A reference-counted, joinable, cooperatively-cancellable OS thread
//! wrapper (spec.md §2 "Thread handle", §4.2).
//!
//! # Cancellation is cooperative, not asynchronous
//!
//! spec.md §4.2 describes `cancel()` as "asynchronous cancellation at any
//! OS-defined cancellation point" — the C reference relies on
//! `pthread_cancel(3)`, which can interrupt a thread at arbitrary points
//! (syscalls, `cond_wait`, ...) via a cancellation handler pushed on the
//! stack. Safe Rust has no equivalent: there is no way to asynchronously
//! unwind an arbitrary running thread. [`ThreadHandle::cancel`] therefore
//! sets a [`CancelToken`] and invokes every waker registered on it (the same
//! role the C cleanup-handler stack plays); the thread body is expected to
//! check the token at its own well-defined suspension points (this crate's
//! [`crate::bbq::Bbq::get`]/`wait_gettable` already surface a cancelling
//! wakeup as [`crate::error::Error::WakeupRequested`], and the pipeline
//! worker loop checks the token once per iteration). This still satisfies
//! spec.md's invariant that `finalize(canceled=true, ...)` runs exactly
//! once: the thread-body wrapper always calls the finalize callback on its
//! way out, with `canceled` reflecting whether the token had been tripped.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::affinity::AffinityMask;
use crate::error::{Error, Result};
use crate::time::{DeadlineBudget, Timeout};

/// Shared cancellation flag plus the set of wakers to call when it trips.
///
/// A waker is typically `Arc<Bbq<_>>::wakeup`-shaped: something that can
/// interrupt whatever suspension point the thread is currently parked in.
pub struct CancelToken {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken {
            cancelled: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
        }
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Registers a waker invoked by [`Self::trip`]. Typically called once by
    /// the worker body right before it parks on a queue or condvar.
    pub fn register_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        self.wakers.lock().unwrap().push(Box::new(waker));
    }

    fn trip(&self) {
        self.cancelled.store(true, Ordering::Release);
        for w in self.wakers.lock().unwrap().iter() {
            w();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    NotStarted,
    Activated,
    Exited,
}

struct Startup {
    child_started: bool,
    parent_acked: bool,
}

/// A joinable, cancellable OS thread with CPU affinity and a result code.
///
/// Build with [`ThreadHandle::create`], then [`ThreadHandle::start`] it.
/// `main` and `finalize` are ordinary `FnOnce`/`FnMut` closures rather than
/// the C reference's `(fn, arg, free_arg)` triple — whatever they capture is
/// dropped by Rust when the closure itself is dropped, so there is no
/// separate `free` callback (see [`crate::runnable`] for the same
/// simplification applied to [`crate::runnable::Runnable`]).
pub struct ThreadHandle {
    name: String,
    creator_pid: u32,
    cancel: Arc<CancelToken>,
    join: Mutex<Option<JoinHandle<()>>>,
    run_state: Mutex<RunState>,
    run_state_cond: Condvar,
    startup: Mutex<Startup>,
    startup_cond: Condvar,
    finalize_cond: Condvar,
    finalized: Mutex<bool>,
    finalized_count: AtomicU32,
    result_code: AtomicI32,
    op_lock: Mutex<()>,
    affinity: Mutex<AffinityMask>,
    affinity_dirty: AtomicBool,
    autodelete: AtomicBool,
    destroying: AtomicBool,
}

/// What the main body returned, fed to the `finalize` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Err,
    Interrupted,
}

impl ThreadHandle {
    /// Creates a handle. `name` is truncated to 15 characters, matching the
    /// reference's `pthread_setname_np` length limit.
    pub fn create(name: impl Into<String>) -> Arc<Self> {
        let mut name = name.into();
        name.truncate(15);
        Arc::new(ThreadHandle {
            name,
            creator_pid: std::process::id(),
            cancel: Arc::new(CancelToken::default()),
            join: Mutex::new(None),
            run_state: Mutex::new(RunState::NotStarted),
            run_state_cond: Condvar::new(),
            startup: Mutex::new(Startup {
                child_started: false,
                parent_acked: false,
            }),
            startup_cond: Condvar::new(),
            finalize_cond: Condvar::new(),
            finalized: Mutex::new(false),
            finalized_count: AtomicU32::new(0),
            result_code: AtomicI32::new(0),
            op_lock: Mutex::new(()),
            affinity: Mutex::new(AffinityMask::empty()),
            affinity_dirty: AtomicBool::new(false),
            autodelete: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel_token(&self) -> Arc<CancelToken> {
        Arc::clone(&self.cancel)
    }

    fn require_owner(&self) -> Result<()> {
        if self.creator_pid != std::process::id() {
            return Err(Error::NotOwner(format!(
                "thread {:?} may only be cancelled/waited/destroyed by its creator process",
                self.name
            )));
        }
        Ok(())
    }

    /// Spawns the OS thread. `main` receives the shared [`CancelToken`] so it
    /// can register wakers and poll [`CancelToken::is_cancelled`]; `finalize`
    /// runs exactly once, after `main` returns or is observed cancelled,
    /// before the handle is reported `Exited`.
    pub fn start(
        self: &Arc<Self>,
        autodelete: bool,
        main: impl FnOnce(&CancelToken) -> Result<()> + Send + 'static,
        finalize: impl FnOnce(Outcome) + Send + 'static,
    ) -> Result<()> {
        {
            let mut state = self.run_state.lock().unwrap();
            if *state != RunState::NotStarted {
                return Err(Error::invalid_state("thread already started"));
            }
            *state = RunState::Activated;
        }
        self.autodelete.store(autodelete, Ordering::Release);

        let this = Arc::clone(self);
        let initial_mask = self.affinity.lock().unwrap().clone();
        let builder = std::thread::Builder::new().name(self.name.clone());
        let join = builder
            .spawn(move || this.run_body(initial_mask, main, finalize))
            .map_err(|e| Error::PosixApiError(e))?;

        // Startup handshake: wait for the child to report `child_started`,
        // then ack so it can proceed past the gate. This prevents the child
        // from running (and potentially being cancelled) before the parent
        // has observed `started == true`.
        {
            let mut su = self.startup.lock().unwrap();
            while !su.child_started {
                su = self.startup_cond.wait(su).unwrap();
            }
            su.parent_acked = true;
            self.startup_cond.notify_all();
        }

        *self.join.lock().unwrap() = Some(join);
        Ok(())
    }

    fn run_body(
        self: Arc<Self>,
        initial_mask: AffinityMask,
        main: impl FnOnce(&CancelToken) -> Result<()> + Send + 'static,
        finalize: impl FnOnce(Outcome) + Send + 'static,
    ) {
        if !initial_mask.is_empty() {
            if let Err(e) = initial_mask.apply_to_current_thread() {
                tracing::warn!(thread = %self.name, error = %e, "failed to apply initial CPU affinity");
            }
        }

        // Report started, then wait for the parent's ack before doing
        // anything else (spec.md §4.2: "The child will not leave startup
        // until the parent ACKs").
        {
            let mut su = self.startup.lock().unwrap();
            su.child_started = true;
            self.startup_cond.notify_all();
            while !su.parent_acked {
                su = self.startup_cond.wait(su).unwrap();
            }
        }

        let result = if self.cancel.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            main(&self.cancel)
        };

        let outcome = match &result {
            _ if self.cancel.is_cancelled() => Outcome::Interrupted,
            Ok(()) => Outcome::Ok,
            Err(_) => Outcome::Err,
        };
        self.result_code.store(
            match outcome {
                Outcome::Ok => 0,
                Outcome::Err => -1,
                Outcome::Interrupted => -2,
            },
            Ordering::Release,
        );

        let prior = self.finalized_count.fetch_add(1, Ordering::AcqRel);
        if prior > 0 {
            tracing::warn!(thread = %self.name, count = prior + 1, "finalize ran more than once");
        } else {
            finalize(outcome);
        }

        *self.finalized.lock().unwrap() = true;
        self.finalize_cond.notify_all();

        let mut state = self.run_state.lock().unwrap();
        *state = RunState::Exited;
        self.run_state_cond.notify_all();
    }

    /// Cooperatively cancels the thread: trips the [`CancelToken`] and wakes
    /// any registered waker. Does not forcibly terminate the OS thread; see
    /// the module docs.
    pub fn cancel(&self) -> Result<()> {
        self.require_owner()?;
        self.cancel.trip();
        Ok(())
    }

    /// Blocks until the thread exits (`run_state == Exited`), or `timeout`
    /// elapses. `NOT_OPERATIONAL` if the handle was started with
    /// `autodelete`.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        self.require_owner()?;
        if self.autodelete.load(Ordering::Acquire) {
            return Err(Error::NotOperational);
        }
        let budget = DeadlineBudget::new(timeout);
        let mut state = self.run_state.lock().unwrap();
        loop {
            if *state == RunState::Exited {
                return Ok(());
            }
            match budget.remaining() {
                Some(d) if d.is_zero() => return Err(Error::TimedOut),
                Some(d) => {
                    let (s, timed_out) = self.run_state_cond.wait_timeout(state, d).unwrap();
                    state = s;
                    if timed_out.timed_out() && *state != RunState::Exited {
                        return Err(Error::TimedOut);
                    }
                }
                None => state = self.run_state_cond.wait(state).unwrap(),
            }
        }
    }

    /// Sets the CPU-affinity mask. Before [`Self::start`] this only updates
    /// the stored mask; after start, the worker thread re-applies it itself
    /// the next time it checks [`Self::affinity_dirty`] — `core_affinity`
    /// (like the reference's `CPU_SET(3)` wrapper) can only bind the
    /// *calling* thread, so a cross-thread set cannot apply synchronously.
    pub fn set_cpu_affinity(&self, cpu: i32) {
        let mut mask = self.affinity.lock().unwrap();
        mask.set(cpu);
        self.affinity_dirty.store(true, Ordering::Release);
    }

    /// Returns the lowest CPU in the effective mask, or `NOT_DEFINED` if no
    /// mask has been installed.
    pub fn get_cpu_affinity(&self) -> Result<i32> {
        self.affinity
            .lock()
            .unwrap()
            .lowest()
            .ok_or(Error::NotDefined)
    }

    /// Called by the worker body at a loop boundary to pick up a pending
    /// affinity change requested after the thread started.
    pub fn maybe_reapply_affinity(&self) {
        if self.affinity_dirty.swap(false, Ordering::AcqRel) {
            let mask = self.affinity.lock().unwrap().clone();
            if let Err(e) = mask.apply_to_current_thread() {
                tracing::warn!(thread = %self.name, error = %e, "failed to reapply CPU affinity");
            }
        }
    }

    pub fn set_result_code(&self, code: i32) {
        let _guard = self.op_lock.lock().unwrap();
        self.result_code.store(code, Ordering::Release);
    }

    pub fn get_result_code(&self) -> i32 {
        let _guard = self.op_lock.lock().unwrap();
        self.result_code.load(Ordering::Acquire)
    }

    pub fn is_activated(&self) -> bool {
        *self.run_state.lock().unwrap() == RunState::Activated
    }

    /// Cancels (if not already) and joins, then marks the handle destroying.
    /// Idempotent.
    pub fn destroy(&self) -> Result<()> {
        self.require_owner()?;
        if self.destroying.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.is_activated() {
            self.cancel.trip();
            if !self.autodelete.load(Ordering::Acquire) {
                let _ = self.wait(Timeout::Forever);
            }
        }
        if let Some(j) = self.join.lock().unwrap().take() {
            let _ = j.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn start_wait_reports_ok_outcome() {
        let handle = ThreadHandle::create("t1");
        let outcome_seen = Arc::new(AtomicI32::new(-99));
        let outcome_seen2 = Arc::clone(&outcome_seen);
        handle
            .start(
                false,
                |_tok| Ok(()),
                move |outcome| {
                    outcome_seen2.store(
                        match outcome {
                            Outcome::Ok => 0,
                            Outcome::Err => 1,
                            Outcome::Interrupted => 2,
                        },
                        Ordering::SeqCst,
                    );
                },
            )
            .unwrap();
        handle.wait(Timeout::Forever).unwrap();
        assert_eq!(outcome_seen.load(Ordering::SeqCst), 0);
        assert_eq!(handle.get_result_code(), 0);
    }

    #[test]
    fn cancel_trips_token_and_finalize_runs_once() {
        let handle = ThreadHandle::create("t2");
        let finalize_count = Arc::new(AtomicU32::new(0));
        let finalize_count2 = Arc::clone(&finalize_count);
        handle
            .start(
                false,
                |tok| {
                    while !tok.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(Error::Interrupted)
                },
                move |_outcome| {
                    finalize_count2.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        handle.cancel().unwrap();
        handle.wait(Timeout::Forever).unwrap();
        assert_eq!(finalize_count.load(Ordering::SeqCst), 1);
        assert_eq!(handle.get_result_code(), -2);
    }

    #[test]
    fn autodelete_thread_cannot_be_waited_on() {
        let handle = ThreadHandle::create("t3");
        handle.start(true, |_tok| Ok(()), |_| {}).unwrap();
        assert!(matches!(
            handle.wait(Timeout::Nanos(0)),
            Err(Error::NotOperational)
        ));
    }

    #[test]
    fn wait_times_out_while_thread_still_running() {
        let handle = ThreadHandle::create("t4");
        handle
            .start(
                false,
                |tok| {
                    while !tok.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                },
                |_| {},
            )
            .unwrap();
        let res = handle.wait(Timeout::Nanos(1_000_000));
        assert!(matches!(res, Err(Error::TimedOut)));
        handle.destroy().unwrap();
    }

    #[test]
    fn cpu_affinity_round_trips_lowest_bit() {
        let handle = ThreadHandle::create("t5");
        assert!(matches!(handle.get_cpu_affinity(), Err(Error::NotDefined)));
        handle.set_cpu_affinity(0);
        assert_eq!(handle.get_cpu_affinity().unwrap(), 0);
    }
}

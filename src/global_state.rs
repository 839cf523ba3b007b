// Licensed under the Apache License, Version 2.0.

//! The process-wide lifecycle register (spec.md §3 "Global state register",
//! §4.1).
//!
//! Every pipeline worker blocks in [`GlobalState::wait_for`] on
//! [`State::Started`] before entering its loop — the "gala opening" spec.md
//! §9 describes: a single broadcast gate observed by every worker. The
//! callout main loop waits on the same gate before it starts dispatching.
//!
//! This is process-wide by convention: construct one [`GlobalState`] (e.g.
//! behind a `static` or passed down from `main`) and share it by reference
//! or `Arc` with every stage and the callout scheduler. We don't hide it
//! behind a hidden global/`OnceLock` the way the C reference does, so that
//! tests can each build their own isolated instance instead of fighting over
//! process-wide state (spec.md §4.1 "Reset is allowed only for test
//! scaffolding" — in Rust, a fresh instance per test makes that reset
//! unnecessary).

use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::time::{DeadlineBudget, Timeout};

/// A stage in the process-wide lifecycle.
///
/// Forward transitions only follow the canonical order listed here; see
/// [`GlobalState::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Initializing,
    Started,
    AcceptShutdown,
    ShuttingDown,
    Shutdown,
    Finalizing,
    Finalized,
}

impl State {
    fn rank(self) -> u8 {
        match self {
            State::Initializing => 0,
            State::Started => 1,
            State::AcceptShutdown => 2,
            State::ShuttingDown => 3,
            State::Shutdown => 4,
            State::Finalizing => 5,
            State::Finalized => 6,
        }
    }

    /// True for any state that means "the system is on its way out or
    /// gone", mirroring the C macro `IS_GLOBAL_STATE_KINDA_SHUTDOWN`.
    pub fn is_kinda_shutdown(self) -> bool {
        matches!(
            self,
            State::AcceptShutdown | State::ShuttingDown | State::Shutdown
        )
    }
}

/// How urgently a shutdown was requested.
///
/// `Gracefully < RightNow` in strength; a `RightNow` request always wins
/// over a previously-recorded `Gracefully` one (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceLevel {
    None,
    Gracefully,
    RightNow,
}

impl GraceLevel {
    fn strength(self) -> u8 {
        match self {
            GraceLevel::None => 0,
            GraceLevel::Gracefully => 1,
            GraceLevel::RightNow => 2,
        }
    }
}

struct Inner {
    state: State,
    shutdown_level: GraceLevel,
}

/// The process-wide lifecycle state machine plus its shutdown-request
/// channel.
pub struct GlobalState {
    inner: Mutex<Inner>,
    state_cond: Condvar,
    shutdown_cond: Condvar,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalState {
    pub fn new() -> Self {
        GlobalState {
            inner: Mutex::new(Inner {
                state: State::Initializing,
                shutdown_level: GraceLevel::None,
            }),
            state_cond: Condvar::new(),
            shutdown_cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Transitions to `state`. Only forward transitions in the canonical
    /// order are accepted; anything else is [`Error::InvalidStateTransition`].
    pub fn set(&self, state: State) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if state.rank() < guard.state.rank() {
            return Err(Error::InvalidStateTransition(format!(
                "{:?} -> {:?} is not a forward transition",
                guard.state, state
            )));
        }
        guard.state = state;
        drop(guard);
        self.state_cond.notify_all();
        Ok(())
    }

    /// Test-only: force the register back to `Initializing`, bypassing the
    /// forward-only rule. spec.md §3: "Reset is allowed only for test
    /// scaffolding."
    #[cfg(any(test, feature = "test-util"))]
    pub fn reset_for_test(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.state = State::Initializing;
        guard.shutdown_level = GraceLevel::None;
    }

    /// Blocks until `state == target`, any shutdown state is entered, or
    /// `timeout` elapses.
    ///
    /// Returns the actually-observed state and the current shutdown grace
    /// level alongside the `Result` so a caller that gets
    /// `Err(NotOperational)` (because a shutdown state was entered instead
    /// of `target`) can still see what happened.
    pub fn wait_for(&self, target: State, timeout: Timeout) -> Result<(State, GraceLevel)> {
        let budget = DeadlineBudget::new(timeout);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.state == target {
                return Ok((guard.state, guard.shutdown_level));
            }
            if guard.state.is_kinda_shutdown() && target != State::Finalized {
                return Err(Error::NotOperational);
            }
            match budget.remaining() {
                Some(d) if d.is_zero() => return Err(Error::TimedOut),
                Some(d) => {
                    let (g, timed_out) = self.state_cond.wait_timeout(guard, d).unwrap();
                    guard = g;
                    if timed_out.timed_out() && guard.state != target {
                        return Err(Error::TimedOut);
                    }
                }
                None => guard = self.state_cond.wait(guard).unwrap(),
            }
        }
    }

    /// Sets the shutdown channel. Idempotent for an equal or weaker
    /// incoming level; a `RightNow` request always overrides whatever was
    /// recorded before.
    pub fn request_shutdown(&self, level: GraceLevel) {
        let mut guard = self.inner.lock().unwrap();
        if level.strength() >= guard.shutdown_level.strength() {
            guard.shutdown_level = level;
        }
        drop(guard);
        self.shutdown_cond.notify_all();
        self.state_cond.notify_all();
    }

    /// Blocks until [`Self::request_shutdown`] has been called with a level
    /// stronger than [`GraceLevel::None`], or `timeout` elapses.
    pub fn wait_for_shutdown_request(&self, timeout: Timeout) -> Result<GraceLevel> {
        let budget = DeadlineBudget::new(timeout);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.shutdown_level != GraceLevel::None {
                return Ok(guard.shutdown_level);
            }
            match budget.remaining() {
                Some(d) if d.is_zero() => return Err(Error::TimedOut),
                Some(d) => {
                    let (g, timed_out) = self.shutdown_cond.wait_timeout(guard, d).unwrap();
                    guard = g;
                    if timed_out.timed_out() && guard.shutdown_level == GraceLevel::None {
                        return Err(Error::TimedOut);
                    }
                }
                None => guard = self.shutdown_cond.wait(guard).unwrap(),
            }
        }
    }

    pub fn shutdown_level(&self) -> GraceLevel {
        self.inner.lock().unwrap().shutdown_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn forward_transitions_succeed_backward_rejected() {
        let gs = GlobalState::new();
        gs.set(State::Started).unwrap();
        gs.set(State::AcceptShutdown).unwrap();
        assert!(matches!(
            gs.set(State::Started),
            Err(Error::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn wait_for_wakes_on_target_state() {
        let gs = Arc::new(GlobalState::new());
        let gs2 = Arc::clone(&gs);
        let handle = thread::spawn(move || gs2.wait_for(State::Started, Timeout::Forever));
        thread::sleep(std::time::Duration::from_millis(20));
        gs.set(State::Started).unwrap();
        let (state, _) = handle.join().unwrap().unwrap();
        assert_eq!(state, State::Started);
    }

    #[test]
    fn wait_for_reports_shutdown_instead_of_target() {
        let gs = GlobalState::new();
        gs.set(State::Started).unwrap();
        gs.set(State::AcceptShutdown).unwrap();
        let err = gs.wait_for(State::Finalized, Timeout::Nanos(0));
        // target is Finalized (kinda-shutdown-tolerant), so the zero-timeout
        // non-blocking check should report TimedOut, not NotOperational.
        assert!(matches!(err, Err(Error::TimedOut)));
    }

    #[test]
    fn right_now_overrides_gracefully() {
        let gs = GlobalState::new();
        gs.request_shutdown(GraceLevel::Gracefully);
        gs.request_shutdown(GraceLevel::RightNow);
        assert_eq!(gs.shutdown_level(), GraceLevel::RightNow);
        gs.request_shutdown(GraceLevel::Gracefully);
        assert_eq!(gs.shutdown_level(), GraceLevel::RightNow);
    }

    #[test]
    fn wait_for_shutdown_request_blocks_until_requested() {
        let gs = Arc::new(GlobalState::new());
        let gs2 = Arc::clone(&gs);
        let handle = thread::spawn(move || gs2.wait_for_shutdown_request(Timeout::Forever));
        thread::sleep(std::time::Duration::from_millis(20));
        gs.request_shutdown(GraceLevel::Gracefully);
        assert_eq!(handle.join().unwrap().unwrap(), GraceLevel::Gracefully);
    }
}

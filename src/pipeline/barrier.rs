// Licensed under the Apache License, Version 2.0.

//! The pause/maintenance barrier protocol (spec.md §4.3 "Pause protocol" /
//! "Maintenance protocol").
//!
//! All live workers rendezvous on a [`std::sync::Barrier`] sized for
//! `n_workers`; `Barrier::wait` reports exactly one of them as the leader
//! (`BarrierWaitResult::is_leader`), which is the reference's "master
//! determined by the barrier primitive". The master does the state
//! transition and the maintenance call (if any) while every other worker is
//! parked, then all of them re-check `pause_requested` together.

use std::sync::Arc;

use super::{StageShared, StageState};

pub(super) fn run_protocol<E>(shared: &Arc<StageShared<E>>) {
    let wait_result = shared.pause_barrier.wait();

    if wait_result.is_leader() {
        let mut state = shared.state.lock().unwrap();
        let maintenance = shared.maintenance.lock().unwrap().take();
        if let Some(mut m) = maintenance {
            *state = StageState::MaintenanceRequested;
            drop(state);
            m();
            // spec.md §4.3: the master clears pause_requested and restores
            // STARTED itself on the maintenance path — there is no explicit
            // external resume() call to do it, unlike a plain pause. Clear
            // and notify while holding pause_lock, the same lock every
            // worker holds while checking this predicate below, so a
            // worker that hasn't parked on resume_cond yet can't miss it.
            let pause_guard = shared.pause_lock.lock().unwrap();
            shared
                .pause_requested
                .store(false, std::sync::atomic::Ordering::Release);
            shared.resume_cond.notify_all();
            drop(pause_guard);
            state = shared.state.lock().unwrap();
            *state = StageState::Started;
            drop(state);
        } else {
            *state = StageState::Paused;
            drop(state);
        }
        shared.pause_cond.notify_all();
    }

    // Every worker (including the leader) waits here until resume() clears
    // pause_requested, then a second barrier pass keeps them in lockstep
    // before returning to the loop.
    let mut guard = shared.pause_lock.lock().unwrap();
    while shared.pause_requested.load(std::sync::atomic::Ordering::Acquire) {
        guard = shared.resume_cond.wait(guard).unwrap();
    }
    drop(guard);

    shared.post_pause_barrier.wait();

    if wait_result.is_leader() {
        let mut state = shared.state.lock().unwrap();
        *state = StageState::Started;
        drop(state);
        shared.pause_cond.notify_all();
    }
}

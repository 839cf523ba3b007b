// Licensed under the Apache License, Version 2.0.

//! End-to-end pipeline-stage scenarios (spec.md §8, scenarios 1-3).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipeline_rt::global_state::{GlobalState, GraceLevel, State};
use pipeline_rt::pipeline::{Stage, StageCallbacks, WorkerSignal};
use pipeline_rt::time::Timeout;

fn counting_callbacks(
    fetch_count: Arc<AtomicUsize>,
    main_count: Arc<AtomicUsize>,
    throw_count: Arc<AtomicUsize>,
) -> StageCallbacks<u32> {
    let f = Arc::clone(&fetch_count);
    let fetch: pipeline_rt::pipeline::FetchFn<u32> = Box::new(move |_idx, buf| {
        f.fetch_add(1, Ordering::SeqCst);
        buf.push(1);
        std::thread::sleep(Duration::from_millis(5));
        Ok(WorkerSignal::Continue)
    });

    let m = Arc::clone(&main_count);
    let main: pipeline_rt::pipeline::MainFn<u32> = Box::new(move |_idx, buf| {
        m.fetch_add(1, Ordering::SeqCst);
        buf.clear();
        Ok(WorkerSignal::Continue)
    });

    let t = Arc::clone(&throw_count);
    let throw: pipeline_rt::pipeline::ThrowFn<u32> = Box::new(move |_idx, _err| {
        t.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerSignal::Continue)
    });

    StageCallbacks {
        setup: None,
        pre_pause: None,
        fetch: Some(fetch),
        main,
        throw: Some(throw),
        sched: Box::new(|_events, _hint| Ok(())),
        shutdown: None,
        finalize: None,
        freeup: None,
    }
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// spec.md §8 scenario 1: pause fires pre_pause exactly once per worker and
/// halts fetch/main/throw until resume.
#[test]
fn pause_resume_fires_pre_pause_once_per_worker() {
    let global = Arc::new(GlobalState::new());
    let fetch_count = Arc::new(AtomicUsize::new(0));
    let main_count = Arc::new(AtomicUsize::new(0));
    let throw_count = Arc::new(AtomicUsize::new(0));
    let pre_pause_count = Arc::new(AtomicUsize::new(0));

    let mut callbacks = counting_callbacks(
        Arc::clone(&fetch_count),
        Arc::clone(&main_count),
        Arc::clone(&throw_count),
    );
    let pp = Arc::clone(&pre_pause_count);
    callbacks.pre_pause = Some(Box::new(move || {
        pp.fetch_add(1, Ordering::SeqCst);
    }));

    let stage = Stage::create("pause-resume", 2, 4, 4, callbacks, Arc::clone(&global)).unwrap();
    stage.setup().unwrap();
    stage.start().unwrap();
    global.set(State::Started).unwrap();

    assert!(wait_until(|| main_count.load(Ordering::SeqCst) >= 2, Duration::from_secs(1)));

    stage.pause(Timeout::Nanos(1_000_000_000)).unwrap();
    assert_eq!(pre_pause_count.load(Ordering::SeqCst), 2);

    let main_at_pause = main_count.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(main_count.load(Ordering::SeqCst), main_at_pause);

    stage.resume().unwrap();
    assert!(wait_until(
        || main_count.load(Ordering::SeqCst) > main_at_pause,
        Duration::from_secs(1)
    ));

    stage.shutdown(GraceLevel::Gracefully).unwrap();
    stage.wait(Timeout::Forever).unwrap();
}

/// spec.md §8 scenario 2: a scheduled maintenance closure runs under the
/// barrier while every worker is parked.
#[test]
fn maintenance_runs_under_barrier() {
    let global = Arc::new(GlobalState::new());
    let fetch_count = Arc::new(AtomicUsize::new(0));
    let main_count = Arc::new(AtomicUsize::new(0));
    let throw_count = Arc::new(AtomicUsize::new(0));
    let callbacks = counting_callbacks(
        Arc::clone(&fetch_count),
        Arc::clone(&main_count),
        Arc::clone(&throw_count),
    );

    let stage = Stage::create("maintenance", 2, 4, 4, callbacks, Arc::clone(&global)).unwrap();
    stage.setup().unwrap();
    stage.start().unwrap();
    global.set(State::Started).unwrap();

    assert!(wait_until(|| main_count.load(Ordering::SeqCst) >= 2, Duration::from_secs(1)));

    let maint_calls = Arc::new(AtomicUsize::new(0));
    let main_snapshot = Arc::new(Mutex::new(None::<usize>));
    let mc = Arc::clone(&maint_calls);
    let snap = Arc::clone(&main_snapshot);
    let main_count_for_maint = Arc::clone(&main_count);
    stage
        .schedule_maintenance(move || {
            *snap.lock().unwrap() = Some(main_count_for_maint.load(Ordering::SeqCst));
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(
                main_count_for_maint.load(Ordering::SeqCst),
                snap.lock().unwrap().unwrap()
            );
            mc.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert_eq!(maint_calls.load(Ordering::SeqCst), 1);

    stage.shutdown(GraceLevel::Gracefully).unwrap();
    stage.wait(Timeout::Forever).unwrap();
}

/// spec.md §8 scenario 3: 4 ingress shards sum `0..999_999`.
#[test]
fn sums_one_million_values_across_four_workers() {
    let global = Arc::new(GlobalState::new());
    let accumulator = Arc::new(AtomicU64::new(0));
    let n: u64 = 1_000_000;
    let n_workers = 4usize;
    let shard_size = n.div_ceil(n_workers as u64);
    let cursors: Arc<Vec<AtomicU64>> = Arc::new((0..n_workers).map(|_| AtomicU64::new(0)).collect());

    let sum = Arc::clone(&accumulator);
    let main: pipeline_rt::pipeline::MainFn<u64> = Box::new(move |_idx, buf| {
        let partial: u64 = buf.drain(..).sum();
        sum.fetch_add(partial, Ordering::Relaxed);
        Ok(WorkerSignal::Continue)
    });

    let batch = 997u64;
    let fetch: pipeline_rt::pipeline::FetchFn<u64> = Box::new(move |idx, buf| {
        let shard_start = idx as u64 * shard_size;
        let shard_end = (shard_start + shard_size).min(n);
        let pos = cursors[idx].fetch_add(batch, Ordering::Relaxed);
        let lo = shard_start + pos;
        if lo >= shard_end {
            return Ok(WorkerSignal::StopGraceful);
        }
        let hi = (lo + batch).min(shard_end);
        buf.extend(lo..hi);
        Ok(WorkerSignal::Continue)
    });

    let callbacks = StageCallbacks {
        setup: None,
        pre_pause: None,
        fetch: Some(fetch),
        main,
        throw: None,
        sched: Box::new(|_events, _hint| Ok(())),
        shutdown: None,
        finalize: None,
        freeup: None,
    };

    let stage = Stage::create("sum-shards", n_workers, 8, batch as usize, callbacks, Arc::clone(&global)).unwrap();
    stage.setup().unwrap();
    stage.start().unwrap();
    global.set(State::Started).unwrap();

    stage.wait(Timeout::Forever).unwrap();
    assert_eq!(accumulator.load(Ordering::Relaxed), 499_999_500_000);

    stage.destroy().unwrap();
}

#[test]
fn duplicate_stage_name_rejected() {
    let global = Arc::new(GlobalState::new());
    let callbacks = |count: Arc<AtomicUsize>| -> StageCallbacks<u32> {
        StageCallbacks {
            setup: None,
            pre_pause: None,
            fetch: None,
            main: Box::new(move |_idx, _buf| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(WorkerSignal::StopGraceful)
            }),
            throw: None,
            sched: Box::new(|_events, _hint| Ok(())),
            shutdown: None,
            finalize: None,
            freeup: None,
        }
    };

    let first = Stage::create(
        "dup-name",
        1,
        4,
        4,
        callbacks(Arc::new(AtomicUsize::new(0))),
        Arc::clone(&global),
    )
    .unwrap();

    let err = Stage::create(
        "dup-name",
        1,
        4,
        4,
        callbacks(Arc::new(AtomicUsize::new(0))),
        Arc::clone(&global),
    )
    .unwrap_err();
    assert!(matches!(err, pipeline_rt::Error::AlreadyExists(_)));

    first.setup().unwrap();
    first.start().unwrap();
    global.set(State::Started).unwrap();
    first.destroy().unwrap();
}

// Licensed under the Apache License, Version 2.0.

//! End-to-end callout-scheduler scenarios (spec.md §8, scenarios 4-6).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use pipeline_rt::callout::{Scheduler, TaskStatus};
use pipeline_rt::config::Config;
use pipeline_rt::global_state::{GlobalState, State};

fn started_scheduler(n_workers: usize) -> (Arc<GlobalState>, Arc<Scheduler>) {
    let global = Arc::new(GlobalState::new());
    let config = Config::default();
    let scheduler = Arc::new(
        Scheduler::initialize_handler(n_workers, None, Duration::from_millis(100), Arc::clone(&global), &config)
            .unwrap(),
    );
    global.set(State::Started).unwrap();

    let loop_scheduler = Arc::clone(&scheduler);
    // Dropping the JoinHandle doesn't stop the thread; it runs until
    // `stop_main_loop` (called from `finalize_handler`) lets it return.
    let _handle = thread::spawn(move || loop_scheduler.start_main_loop());

    (global, scheduler)
}

/// spec.md §8 scenario 4: exactly one canceller reclaims a racing task.
#[test]
fn cancel_race_has_exactly_one_free_and_reaches_unknown() {
    let (_global, scheduler) = started_scheduler(2);

    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    let task = scheduler.create_task(
        "periodic",
        Box::new(move |_ctx| {
            thread::sleep(Duration::from_millis(50));
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    let task_id = task.id();
    scheduler
        .submit_task(&task, 0, Duration::from_millis(100).as_nanos() as i64)
        .unwrap();

    thread::sleep(Duration::from_millis(200));

    let ok_count = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let task = Arc::clone(&task);
            let barrier = Arc::clone(&barrier);
            let ok_count = Arc::clone(&ok_count);
            thread::spawn(move || {
                barrier.wait();
                if scheduler.cancel_task(&task).is_ok() {
                    ok_count.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let fired = counter.load(Ordering::SeqCst);
    assert!((1..=3).contains(&fired), "fired {fired} times");
    // Every cancel_task call is serialized behind the scheduler's global
    // lock, so exactly one caller ever observes exec_ref_count > 0 and runs
    // the drain-and-reclaim path; the rest see an already-CANCELLED task.
    assert_eq!(ok_count.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.task_state(task_id), TaskStatus::Unknown);

    scheduler.finalize_handler().unwrap();
}

/// spec.md §8 scenario 5: an urgent task runs once, a periodic timed task
/// fires on its interval.
#[test]
fn timed_task_fires_on_its_interval_urgent_task_runs_once() {
    let (_global, scheduler) = started_scheduler(1);

    let urgent_count = Arc::new(AtomicUsize::new(0));
    let uc = Arc::clone(&urgent_count);
    let t_b = scheduler.create_task("urgent", Box::new(move |_ctx| {
        uc.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    scheduler.submit_task(&t_b, -1, 0).unwrap();

    let periodic_count = Arc::new(AtomicUsize::new(0));
    let pc = Arc::clone(&periodic_count);
    let t_a = scheduler.create_task("periodic", Box::new(move |_ctx| {
        pc.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    scheduler
        .submit_task(&t_a, Duration::from_millis(10).as_nanos() as i64, Duration::from_millis(10).as_nanos() as i64)
        .unwrap();

    thread::sleep(Duration::from_millis(300));

    assert_eq!(urgent_count.load(Ordering::SeqCst), 1);
    assert!(periodic_count.load(Ordering::SeqCst) >= 10);

    scheduler.finalize_handler().unwrap();
}

/// spec.md §8 scenario 6: queued urgent tasks drain before the loop stops.
#[test]
fn stop_main_loop_drains_in_flight_urgent_tasks() {
    let (_global, scheduler) = started_scheduler(2);

    let counter = Arc::new(AtomicUsize::new(0));
    for i in 0..3 {
        let c = Arc::clone(&counter);
        let task = scheduler.create_task(format!("urgent-{i}"), Box::new(move |_ctx| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        scheduler.submit_task(&task, -1, 0).unwrap();
    }

    thread::sleep(Duration::from_millis(100));
    scheduler.stop_main_loop();
    thread::sleep(Duration::from_millis(50));

    assert_eq!(counter.load(Ordering::SeqCst), 3);

    scheduler.finalize_handler().unwrap();
}

#[test]
fn sub_floor_interval_is_rejected() {
    let (_global, scheduler) = started_scheduler(1);
    let task = scheduler.create_task("too-fast", Box::new(|_ctx| Ok(())));
    let err = scheduler.submit_task(&task, 0, 1_000).unwrap_err();
    assert!(matches!(err, pipeline_rt::Error::TooSmall(_)));
    scheduler.finalize_handler().unwrap();
}

// Licensed under the Apache License, Version 2.0.

//! A small CLI exercising the library end to end: an ingress stage with
//! `workers` shards summing `0..n` via an atomic accumulator, reporting
//! wall-clock throughput.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use pipeline_rt::error::Result;
use pipeline_rt::global_state::{GlobalState, State};
use pipeline_rt::pipeline::{Stage, StageCallbacks, WorkerSignal};
use pipeline_rt::time::Timeout;

#[derive(Parser)]
#[command(about = "Pipeline-stage runtime demo: sums 0..n across worker shards")]
struct Args {
    /// Number of values to sum.
    #[arg(long, default_value_t = 1_000_000)]
    n: u64,

    /// Number of pipeline workers (and shards).
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Values fetched per batch.
    #[arg(long, default_value_t = 1024)]
    batch: u64,
}

fn main() -> Result<()> {
    pipeline_rt::logging::init();
    let args = Args::parse();

    let global = Arc::new(GlobalState::new());
    let accumulator = Arc::new(AtomicU64::new(0));
    let shard_size = args.n.div_ceil(args.workers as u64);
    let cursors: Arc<Vec<AtomicU64>> = Arc::new((0..args.workers).map(|_| AtomicU64::new(0)).collect());

    let sum = Arc::clone(&accumulator);
    let main_fn: pipeline_rt::pipeline::MainFn<u64> = Box::new(move |_idx, buf| {
        let partial: u64 = buf.drain(..).sum();
        sum.fetch_add(partial, Ordering::Relaxed);
        Ok(WorkerSignal::Continue)
    });

    let n = args.n;
    let batch = args.batch;
    let fetch_fn: pipeline_rt::pipeline::FetchFn<u64> = Box::new(move |idx, buf| {
        let shard_start = idx as u64 * shard_size;
        let shard_end = (shard_start + shard_size).min(n);
        let cursor = &cursors[idx];
        let pos = cursor.fetch_add(batch, Ordering::Relaxed);
        let lo = shard_start + pos;
        if lo >= shard_end {
            return Ok(WorkerSignal::StopGraceful);
        }
        let hi = (lo + batch).min(shard_end);
        buf.extend(lo..hi);
        Ok(WorkerSignal::Continue)
    });

    let sched: pipeline_rt::pipeline::SchedFn<u64> = Box::new(|_events, _hint| Ok(()));

    let callbacks = StageCallbacks {
        setup: None,
        pre_pause: None,
        fetch: Some(fetch_fn),
        main: main_fn,
        throw: None,
        sched,
        shutdown: None,
        finalize: None,
        freeup: None,
    };

    let stage = Stage::create(
        "demo-sum",
        args.workers,
        8,
        args.batch as usize,
        callbacks,
        Arc::clone(&global),
    )?;
    stage.setup()?;
    stage.start()?;
    global.set(State::Started)?;

    let start = Instant::now();
    stage.wait(Timeout::Forever)?;
    let elapsed = start.elapsed();

    let total = accumulator.load(Ordering::Relaxed);
    println!(
        "summed 0..{} across {} workers: {total} in {elapsed:?}",
        args.n, args.workers
    );
    let expected = args.n * (args.n.saturating_sub(1)) / 2;
    if total != expected {
        eprintln!("warning: expected {expected}, got {total}");
    }

    stage.destroy()?;
    Ok(())
}

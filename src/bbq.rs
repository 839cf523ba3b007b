// Licensed under the Apache License, Version 2.0.

//! A bounded, blocking, multi-producer multi-consumer queue.
//!
//! spec.md §1 lists the reference `bbq` as out of scope for re-design, and
//! §6 gives only its contract: `put`/`get` with timeouts, batch `put_n`/
//! `get_n`, a `wait_gettable` pre-check, a cooperative `wakeup`, and
//! `shutdown`/`destroy` that drain and free remaining values. Every FIFO in
//! `callout` (urgent queue, idle queue, per-worker callout-stage queues) is
//! built on this type.
//!
//! `put`/`get` returning [`crate::Error::WakeupRequested`] is a cooperative
//! interruption, not a failure — callers loop back around rather than
//! propagating it as an error.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::time::{DeadlineBudget, Timeout};

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    shut_down: bool,
    /// Bumped on every `wakeup()`/`put`/`shutdown` so a waiter can
    /// distinguish "spuriously notified, recheck" from "actually woken".
    generation: u64,
}

/// A bounded blocking queue of `T`.
pub struct Bbq<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Bbq<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bbq capacity must be positive");
        Bbq {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                shut_down: false,
                generation: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Push one value, blocking up to `timeout` while the queue is full.
    pub fn put(&self, value: T, timeout: Timeout) -> Result<()> {
        let budget = DeadlineBudget::new(timeout);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.shut_down {
                return Err(Error::NotOperational);
            }
            if guard.items.len() < guard.capacity {
                guard.items.push_back(value);
                self.not_empty.notify_one();
                return Ok(());
            }
            match budget.remaining() {
                Some(d) if d.is_zero() => return Err(Error::TimedOut),
                Some(d) => {
                    let (g, timed_out) = self.not_full.wait_timeout(guard, d).unwrap();
                    guard = g;
                    if timed_out.timed_out() && guard.items.len() >= guard.capacity {
                        return Err(Error::TimedOut);
                    }
                }
                None => guard = self.not_full.wait(guard).unwrap(),
            }
        }
    }

    /// Pop one value, blocking up to `timeout` while the queue is empty.
    pub fn get(&self, timeout: Timeout) -> Result<T> {
        let budget = DeadlineBudget::new(timeout);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(v) = guard.items.pop_front() {
                self.not_full.notify_one();
                return Ok(v);
            }
            if guard.shut_down {
                return Err(Error::NotOperational);
            }
            let gen_before = guard.generation;
            match budget.remaining() {
                Some(d) if d.is_zero() => return Err(Error::TimedOut),
                Some(d) => {
                    let (g, timed_out) = self.not_empty.wait_timeout(guard, d).unwrap();
                    guard = g;
                    if guard.generation != gen_before && guard.items.is_empty() {
                        return Err(Error::WakeupRequested);
                    }
                    if timed_out.timed_out() && guard.items.is_empty() {
                        return Err(Error::TimedOut);
                    }
                }
                None => {
                    guard = self.not_empty.wait(guard).unwrap();
                    if guard.generation != gen_before && guard.items.is_empty() {
                        return Err(Error::WakeupRequested);
                    }
                }
            }
        }
    }

    /// Non-blocking drain of up to `max` items, returning however many were
    /// immediately available (possibly zero, never blocks).
    pub fn drain_n(&self, max: usize) -> Vec<T> {
        let mut guard = self.inner.lock().unwrap();
        let n = max.min(guard.items.len());
        let drained: Vec<T> = guard.items.drain(..n).collect();
        if n > 0 {
            self.not_full.notify_all();
        }
        drained
    }

    /// Push as many of `values` as fit without exceeding capacity,
    /// returning the count actually enqueued ("got so far" on partial
    /// success, matching spec.md §6 `put_n`).
    pub fn put_n(&self, values: Vec<T>, timeout: Timeout) -> Result<usize> {
        let budget = DeadlineBudget::new(timeout);
        let mut guard = self.inner.lock().unwrap();
        let mut iter = values.into_iter();
        let mut put_count = 0usize;
        loop {
            if guard.shut_down {
                return if put_count > 0 {
                    Ok(put_count)
                } else {
                    Err(Error::NotOperational)
                };
            }
            while guard.items.len() < guard.capacity {
                match iter.next() {
                    Some(v) => {
                        guard.items.push_back(v);
                        put_count += 1;
                    }
                    None => {
                        self.not_empty.notify_all();
                        return Ok(put_count);
                    }
                }
            }
            self.not_empty.notify_all();
            match budget.remaining() {
                Some(d) if d.is_zero() => return Ok(put_count),
                Some(d) => {
                    let (g, timed_out) = self.not_full.wait_timeout(guard, d).unwrap();
                    guard = g;
                    if timed_out.timed_out() {
                        return Ok(put_count);
                    }
                }
                None => guard = self.not_full.wait(guard).unwrap(),
            }
        }
    }

    /// Blocks until at least one item is gettable (without consuming it),
    /// or until `timeout`/a `wakeup()` fires.
    pub fn wait_gettable(&self, timeout: Timeout) -> Result<()> {
        let budget = DeadlineBudget::new(timeout);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if !guard.items.is_empty() {
                return Ok(());
            }
            if guard.shut_down {
                return Err(Error::NotOperational);
            }
            let gen_before = guard.generation;
            match budget.remaining() {
                Some(d) if d.is_zero() => return Err(Error::TimedOut),
                Some(d) => {
                    let (g, timed_out) = self.not_empty.wait_timeout(guard, d).unwrap();
                    guard = g;
                    if guard.generation != gen_before && guard.items.is_empty() {
                        return Err(Error::WakeupRequested);
                    }
                    if timed_out.timed_out() && guard.items.is_empty() {
                        return Err(Error::TimedOut);
                    }
                }
                None => {
                    guard = self.not_empty.wait(guard).unwrap();
                    if guard.generation != gen_before && guard.items.is_empty() {
                        return Err(Error::WakeupRequested);
                    }
                }
            }
        }
    }

    /// Cooperatively wakes every thread blocked in `get`/`wait_gettable`,
    /// whether or not there's anything to get. Used by the callout master
    /// loop to interrupt its own sleep when a new timed task is submitted.
    pub fn wakeup(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.generation = guard.generation.wrapping_add(1);
        self.not_empty.notify_all();
    }

    /// Marks the queue shut down: all blocked and future `put`/`get` calls
    /// return `NotOperational`. Optionally drains remaining values through
    /// `free_values` so they are not silently leaked.
    pub fn shutdown(&self, mut free_values: impl FnMut(T)) {
        let mut guard = self.inner.lock().unwrap();
        guard.shut_down = true;
        guard.generation = guard.generation.wrapping_add(1);
        for v in guard.items.drain(..) {
            free_values(v);
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn clear(&self, mut free_values: impl FnMut(T)) {
        let mut guard = self.inner.lock().unwrap();
        for v in guard.items.drain(..) {
            free_values(v);
        }
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn put_get_fifo_order() {
        let q: Bbq<u32> = Bbq::new(4);
        q.put(1, Timeout::Nanos(0)).unwrap();
        q.put(2, Timeout::Nanos(0)).unwrap();
        assert_eq!(q.get(Timeout::Nanos(0)).unwrap(), 1);
        assert_eq!(q.get(Timeout::Nanos(0)).unwrap(), 2);
    }

    #[test]
    fn put_blocks_when_full_then_succeeds() {
        let q = Arc::new(Bbq::<u32>::new(1));
        q.put(1, Timeout::Forever).unwrap();

        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.put(2, Timeout::Forever));

        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(q.get(Timeout::Forever).unwrap(), 1);
        handle.join().unwrap().unwrap();
        assert_eq!(q.get(Timeout::Forever).unwrap(), 2);
    }

    #[test]
    fn get_on_empty_times_out() {
        let q: Bbq<u32> = Bbq::new(1);
        let err = q.get(Timeout::Nanos(1_000_000)).unwrap_err();
        assert!(matches!(err, Error::TimedOut));
    }

    #[test]
    fn wakeup_interrupts_blocked_get() {
        let q = Arc::new(Bbq::<u32>::new(1));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.get(Timeout::Forever));
        thread::sleep(std::time::Duration::from_millis(20));
        q.wakeup();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::WakeupRequested));
    }

    #[test]
    fn shutdown_frees_remaining_and_rejects_new_ops() {
        let q: Bbq<u32> = Bbq::new(4);
        q.put(1, Timeout::Nanos(0)).unwrap();
        q.put(2, Timeout::Nanos(0)).unwrap();
        let mut freed = Vec::new();
        q.shutdown(|v| freed.push(v));
        assert_eq!(freed, vec![1, 2]);
        assert!(matches!(
            q.put(3, Timeout::Nanos(0)),
            Err(Error::NotOperational)
        ));
        assert!(matches!(
            q.get(Timeout::Nanos(0)),
            Err(Error::NotOperational)
        ));
    }

    #[test]
    fn drain_n_never_blocks() {
        let q: Bbq<u32> = Bbq::new(4);
        q.put(1, Timeout::Nanos(0)).unwrap();
        let drained = q.drain_n(10);
        assert_eq!(drained, vec![1]);
        assert!(q.drain_n(10).is_empty());
    }
}

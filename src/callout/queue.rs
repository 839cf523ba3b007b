// Licensed under the Apache License, Version 2.0.

//! The timed task queue (spec.md §3 "Task tables and queues": "doubly linked
//! timed queue ordered by strictly non-decreasing `next_abstime`, ties broken
//! by insertion order").
//!
//! `original_source/src/lib/callout_queue.c` keeps this as an actual
//! intrusive doubly linked list so it can unlink an arbitrary task in O(1)
//! once found. A `BTreeMap` keyed on `(AbsTime, insertion_seq)` gives the
//! same ordering and tie-breaking with `O(log n)` insert/remove, which is a
//! better fit for safe Rust than hand-rolled intrusive links; the seq
//! counter reproduces "ties broken by insertion order" exactly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::time::AbsTime;

use super::task::{CalloutTask, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey(AbsTime, u64);

/// The timed queue plus a side index so a task can be unscheduled by id
/// without a linear scan (`cancel_task` on an `ENQUEUED` timed task).
pub struct TimedQueue {
    entries: Mutex<TimedQueueInner>,
    seq: AtomicU64,
}

struct TimedQueueInner {
    by_time: BTreeMap<QueueKey, Arc<CalloutTask>>,
    key_of: std::collections::HashMap<TaskId, QueueKey>,
}

impl Default for TimedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimedQueue {
    pub fn new() -> Self {
        TimedQueue {
            entries: Mutex::new(TimedQueueInner {
                by_time: BTreeMap::new(),
                key_of: std::collections::HashMap::new(),
            }),
            seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `task` to fire at `at`. If `task` is already present it is
    /// first removed, so re-scheduling a periodic task moves it rather than
    /// duplicating it.
    pub fn insert(&self, task: Arc<CalloutTask>, at: AbsTime) {
        let key = QueueKey(at, self.seq.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.entries.lock().unwrap();
        if let Some(old_key) = guard.key_of.remove(&task.id()) {
            guard.by_time.remove(&old_key);
        }
        guard.key_of.insert(task.id(), key);
        guard.by_time.insert(key, task);
    }

    /// Removes and returns `task_id` if it is currently scheduled.
    pub fn remove(&self, task_id: TaskId) -> Option<Arc<CalloutTask>> {
        let mut guard = self.entries.lock().unwrap();
        let key = guard.key_of.remove(&task_id)?;
        guard.by_time.remove(&key)
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.entries.lock().unwrap().key_of.contains_key(&task_id)
    }

    /// Drains every entry regardless of due time, used by
    /// `finalize_handler` to destroy whatever is still scheduled.
    pub fn drain_all(&self) -> Vec<Arc<CalloutTask>> {
        let mut guard = self.entries.lock().unwrap();
        guard.key_of.clear();
        std::mem::take(&mut guard.by_time).into_values().collect()
    }

    /// Pops every task due at or before `now + jitter`, in non-decreasing
    /// `next_abstime` order (ties by insertion order). Also returns the
    /// earliest remaining `next_abstime`, if any (`next_wakeup`, spec.md
    /// §4.4 step 3).
    pub fn drain_due(&self, now: AbsTime, jitter: std::time::Duration) -> (Vec<Arc<CalloutTask>>, Option<AbsTime>) {
        let cutoff = now.plus(jitter);
        let mut guard = self.entries.lock().unwrap();
        let mut due = Vec::new();
        loop {
            let Some((&key, _)) = guard.by_time.iter().next() else {
                break;
            };
            if key.0 > cutoff {
                break;
            }
            let task = guard.by_time.remove(&key).unwrap();
            guard.key_of.remove(&task.id());
            due.push(task);
        }
        let next_wakeup = guard.by_time.keys().next().map(|k| k.0);
        (due, next_wakeup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callout::task::CalloutTask;
    use std::time::Duration;

    fn task(name: &str) -> Arc<CalloutTask> {
        Arc::new(CalloutTask::new(name, Box::new(|_ctx| Ok(()))))
    }

    #[test]
    fn drains_due_in_time_then_insertion_order() {
        let q = TimedQueue::new();
        let now = AbsTime::now();
        let a = task("a");
        let b = task("b");
        let c = task("c");
        q.insert(a.clone(), now);
        q.insert(b.clone(), now);
        q.insert(c.clone(), now.plus(Duration::from_secs(10)));

        let (due, next) = q.drain_due(now, Duration::from_micros(1));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id(), a.id());
        assert_eq!(due[1].id(), b.id());
        assert!(next.is_some());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_unschedules_a_pending_task() {
        let q = TimedQueue::new();
        let t = task("t");
        q.insert(t.clone(), AbsTime::now().plus(Duration::from_secs(60)));
        assert!(q.contains(t.id()));
        let removed = q.remove(t.id()).unwrap();
        assert_eq!(removed.id(), t.id());
        assert!(!q.contains(t.id()));
    }
}

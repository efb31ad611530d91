// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::task::Task;
use core::cmp::Ordering;
use std::collections::BinaryHeap;

/// Time-ordered task queue, owned by the worker thread.
///
/// Tasks are ordered by (run time, submission sequence); the sequence number
/// makes ties stable, so tasks submitted for the same instant run in
/// submission order. A run time of 0 means "as soon as possible" and sorts
/// before everything else, which also means such tasks still run when the
/// loop's clock fails and "now" is unknown.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

struct Entry {
    run_at: u64,
    seq: u64,
    task: Task,
}

// === impl Scheduler ===

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule_now(&mut self, task: Task) {
        self.insert(0, task);
    }

    pub(crate) fn schedule_at(&mut self, task: Task, run_at_nanos: u64) {
        self.insert(run_at_nanos, task);
    }

    fn insert(&mut self, run_at: u64, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::trace!(task = task.name(), run_at, seq, "scheduling task");
        self.heap.push(Entry { run_at, seq, task });
    }

    /// Pops the next task due at `now`, if any.
    ///
    /// Tasks a running task schedules for "now" are due immediately, so a
    /// caller looping on `pop_due` drains to a fixed point before returning
    /// to the kernel.
    pub(crate) fn pop_due(&mut self, now: u64) -> Option<Task> {
        if self.heap.peek().is_some_and(|entry| entry.run_at <= now) {
            return self.heap.pop().map(|entry| entry.task);
        }
        None
    }

    pub(crate) fn next_run_time(&self) -> Option<u64> {
        self.heap.peek().map(|entry| entry.run_at)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Removes every remaining task, in schedule order. Used at destroy time
    /// to deliver cancellations.
    pub(crate) fn drain_all(&mut self) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            tasks.push(entry.task);
        }
        tasks
    }
}

// === impl Entry ===

// BinaryHeap is a max-heap; the ordering is reversed so the heap yields the
// earliest (run_at, seq) pair first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.run_at, other.seq).cmp(&(self.run_at, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entry")
            .field("run_at", &self.run_at)
            .field("seq", &self.seq)
            .field("task", &self.task)
            .finish()
    }
}

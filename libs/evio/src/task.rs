// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Why a [`Task`]'s callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task's scheduled time has come.
    Run,
    /// The loop is being destroyed before the task could run.
    Canceled,
}

/// A unit of work for an event loop.
///
/// The callback runs exactly once, on the loop's worker thread (or, for tasks
/// still pending when the loop is destroyed, on the destroying thread with
/// [`TaskStatus::Canceled`]). Callbacks must not block; the loop is
/// cooperatively scheduled.
pub struct Task {
    /// Scheduled run time in monotonic nanoseconds; 0 means "as soon as
    /// possible".
    run_at_nanos: u64,
    name: &'static str,
    callback: Box<dyn FnOnce(TaskStatus) + Send>,
}

// === impl Task ===

impl Task {
    pub fn new(callback: impl FnOnce(TaskStatus) + Send + 'static) -> Self {
        Self {
            run_at_nanos: 0,
            name: "<unnamed task>",
            callback: Box::new(callback),
        }
    }

    /// Attach a debug label to this task; it will show up in trace output.
    #[must_use]
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn run_at_nanos(&self) -> u64 {
        self.run_at_nanos
    }

    pub(crate) fn set_run_at_nanos(&mut self, run_at_nanos: u64) {
        self.run_at_nanos = run_at_nanos;
    }

    pub(crate) fn run(self, status: TaskStatus) {
        tracing::trace!(task = self.name, ?status, "running task");
        (self.callback)(status);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("run_at_nanos", &self.run_at_nanos)
            .finish_non_exhaustive()
    }
}

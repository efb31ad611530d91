// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Mutex;
use crate::task::Task;
use core::mem;
use std::collections::VecDeque;

/// Lifecycle of an event loop worker thread.
///
/// Two copies of this state exist: one inside the [`Mailbox`] (authoritative
/// for external mutation) and one private to the worker (authoritative for
/// the event pump). The worker snapshots the mailbox copy during
/// [`Mailbox::drain`] and transitions its private copy itself, so its hot
/// path never reads mailbox fields outside of `drain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    Ready,
    Running,
    Stopping,
}

/// The rendezvous point between external submitter threads and the worker.
///
/// Everything that crosses the thread boundary lives behind this one mutex:
/// pending task submissions, the externally-visible lifecycle state, and the
/// `signaled` flag. `signaled` is true iff a wake byte has been written to
/// the loop's wake channel and not yet consumed; it exists only to avoid
/// redundant writes, bounding pipe-buffer consumption to one byte in flight
/// no matter how many submissions race between two worker drains.
#[derive(Debug)]
pub(crate) struct Mailbox {
    shared: Mutex<Shared>,
}

#[derive(Debug)]
struct Shared {
    signaled: bool,
    tasks: VecDeque<Task>,
    state: LoopState,
}

// === impl Mailbox ===

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                signaled: false,
                tasks: VecDeque::new(),
                state: LoopState::Ready,
            }),
        }
    }

    /// Appends a task. Returns true if the caller must write to the wake
    /// channel; the write happens outside the lock.
    #[must_use]
    pub(crate) fn post(&self, task: Task) -> bool {
        let mut shared = self.shared.lock().unwrap();
        shared.tasks.push_back(task);
        !mem::replace(&mut shared.signaled, true)
    }

    /// Requests the running worker to stop. Idempotent: in any non-running
    /// state this is a no-op. Returns true if the caller must write to the
    /// wake channel.
    #[must_use]
    pub(crate) fn request_stop(&self) -> bool {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != LoopState::Running {
            return false;
        }
        shared.state = LoopState::Stopping;
        tracing::debug!("stop requested");
        !mem::replace(&mut shared.signaled, true)
    }

    /// Takes every pending task and clears the wake signal, returning a
    /// snapshot of the lifecycle state. Only the worker calls this while the
    /// loop is running.
    ///
    /// `out` must be empty; the pending queue is spliced into it in O(1).
    pub(crate) fn drain(&self, out: &mut VecDeque<Task>) -> LoopState {
        debug_assert!(out.is_empty());
        let mut shared = self.shared.lock().unwrap();
        shared.signaled = false;
        mem::swap(&mut shared.tasks, out);
        shared.state
    }

    pub(crate) fn state(&self) -> LoopState {
        self.shared.lock().unwrap().state
    }

    /// Sets the lifecycle state directly. Only used by `run` and `join`,
    /// which hold the documented exclusive-access preconditions (the worker
    /// is unstarted or already joined).
    pub(crate) fn set_state(&self, state: LoopState) {
        self.shared.lock().unwrap().state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;
    use crate::loom::thread;

    fn noop_task() -> Task {
        Task::new(|_| {})
    }

    #[test]
    fn concurrent_posts_claim_exactly_one_wake() {
        loom::model(|| {
            let mailbox = Arc::new(Mailbox::new());

            let remote = {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || mailbox.post(noop_task()))
            };
            let local_wake = mailbox.post(noop_task());
            let remote_wake = remote.join().unwrap();

            // No drain happened in between, so exactly one submitter saw
            // `signaled == false` and owes the pipe a write.
            assert!(local_wake ^ remote_wake);

            let mut out = VecDeque::new();
            mailbox.drain(&mut out);
            assert_eq!(out.len(), 2);

            // The drain consumed the signal; the next post signals again.
            assert!(mailbox.post(noop_task()));
        });
    }

    #[test]
    fn stop_races_are_idempotent() {
        loom::model(|| {
            let mailbox = Arc::new(Mailbox::new());
            mailbox.set_state(LoopState::Running);

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let mailbox = Arc::clone(&mailbox);
                    thread::spawn(move || mailbox.request_stop())
                })
                .collect();
            let mut wakes = usize::from(mailbox.request_stop());
            for handle in handles {
                wakes += usize::from(handle.join().unwrap());
            }

            // Only the transition out of Running claims the wake.
            assert_eq!(wakes, 1);
            assert_eq!(mailbox.state(), LoopState::Stopping);
        });
    }

    #[test]
    fn stop_outside_running_is_a_no_op() {
        loom::model(|| {
            let mailbox = Mailbox::new();
            assert!(!mailbox.request_stop());
            assert_eq!(mailbox.state(), LoopState::Ready);

            mailbox.set_state(LoopState::Stopping);
            assert!(!mailbox.request_stop());
            assert_eq!(mailbox.state(), LoopState::Stopping);
        });
    }

    #[test]
    fn posts_and_stop_interleave_with_one_outstanding_wake() {
        loom::model(|| {
            let mailbox = Arc::new(Mailbox::new());
            mailbox.set_state(LoopState::Running);

            let poster = {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || usize::from(mailbox.post(noop_task())))
            };
            let stopper = {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || usize::from(mailbox.request_stop()))
            };

            let wakes = poster.join().unwrap() + stopper.join().unwrap();
            assert_eq!(wakes, 1);

            let mut out = VecDeque::new();
            let state = mailbox.drain(&mut out);
            assert_eq!(state, LoopState::Stopping);
            assert_eq!(out.len(), 1);
        });
    }

    #[test]
    fn single_thread_posts_drain_in_order() {
        loom::model(|| {
            let mailbox = Mailbox::new();
            for name in ["a", "b", "c"] {
                let _ = mailbox.post(noop_task().named(name));
            }
            let mut out = VecDeque::new();
            mailbox.drain(&mut out);
            assert_eq!(
                out.iter().map(Task::name).collect::<Vec<_>>(),
                ["a", "b", "c"]
            );
        });
    }
}

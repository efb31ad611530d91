// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{enter, EventFlags, Inner, LoopHandle};
use crate::mailbox::LoopState;
use crate::sys::{self, Direction, Event};
use crate::task::{Task, TaskStatus};
use core::mem;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Max kernel wait per iteration when no timed task bounds it.
const DEFAULT_TIMEOUT_NS: u64 = 100 * 1_000_000_000;

/// The worker thread's main loop.
///
/// Per iteration: wait on the multiplexer, coalesce event records per
/// handle, dispatch callbacks, drain the mailbox if the wake channel fired,
/// run due tasks, recompute the wait timeout from the next scheduled task.
/// The loop exits when the private lifecycle state reads Stopping at the top
/// of an iteration.
pub(super) fn worker_main(inner: &Arc<Inner>) {
    let _span = tracing::debug_span!("event loop worker").entered();
    let _enter = enter(inner);

    // Safety: we are the worker thread; `run` made the mailbox state
    // transition before spawning us.
    unsafe {
        inner.with_thread_data(|td| {
            debug_assert_eq!(td.state, LoopState::Ready);
            td.state = LoopState::Running;
        });
    }

    let mut events: Vec<Event> = Vec::with_capacity(sys::MAX_EVENTS);
    let mut fired: Vec<RawFd> = Vec::with_capacity(sys::MAX_EVENTS);
    let mut drained: VecDeque<Task> = VecDeque::new();
    let mut timeout_ns = DEFAULT_TIMEOUT_NS;

    loop {
        // Safety: worker thread.
        let state = unsafe { inner.with_thread_data(|td| td.state) };
        if state != LoopState::Running {
            break;
        }

        let mut drain_mailbox = false;

        if let Err(err) = inner.selector.wait(&mut events, timeout_ns) {
            // Not fatal: events can't be processed this iteration, but
            // scheduled tasks still run, and a stop request must still get
            // through, so drain as if the wake channel had fired.
            tracing::error!("multiplexer wait failed: {err}");
            events.clear();
            drain_mailbox = true;
        }

        for event in &events {
            if event.fd == inner.wake.read_fd() {
                drain_mailbox = true;
                inner.wake.drain();
                continue;
            }

            let flags = event_flags(event);
            if flags.is_empty() {
                continue;
            }

            // A handle subscribed to both directions can produce two records
            // in one iteration; they coalesce into a single callback.
            // Safety: worker thread.
            unsafe {
                inner.with_thread_data(|td| {
                    if let Some(record) = td.registry.get_mut(&event.fd) {
                        if record.events_this_iteration.is_empty() {
                            fired.push(event.fd);
                        }
                        record.events_this_iteration |= flags;
                    }
                });
            }
        }

        for &fd in &fired {
            // The callback moves out of the record for the duration of the
            // dispatch so it can schedule, subscribe, or unsubscribe on this
            // very loop without aliasing the thread data.
            // Safety: worker thread; no thread-data access is held across
            // the callback.
            let taken = unsafe {
                inner.with_thread_data(|td| {
                    td.registry.get_mut(&fd).map(|record| {
                        (
                            record.on_event.take(),
                            mem::replace(&mut record.events_this_iteration, EventFlags::empty()),
                        )
                    })
                })
            };
            let Some((Some(mut on_event), flags)) = taken else {
                continue;
            };

            tracing::trace!(fd, ?flags, "dispatching io event");
            let handle = LoopHandle {
                inner: Arc::clone(inner),
            };
            on_event(&handle, fd, flags);

            // Hand the callback back, unless the record is already gone.
            // Safety: worker thread.
            unsafe {
                inner.with_thread_data(|td| {
                    if let Some(record) = td.registry.get_mut(&fd) {
                        record.on_event = Some(on_event);
                    }
                });
            }
        }
        fired.clear();

        if drain_mailbox {
            let snapshot = inner.mailbox.drain(&mut drained);
            // Safety: worker thread.
            unsafe {
                inner.with_thread_data(|td| {
                    if snapshot == LoopState::Stopping && td.state == LoopState::Running {
                        td.state = LoopState::Stopping;
                    }
                    for task in drained.drain(..) {
                        match task.run_at_nanos() {
                            0 => td.scheduler.schedule_now(task),
                            at => td.scheduler.schedule_at(task, at),
                        }
                    }
                });
            }
        }

        // A failed clock reading leaves `now` at 0: "as soon as possible"
        // tasks still run, timed tasks wait for the next iteration.
        let now = inner.clock.now().unwrap_or(0);
        loop {
            // Safety: worker thread; the task itself runs outside the access
            // scope.
            let due = unsafe { inner.with_thread_data(|td| td.scheduler.pop_due(now)) };
            let Some(task) = due else { break };
            task.run(TaskStatus::Run);
        }

        // Safety: worker thread.
        let next_run_time = unsafe { inner.with_thread_data(|td| td.scheduler.next_run_time()) };
        timeout_ns = match (inner.clock.now(), next_run_time) {
            (Ok(now), Some(next)) => next.saturating_sub(now),
            _ => DEFAULT_TIMEOUT_NS,
        };
    }

    tracing::debug!("stop observed, worker exiting");
}

/// Derives application event flags from one kernel record.
fn event_flags(event: &Event) -> EventFlags {
    // A kernel-level error overrides everything else on the record.
    if event.error {
        return EventFlags::ERROR;
    }

    let mut flags = EventFlags::empty();
    match event.direction {
        Direction::Read => {
            if event.data != 0 {
                flags |= EventFlags::READABLE;
            }
            if event.eof {
                flags |= EventFlags::CLOSED;
            }
        }
        Direction::Write => {
            if event.data != 0 {
                flags |= EventFlags::WRITABLE;
            }
            if event.eof {
                flags |= EventFlags::CLOSED;
            }
        }
    }
    flags
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn record(direction: Direction, error: bool, eof: bool, data: i64) -> Event {
        Event {
            fd: 7,
            direction,
            error,
            eof,
            data,
        }
    }

    #[test]
    fn error_records_derive_to_error_alone() {
        let flags = event_flags(&record(Direction::Read, true, true, 128));
        assert_eq!(flags, EventFlags::ERROR);
    }

    #[test]
    fn read_records_derive_readable_and_closed() {
        assert_eq!(
            event_flags(&record(Direction::Read, false, false, 128)),
            EventFlags::READABLE
        );
        assert_eq!(
            event_flags(&record(Direction::Read, false, true, 128)),
            EventFlags::READABLE | EventFlags::CLOSED
        );
        // Hangup with nothing buffered is a bare CLOSED.
        assert_eq!(
            event_flags(&record(Direction::Read, false, true, 0)),
            EventFlags::CLOSED
        );
    }

    #[test]
    fn write_records_derive_writable() {
        assert_eq!(
            event_flags(&record(Direction::Write, false, false, 4096)),
            EventFlags::WRITABLE
        );
    }

    #[test]
    fn empty_records_are_ignored() {
        assert!(event_flags(&record(Direction::Write, false, false, 0)).is_empty());
        assert!(event_flags(&record(Direction::Read, false, false, 0)).is_empty());
    }
}

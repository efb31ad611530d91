// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-handle bookkeeping and the task-mediated (un)subscription protocol.
//!
//! Every multiplexer mutation for a handle happens on the worker thread, by
//! way of the subscribe/unsubscribe tasks below. Funneling the mutations
//! through tasks collapses three races into plain single-threaded
//! sequencing: cleaning up a half-failed two-direction registration, event
//! delivery sneaking in between an add and its rollback, and concurrent
//! subscribe/unsubscribe for the same handle.

use super::{EventFlags, Inner, LoopHandle, OnEvent};
use crate::sys::{Change, ChangeOp, Direction};
use crate::task::TaskStatus;
use arrayvec::ArrayVec;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Bookkeeping attached to a subscribed handle, owned by the worker's
/// registry from subscribe-task completion until the unsubscribe task drops
/// it.
pub(super) struct HandleRecord {
    pub(super) fd: RawFd,
    /// Moved out for the duration of a dispatch so the callback can re-enter
    /// the loop's API.
    pub(super) on_event: Option<OnEvent>,
    pub(super) subscribed: EventFlags,
    /// Flags accumulated across this pump iteration's kernel records, reset
    /// after the (single, coalesced) dispatch.
    pub(super) events_this_iteration: EventFlags,
    /// Whether the kernel accepted every requested direction.
    pub(super) registered_ok: bool,
}

// === impl HandleRecord ===

impl HandleRecord {
    pub(super) fn new(fd: RawFd, subscribed: EventFlags, on_event: OnEvent) -> Self {
        Self {
            fd,
            on_event: Some(on_event),
            subscribed,
            events_this_iteration: EventFlags::empty(),
            registered_ok: false,
        }
    }

    /// One change record per subscribed direction.
    fn change_records(&self, op: ChangeOp) -> ArrayVec<Change, 2> {
        let mut changes = ArrayVec::new();
        if self.subscribed.contains(EventFlags::READABLE) {
            changes.push(Change::new(self.fd, Direction::Read, op));
        }
        if self.subscribed.contains(EventFlags::WRITABLE) {
            changes.push(Change::new(self.fd, Direction::Write, op));
        }
        changes
    }
}

/// Connects a handle to the multiplexer. Worker thread only (or the
/// destroying thread delivering the cancel).
pub(super) fn subscribe_task(inner: &Arc<Inner>, mut record: HandleRecord, status: TaskStatus) {
    // The count moves unconditionally, so an unsubscribe balances it even
    // when registration never happens.
    // Safety: (un)subscribe tasks run on the worker thread, or on the
    // destroying thread after the worker has been joined.
    unsafe { inner.with_thread_data(|td| td.connected_handle_count += 1) };

    if status == TaskStatus::Canceled {
        // Loop is tearing down; the record (and the user callback) drop here.
        return;
    }

    let mut changes = record.change_records(ChangeOp::Add);
    let submitted = inner.selector.submit(&mut changes);
    let registered_ok = submitted.is_ok() && changes.iter().all(Change::applied);

    if !registered_ok {
        match &submitted {
            Ok(()) => {
                // Roll back whichever directions did land, best effort.
                let mut deletes: ArrayVec<Change, 2> = changes
                    .iter()
                    .filter(|change| change.applied())
                    .map(|change| Change::new(change.fd, change.direction, ChangeOp::Delete))
                    .collect();
                if !deletes.is_empty() {
                    let _ = inner.selector.submit(&mut deletes);
                }
            }
            Err(err) => {
                tracing::warn!(fd = record.fd, "subscription submit failed: {err}");
            }
        }
    }
    record.registered_ok = registered_ok;

    let fd = record.fd;
    let failed_callback = if registered_ok {
        None
    } else {
        record.on_event.take()
    };

    // The record is tracked either way: a failed registration still needs
    // its unsubscribe to balance the books. Insert before the error
    // dispatch so an unsubscribe posted from inside it finds the record.
    // Safety: as above.
    unsafe {
        inner.with_thread_data(|td| {
            let prev = td.registry.insert(fd, record);
            debug_assert!(prev.is_none(), "fd {fd} has two live subscriptions");
        });
    }

    if let Some(mut on_event) = failed_callback {
        // subscribe() returned long ago, so the failure can't be reported
        // there; it surfaces as a single ERROR event instead.
        let handle = LoopHandle {
            inner: Arc::clone(inner),
        };
        on_event(&handle, fd, EventFlags::ERROR);

        // Safety: as above.
        unsafe {
            inner.with_thread_data(|td| {
                if let Some(record) = td.registry.get_mut(&fd) {
                    record.on_event = Some(on_event);
                }
            });
        }
    }
}

/// Disconnects a handle from the multiplexer and drops its record. Worker
/// thread only (or the destroying thread delivering the cancel).
pub(super) fn unsubscribe_task(inner: &Arc<Inner>, fd: RawFd, status: TaskStatus) {
    // Safety: see subscribe_task.
    let record = unsafe {
        inner.with_thread_data(|td| {
            td.connected_handle_count -= 1;
            td.registry.remove(&fd)
        })
    };

    if status == TaskStatus::Run
        && let Some(record) = &record
        && record.registered_ok
    {
        // Delete exactly the directions that were registered. Failures are
        // ignored: the kernel drops registrations with the descriptor
        // anyway.
        let mut deletes = record.change_records(ChangeOp::Delete);
        let _ = inner.selector.submit(&mut deletes);
    }

    // The record and its callback drop here whether or not the task ran.
}

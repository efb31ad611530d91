// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Change, ChangeOp, Direction, Event, MAX_EVENTS};
use core::mem;
use core::ptr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Kqueue-backed multiplexer.
///
/// Change records map one-to-one onto kevents. Adds carry `EV_RECEIPT`, so a
/// single `kevent` call both applies the changelist and reports per-record
/// results instead of the usual behavior of reporting recent events; deletes
/// carry it too so a batch is uniform.
#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

// === impl Selector ===

impl Selector {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: no preconditions.
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: `fd` is a freshly created descriptor owned here.
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { kq })
    }

    /// Registers the wake channel's read end for the life of the selector.
    pub(crate) fn add_wake(&self, fd: RawFd) -> io::Result<()> {
        let kev = kevent_record(fd, Direction::Read, libc::EV_ADD);
        // Safety: the changelist points at one valid record.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &kev,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Applies a batch of change records, reporting per-record results in
    /// `Change::result`. `Err` means the batch could not be applied at all.
    pub(crate) fn submit(&self, changes: &mut [Change]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let changelist: Vec<libc::kevent> = changes
            .iter()
            .map(|change| {
                let flags = match change.op {
                    ChangeOp::Add => libc::EV_ADD | libc::EV_RECEIPT,
                    ChangeOp::Delete => libc::EV_DELETE | libc::EV_RECEIPT,
                };
                kevent_record(change.fd, change.direction, flags)
            })
            .collect();
        let mut receipts = changelist.clone();

        let len = changes.len() as i32;
        // Safety: changelist and receipts each hold `len` valid records.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changelist.as_ptr(),
                len,
                receipts.as_mut_ptr(),
                len,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // EV_RECEIPT flags every receipt with EV_ERROR; only a non-zero data
        // field is an actual errno.
        for (change, receipt) in changes.iter_mut().zip(&receipts[..rc as usize]) {
            debug_assert!(receipt.flags & libc::EV_ERROR != 0);
            if receipt.data != 0 {
                tracing::trace!(
                    fd = change.fd,
                    op = ?change.op,
                    errno = receipt.data,
                    "kevent change rejected"
                );
                change.result = Some(io::Error::from_raw_os_error(receipt.data as i32));
            }
        }

        Ok(())
    }

    /// Blocks for up to `timeout_ns`, filling `events` with per-direction
    /// readiness records (at most [`MAX_EVENTS`] kernel records).
    pub(crate) fn wait(&self, events: &mut Vec<Event>, timeout_ns: u64) -> io::Result<()> {
        events.clear();

        // Safety: the all-zero byte pattern is a valid kevent array.
        let mut buf: [libc::kevent; MAX_EVENTS] = unsafe { mem::zeroed() };

        let timeout = libc::timespec {
            tv_sec: i64::try_from(timeout_ns / 1_000_000_000).unwrap_or(i64::MAX) as libc::time_t,
            tv_nsec: (timeout_ns % 1_000_000_000) as libc::c_long,
        };

        // Safety: `buf` is valid for MAX_EVENTS kevent writes and `timeout`
        // lives across the call.
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                buf.as_mut_ptr(),
                MAX_EVENTS as i32,
                &timeout,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for kev in &buf[..n as usize] {
            let direction = if kev.filter == libc::EVFILT_READ {
                Direction::Read
            } else if kev.filter == libc::EVFILT_WRITE {
                Direction::Write
            } else {
                continue;
            };
            events.push(Event {
                fd: kev.ident as RawFd,
                direction,
                error: kev.flags & libc::EV_ERROR != 0,
                eof: kev.flags & libc::EV_EOF != 0,
                data: kev.data as i64,
            });
        }

        Ok(())
    }
}

fn kevent_record(fd: RawFd, direction: Direction, flags: u16) -> libc::kevent {
    // Safety: the all-zero byte pattern is a valid kevent; platform-specific
    // trailing fields (FreeBSD's `ext`) stay zeroed.
    let mut kev: libc::kevent = unsafe { mem::zeroed() };
    kev.ident = fd as libc::uintptr_t;
    kev.filter = match direction {
        Direction::Read => libc::EVFILT_READ,
        Direction::Write => libc::EVFILT_WRITE,
    };
    kev.flags = flags;
    kev
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::wake::WakePipe;

    #[test]
    fn pipe_read_end_becomes_readable() {
        let selector = Selector::new().unwrap();
        let pipe = WakePipe::open().unwrap();

        let mut changes = [Change::new(pipe.read_fd(), Direction::Read, ChangeOp::Add)];
        selector.submit(&mut changes).unwrap();
        assert!(changes[0].applied());

        pipe.signal();

        let mut events = Vec::with_capacity(MAX_EVENTS);
        selector.wait(&mut events, 1_000_000_000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, pipe.read_fd());
        assert_eq!(events[0].direction, Direction::Read);
        assert!(events[0].data != 0);
    }

    #[test]
    fn partial_registration_failure_is_reported_per_record() {
        let selector = Selector::new().unwrap();
        let pipe = WakePipe::open().unwrap();

        // The read end of a pipe accepts a read filter but rejects a write
        // filter, which is exactly the partial failure the loop's subscribe
        // task has to clean up after.
        let mut changes = [
            Change::new(pipe.read_fd(), Direction::Read, ChangeOp::Add),
            Change::new(pipe.read_fd(), Direction::Write, ChangeOp::Add),
        ];
        selector.submit(&mut changes).unwrap();
        assert!(changes[0].applied());
        assert!(!changes[1].applied());
    }
}

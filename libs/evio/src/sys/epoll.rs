// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Change, ChangeOp, Direction, Event, MAX_EVENTS};
use core::mem;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Epoll-backed multiplexer.
///
/// Epoll registers a descriptor with one combined interest mask rather than
/// one registration per direction, so per-direction change records are
/// materialized as a single `epoll_ctl` per descriptor. This relies on an
/// invariant the event loop upholds: a submit batch always carries a
/// handle's full direction set (the subscribe set, the unsubscribe set, or
/// the succeeded subset during failure cleanup), never a partial update of
/// an already-registered descriptor.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

// === impl Selector ===

impl Selector {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: no preconditions.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: `fd` is a freshly created descriptor owned here.
        let ep = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { ep })
    }

    /// Registers the wake channel's read end for the life of the selector.
    pub(crate) fn add_wake(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)
    }

    /// Applies a batch of change records, reporting per-record results in
    /// `Change::result`. `Err` means the batch could not be applied at all.
    pub(crate) fn submit(&self, changes: &mut [Change]) -> io::Result<()> {
        let mut start = 0;
        while start < changes.len() {
            let fd = changes[start].fd;
            let op = changes[start].op;
            let mut end = start + 1;
            while end < changes.len() && changes[end].fd == fd {
                debug_assert_eq!(changes[end].op, op, "mixed add/delete batch for one fd");
                end += 1;
            }
            let group = &mut changes[start..end];

            let res = match op {
                ChangeOp::Add => {
                    let mask = group.iter().fold(0u32, |mask, change| {
                        mask | match change.direction {
                            Direction::Read => (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
                            Direction::Write => libc::EPOLLOUT as u32,
                        }
                    });
                    self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
                }
                ChangeOp::Delete => self.ctl(libc::EPOLL_CTL_DEL, fd, 0),
            };

            if let Err(err) = res {
                let errno = err.raw_os_error().unwrap_or(libc::EIO);
                tracing::trace!(fd, ?op, errno, "epoll_ctl failed");
                for change in &mut *group {
                    change.result = Some(io::Error::from_raw_os_error(errno));
                }
            }

            start = end;
        }
        Ok(())
    }

    /// Blocks for up to `timeout_ns`, filling `events` with per-direction
    /// readiness records (at most [`MAX_EVENTS`] kernel records).
    pub(crate) fn wait(&self, events: &mut Vec<Event>, timeout_ns: u64) -> io::Result<()> {
        events.clear();

        // Safety: the all-zero byte pattern is a valid epoll_event array.
        let mut buf: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };

        // Round up so a sub-millisecond timer distance doesn't turn into a
        // zero-timeout spin.
        let timeout_ms =
            i32::try_from(timeout_ns.div_ceil(1_000_000)).unwrap_or(i32::MAX);

        // Safety: `buf` is valid for MAX_EVENTS epoll_event writes.
        let n = unsafe {
            libc::epoll_wait(
                self.ep.as_raw_fd(),
                buf.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for raw in &buf[..n as usize] {
            let fd = raw.u64 as RawFd;
            let eof = raw.events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0;

            if raw.events & libc::EPOLLERR as u32 != 0 {
                // An error consumes the whole kernel record; the direction is
                // immaterial since it derives to ERROR alone.
                events.push(Event {
                    fd,
                    direction: Direction::Read,
                    error: true,
                    eof,
                    data: 0,
                });
                continue;
            }

            // One kernel record may cover both directions; split it so the
            // loop core sees the same per-direction shape kqueue produces.
            let readable = raw.events & libc::EPOLLIN as u32 != 0;
            let writable = raw.events & libc::EPOLLOUT as u32 != 0;
            if readable {
                events.push(Event {
                    fd,
                    direction: Direction::Read,
                    error: false,
                    eof,
                    data: 1,
                });
            }
            if writable {
                events.push(Event {
                    fd,
                    direction: Direction::Write,
                    error: false,
                    eof,
                    data: 1,
                });
            }
            if !readable && !writable && eof {
                // Hangup with nothing buffered: surface it as a read-direction
                // record with no data so it derives to CLOSED.
                events.push(Event {
                    fd,
                    direction: Direction::Read,
                    error: false,
                    eof: true,
                    data: 0,
                });
            }
        }

        Ok(())
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // Safety: `ev` is valid for the call's duration (and ignored by DEL
        // on any kernel this crate supports, but passed anyway for the
        // pre-2.6.9 quirk documented in epoll_ctl(2)).
        let rc = unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
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
        assert!(!events[0].error);
    }

    #[test]
    fn regular_files_are_rejected_per_record() {
        let selector = Selector::new().unwrap();
        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();

        let mut changes = [
            Change::new(file.as_raw_fd(), Direction::Read, ChangeOp::Add),
            Change::new(file.as_raw_fd(), Direction::Write, ChangeOp::Add),
        ];
        selector.submit(&mut changes).unwrap();
        assert!(changes.iter().all(|change| !change.applied()));
    }

    #[test]
    fn delete_stops_event_delivery() {
        let selector = Selector::new().unwrap();
        let pipe = WakePipe::open().unwrap();

        let mut changes = [Change::new(pipe.read_fd(), Direction::Read, ChangeOp::Add)];
        selector.submit(&mut changes).unwrap();
        assert!(changes[0].applied());

        let mut deletes = [Change::new(pipe.read_fd(), Direction::Read, ChangeOp::Delete)];
        selector.submit(&mut deletes).unwrap();
        assert!(deletes[0].applied());

        pipe.signal();
        let mut events = Vec::with_capacity(MAX_EVENTS);
        selector.wait(&mut events, 50_000_000).unwrap();
        assert!(events.is_empty());
    }
}

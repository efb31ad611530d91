// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Platform multiplexer backends behind one backend-neutral surface.
//!
//! A `Selector` monitors a set of file descriptors for readiness. The two
//! directions of a descriptor (read and write) are registered independently,
//! one [`Change`] record per direction, and a single [`Selector::submit`]
//! call both applies a batch of change records and reports per-record
//! success or failure. [`Selector::wait`] blocks until readiness, producing
//! per-direction [`Event`] records.

use std::io;
use std::os::fd::RawFd;

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub(crate) use epoll::Selector;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
    ))] {
        mod kqueue;
        pub(crate) use kqueue::Selector;
    } else {
        compile_error!("evio requires a platform with epoll or kqueue");
    }
}

/// Max event records consumed from the kernel per pump iteration.
pub(crate) const MAX_EVENTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeOp {
    Add,
    Delete,
}

/// One unit in a [`Selector::submit`] batch: add or remove a single
/// (descriptor, direction) registration. `result` is filled in by `submit`;
/// `None` means the record was applied.
#[derive(Debug)]
pub(crate) struct Change {
    pub(crate) fd: RawFd,
    pub(crate) direction: Direction,
    pub(crate) op: ChangeOp,
    pub(crate) result: Option<io::Error>,
}

/// A readiness record returned by [`Selector::wait`].
///
/// `data` is the direction-specific counter the kernel reports: bytes
/// available to read, or space available to write. Backends without such a
/// counter report 1 for a ready direction.
#[derive(Debug)]
pub(crate) struct Event {
    pub(crate) fd: RawFd,
    pub(crate) direction: Direction,
    pub(crate) error: bool,
    pub(crate) eof: bool,
    pub(crate) data: i64,
}

// === impl Change ===

impl Change {
    pub(crate) fn new(fd: RawFd, direction: Direction, op: ChangeOp) -> Self {
        Self {
            fd,
            direction,
            op,
            result: None,
        }
    }

    pub(crate) fn applied(&self) -> bool {
        self.result.is_none()
    }
}

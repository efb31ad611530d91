// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// `run` was called while the loop is not in the ready state.
    ///
    /// A loop that has been run must be stopped *and* joined before it can be
    /// run again.
    AlreadyRunning,
    /// `join` was called without the worker thread having been launched.
    NotRunning,
    /// The worker thread panicked before it could be joined.
    ///
    /// Event callbacks and tasks run on the worker thread; a panic in user
    /// code surfaces here.
    WorkerPanicked,
    /// A subscription requested neither readable nor writable events.
    EmptySubscription,
    /// An underlying system call failed.
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyRunning => f.write_str("event loop is already running"),
            Error::NotRunning => f.write_str("event loop has no running worker thread"),
            Error::WorkerPanicked => f.write_str("event loop worker thread panicked"),
            Error::EmptySubscription => {
                f.write_str("subscription must request readable or writable events")
            }
            Error::Io(err) => write!(f, "system call failed: {err}"),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

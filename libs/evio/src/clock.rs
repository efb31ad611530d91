// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::io;
use std::sync::Arc;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A monotonic time source injected into an event loop at construction.
///
/// A `Clock` reports nanoseconds since some arbitrary (but fixed) epoch. The
/// reading may fail; the event loop treats a failed reading as "time unknown"
/// and falls back to its default wait timeout, so a flaky clock degrades
/// timer precision but never wedges the loop.
///
/// [`Clock::monotonic`] is the right choice outside of tests; custom clocks
/// exist so tests and simulations can drive time themselves.
#[derive(Clone)]
pub struct Clock {
    name: &'static str,
    now: Arc<dyn Fn() -> io::Result<u64> + Send + Sync>,
}

// === impl Clock ===

impl Clock {
    pub fn new(now: impl Fn() -> io::Result<u64> + Send + Sync + 'static) -> Self {
        Self {
            name: "<unnamed mystery clock>",
            now: Arc::new(now),
        }
    }

    /// The system monotonic clock (`CLOCK_MONOTONIC`).
    pub fn monotonic() -> Self {
        Self::new(|| {
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            // Safety: `ts` is a valid out-pointer for the duration of the call.
            let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            // Monotonic readings are non-negative on every supported platform.
            Ok((ts.tv_sec as u64) * NANOS_PER_SEC + (ts.tv_nsec as u64))
        })
        .named("CLOCK_MONOTONIC")
    }

    /// Add an arbitrary user-defined name to this `Clock`.
    ///
    /// This is generally used to describe the time source backing the `now`
    /// function of this `Clock`.
    #[must_use]
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Returns this `Clock`'s name, if it was given one using the
    /// [`Clock::named`] method.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The current reading in nanoseconds.
    #[inline]
    pub fn now(&self) -> io::Result<u64> {
        (self.now)()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").field("name", &self.name).finish()
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

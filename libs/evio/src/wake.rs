// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cfg_if::cfg_if;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// The wake channel: a non-blocking self-pipe whose read end stays registered
/// with the loop's multiplexer for its whole life. Any write stirs the loop
/// out of its kernel wait.
#[derive(Debug)]
pub(crate) struct WakePipe {
    pub(crate) read: OwnedFd,
    pub(crate) write: OwnedFd,
}

// === impl WakePipe ===

impl WakePipe {
    pub(crate) fn open() -> io::Result<Self> {
        let mut fds: [RawFd; 2] = [-1, -1];

        cfg_if! {
            if #[cfg(any(
                target_os = "linux",
                target_os = "android",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
            ))] {
                // Safety: `fds` is a valid out-array of two descriptors.
                let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
            } else {
                // No pipe2 on macOS; open and fixate the flags after the fact.
                // Safety: `fds` is a valid out-array of two descriptors.
                let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
                for fd in fds {
                    // Safety: `fd` was just returned by pipe().
                    let rc = unsafe {
                        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC)
                            | libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK)
                    };
                    if rc != 0 {
                        let err = io::Error::last_os_error();
                        // Safety: both descriptors are owned by this function.
                        unsafe {
                            libc::close(fds[0]);
                            libc::close(fds[1]);
                        }
                        return Err(err);
                    }
                }
            }
        }

        // Safety: both descriptors were just created and are owned here.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Writes the wake payload. The content is ignored by the reader; any
    /// activity is the signal. A failed write (pipe full) is deliberately
    /// dropped on the floor: the reader is already due to wake up.
    pub(crate) fn signal(&self) {
        let payload: u32 = 0xC0FFEE;
        // Safety: `payload` is a valid 4-byte buffer for the call's duration.
        let _ = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                core::ptr::from_ref(&payload).cast(),
                size_of::<u32>(),
            )
        };
    }

    /// Reads until the pipe is empty, coalescing any burst of signals into
    /// one wakeup.
    pub(crate) fn drain(&self) {
        let mut scratch = [0u8; 32];
        loop {
            // Safety: `scratch` is a valid buffer for the call's duration.
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    scratch.as_mut_ptr().cast(),
                    scratch.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn signal_then_drain_leaves_pipe_empty() {
        let pipe = WakePipe::open().unwrap();
        pipe.signal();
        pipe.signal();
        pipe.drain();

        let mut scratch = [0u8; 8];
        // Safety: `scratch` is a valid buffer for the call's duration.
        let n = unsafe {
            libc::read(
                pipe.read.as_raw_fd(),
                scratch.as_mut_ptr().cast(),
                scratch.len(),
            )
        };
        assert_eq!(n, -1);
        let err = io::Error::last_os_error();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn signal_never_blocks_when_full() {
        let pipe = WakePipe::open().unwrap();
        // A pipe has finite capacity; overrun it and make sure writes keep
        // returning instead of wedging the submitter.
        for _ in 0..100_000 {
            pipe.signal();
        }
        pipe.drain();
    }
}

//! Cross-thread stop signalling for the event loops.
//!
//! The wake eventfd is the only legal cross-thread channel into a loop:
//! `stop()` sets the atomic flag and nudges the fd so a blocking reactor
//! wait returns promptly.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fd::UniqueFd;

pub(crate) struct StopSignal {
    requested: AtomicBool,
    wake_fd: UniqueFd,
}

impl StopSignal {
    pub(crate) fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::from_errno());
        }
        Ok(Self {
            requested: AtomicBool::new(false),
            wake_fd: UniqueFd::from_raw(fd),
        })
    }

    /// Signal without a wake fd, for loops that failed to initialize and
    /// will never run.
    pub(crate) fn dummy() -> Self {
        Self {
            requested: AtomicBool::new(false),
            wake_fd: UniqueFd::new(),
        }
    }

    /// Idempotent: sets the flag and writes one wake token (best effort,
    /// a saturated counter already guarantees a pending wake-up).
    pub(crate) fn request(&self) {
        self.requested.store(true, Ordering::Release);

        let signal: u64 = 1;
        loop {
            let written = unsafe {
                libc::write(
                    self.wake_fd.get(),
                    (&signal as *const u64).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            if written >= 0 {
                break;
            }
            let err = Error::from_errno();
            if err.code() == libc::EINTR {
                continue;
            }
            break;
        }
    }

    pub(crate) fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Clears the flag at the start of a `run()`.
    pub(crate) fn rearm(&self) {
        self.requested.store(false, Ordering::Release);
    }

    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake_fd.get()
    }

    /// Empties the eventfd counter without touching any waiter state.
    pub(crate) fn drain(&self) {
        let mut value: u64 = 0;
        loop {
            let count = unsafe {
                libc::read(
                    self.wake_fd.get(),
                    (&mut value as *mut u64).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            if count > 0 {
                continue;
            }
            if count < 0 && Error::from_errno().code() == libc::EINTR {
                continue;
            }
            break;
        }
    }
}

/// Cloneable, thread-safe handle that stops a running loop.
#[derive(Clone)]
pub struct StopHandle {
    signal: Arc<StopSignal>,
}

impl StopHandle {
    pub(crate) fn new(signal: Arc<StopSignal>) -> Self {
        Self { signal }
    }

    /// Requests shutdown; safe to call from any thread, any number of times.
    pub fn stop(&self) {
        self.signal.request();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_sets_flag_and_wakes_fd() {
        let signal = StopSignal::create().unwrap();
        assert!(!signal.requested());

        signal.request();
        assert!(signal.requested());

        let mut value: u64 = 0;
        let count = unsafe {
            libc::read(
                signal.wake_fd(),
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(count as usize, std::mem::size_of::<u64>());
        assert_eq!(value, 1);
    }

    #[test]
    fn drain_leaves_fd_empty() {
        let signal = StopSignal::create().unwrap();
        signal.request();
        signal.request();
        signal.drain();

        let mut value: u64 = 0;
        let count = unsafe {
            libc::read(
                signal.wake_fd(),
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        assert!(count < 0);
    }

    #[test]
    fn rearm_clears_flag() {
        let signal = StopSignal::create().unwrap();
        signal.request();
        signal.rearm();
        assert!(!signal.requested());
    }
}

//! The contract between leaf readiness futures and an event loop.
//!
//! Each armed wait is identified by a [`WaitKey`] allocated by the loop.
//! The loop produces at most one result per key; the waiting future
//! consumes it exactly once. A future re-polled before its wait fires can
//! probe [`wait_armed`] to refresh its stored waker and stay pending.
//!
//! [`wait_armed`]: Scheduler::wait_armed

use std::os::fd::RawFd;
use std::task::Waker;
use std::time::Duration;

use crate::error::{Error, Result};

/// Identity of one armed wait.
pub(crate) type WaitKey = u64;

/// Scheduling capabilities an event loop exposes to readiness futures.
///
/// All methods run on the loop thread.
pub(crate) trait Scheduler {
    /// Registers interest in `fd` becoming readable.
    ///
    /// A zero timeout publishes the timeout result immediately and wakes
    /// the waiter without touching the reactor. Arming a direction that
    /// already has a waiter fails with `EBUSY`.
    fn wait_for_readable(
        &mut self,
        fd: RawFd,
        waker: &Waker,
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaitKey>;

    /// Registers interest in `fd` becoming writable. Same rules as
    /// [`wait_for_readable`](Scheduler::wait_for_readable).
    fn wait_for_writable(
        &mut self,
        fd: RawFd,
        waker: &Waker,
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaitKey>;

    /// Takes the stored outcome for `key`, if one was produced.
    fn consume_wait_result(&mut self, key: WaitKey) -> Option<Result<()>>;

    /// Whether the registration behind `key` is still armed; refreshes the
    /// stored waker when it is.
    fn wait_armed(&mut self, fd: RawFd, readable: bool, key: WaitKey, waker: &Waker) -> bool;
}

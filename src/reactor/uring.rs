//! Thin wrapper over an io_uring instance used in one-shot poll mode.
//!
//! Submissions are keyed by caller-chosen 64-bit tokens; token `0` is
//! reserved for "no token" and rejected. Queued SQEs sit in the submission
//! ring until [`UringReactor::submit`] flushes them.

use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};

use crate::error::{Error, Result};

/// One completion out of [`UringReactor::wait`]: the submitting token and
/// the kernel `res` field.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Completion {
    pub(crate) user_data: u64,
    pub(crate) result: i32,
}

pub(crate) struct UringReactor {
    ring: Option<IoUring>,
}

impl std::fmt::Debug for UringReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UringReactor")
            .field("valid", &self.valid())
            .finish()
    }
}

impl UringReactor {
    pub(crate) fn create(entries: u32) -> Result<Self> {
        if entries == 0 {
            return Err(Error::from_raw(libc::EINVAL));
        }
        let ring = IoUring::new(entries)?;
        Ok(Self { ring: Some(ring) })
    }

    /// A reactor with no ring; every operation reports `EBADF`.
    pub(crate) fn closed() -> Self {
        Self { ring: None }
    }

    pub(crate) fn valid(&self) -> bool {
        self.ring.is_some()
    }

    fn ring(&mut self) -> Result<&mut IoUring> {
        self.ring.as_mut().ok_or(Error::from_raw(libc::EBADF))
    }

    /// Queues a one-shot poll on `fd`. A full submission queue reports
    /// `EBUSY`; the caller flushes and retries.
    pub(crate) fn submit_poll_add(&mut self, user_data: u64, fd: RawFd, poll_mask: u32) -> Result<()> {
        if user_data == 0 || fd < 0 || poll_mask == 0 {
            return Err(Error::from_raw(libc::EINVAL));
        }

        let entry = opcode::PollAdd::new(types::Fd(fd), poll_mask)
            .build()
            .user_data(user_data);
        unsafe { self.ring()?.submission().push(&entry) }
            .map_err(|_| Error::from_raw(libc::EBUSY))
    }

    /// Queues a cancel targeting a previously submitted poll token.
    pub(crate) fn submit_poll_remove(&mut self, target_user_data: u64) -> Result<()> {
        if target_user_data == 0 {
            return Err(Error::from_raw(libc::EINVAL));
        }

        let entry = opcode::PollRemove::new(target_user_data)
            .build()
            .user_data(0);
        unsafe { self.ring()?.submission().push(&entry) }
            .map_err(|_| Error::from_raw(libc::EBUSY))
    }

    /// Flushes queued SQEs to the kernel.
    pub(crate) fn submit(&mut self) -> Result<()> {
        self.ring()?.submit()?;
        Ok(())
    }

    /// Awaits at least one completion (bounded by `timeout` when given),
    /// then drains further completions without blocking until `completions`
    /// is full. `ETIME` and `EINTR` report zero completions.
    pub(crate) fn wait(
        &mut self,
        completions: &mut [Completion],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        if completions.is_empty() {
            return Err(Error::from_raw(libc::EINVAL));
        }
        let ring = self.ring()?;

        if let Some(timeout) = timeout {
            let timespec = types::Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos());
            let args = types::SubmitArgs::new().timespec(&timespec);
            if let Err(err) = ring.submitter().submit_with_args(1, &args) {
                match err.raw_os_error() {
                    Some(libc::ETIME) | Some(libc::EINTR) => return Ok(0),
                    _ => return Err(err.into()),
                }
            }
        } else if let Err(err) = ring.submit_and_wait(1) {
            match err.raw_os_error() {
                Some(libc::EINTR) => return Ok(0),
                _ => return Err(err.into()),
            }
        }

        let mut count = 0;
        for entry in ring.completion() {
            completions[count] = Completion {
                user_data: entry.user_data(),
                result: entry.result(),
            };
            count += 1;
            if count == completions.len() {
                break;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::close_fd;

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn reactor_or_skip() -> Option<UringReactor> {
        match UringReactor::create(16) {
            Ok(reactor) => Some(reactor),
            Err(err) => {
                eprintln!("skipping io_uring test: {err}");
                None
            }
        }
    }

    #[test]
    fn zero_depth_is_invalid() {
        let err = UringReactor::create(0).unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn zero_token_is_rejected() {
        let Some(mut reactor) = reactor_or_skip() else {
            return;
        };
        let (read_end, write_end) = make_pipe();

        let err = reactor
            .submit_poll_add(0, read_end, libc::POLLIN as u32)
            .unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
        let err = reactor.submit_poll_remove(0).unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);

        close_fd(read_end).unwrap();
        close_fd(write_end).unwrap();
    }

    #[test]
    fn poll_completes_when_readable() {
        let Some(mut reactor) = reactor_or_skip() else {
            return;
        };
        let (read_end, write_end) = make_pipe();

        reactor
            .submit_poll_add(7, read_end, libc::POLLIN as u32)
            .unwrap();
        reactor.submit().unwrap();

        let written = unsafe { libc::write(write_end, [1u8].as_ptr().cast(), 1) };
        assert_eq!(written, 1);

        let mut completions = [Completion::default(); 8];
        let count = reactor
            .wait(&mut completions, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(completions[0].user_data, 7);
        assert!(completions[0].result >= 0);
        assert!(completions[0].result as u32 & libc::POLLIN as u32 != 0);

        close_fd(read_end).unwrap();
        close_fd(write_end).unwrap();
    }

    #[test]
    fn wait_times_out_without_completions() {
        let Some(mut reactor) = reactor_or_skip() else {
            return;
        };
        let (read_end, write_end) = make_pipe();

        reactor
            .submit_poll_add(9, read_end, libc::POLLIN as u32)
            .unwrap();
        reactor.submit().unwrap();

        let mut completions = [Completion::default(); 8];
        let count = reactor
            .wait(&mut completions, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(count, 0);

        close_fd(read_end).unwrap();
        close_fd(write_end).unwrap();
    }

    #[test]
    fn poll_remove_for_completed_token_yields_enoent_cqe() {
        let Some(mut reactor) = reactor_or_skip() else {
            return;
        };
        let (read_end, write_end) = make_pipe();

        reactor
            .submit_poll_add(11, read_end, libc::POLLIN as u32)
            .unwrap();
        reactor.submit().unwrap();
        let written = unsafe { libc::write(write_end, [1u8].as_ptr().cast(), 1) };
        assert_eq!(written, 1);

        let mut completions = [Completion::default(); 8];
        let count = reactor
            .wait(&mut completions, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(count, 1);

        // The poll already completed; the cancel is accepted at submit time
        // and surfaces ENOENT only through its own completion.
        reactor.submit_poll_remove(11).unwrap();
        reactor.submit().unwrap();

        let count = reactor
            .wait(&mut completions, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(completions[0].user_data, 0);
        assert_eq!(completions[0].result, -libc::ENOENT);

        close_fd(read_end).unwrap();
        close_fd(write_end).unwrap();
    }
}

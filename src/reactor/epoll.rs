//! Thin wrapper over the kernel epoll interface.

use std::cell::RefCell;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::fd::UniqueFd;

// Batches up to this many slots borrow a thread-local scratch buffer
// instead of allocating per wait.
const MAX_CACHED_EVENT_BATCH: usize = 1024;

thread_local! {
    static SCRATCH_EVENTS: RefCell<Vec<libc::epoll_event>> = const { RefCell::new(Vec::new()) };
}

/// One readiness notification out of [`EpollReactor::wait`].
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ReadyEvent {
    pub(crate) fd: RawFd,
    pub(crate) events: u32,
}

/// Owns an epoll instance and mirrors the kernel operations.
#[derive(Debug)]
pub(crate) struct EpollReactor {
    epoll_fd: UniqueFd,
}

impl EpollReactor {
    pub(crate) fn create() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::from_errno());
        }
        Ok(Self {
            epoll_fd: UniqueFd::from_raw(fd),
        })
    }

    /// A reactor with no epoll instance; every operation reports `EBADF`.
    pub(crate) fn closed() -> Self {
        Self {
            epoll_fd: UniqueFd::new(),
        }
    }

    pub(crate) fn add(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub(crate) fn modify(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    /// Removing an fd that is not registered counts as success.
    pub(crate) fn remove(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Blocks for up to `timeout_ms` (negative blocks indefinitely) and
    /// fills `events`. `EINTR` reports zero events rather than an error.
    pub(crate) fn wait(&self, events: &mut [ReadyEvent], timeout_ms: i32) -> Result<usize> {
        if !self.valid() {
            return Err(Error::from_raw(libc::EBADF));
        }
        if events.is_empty() {
            return Err(Error::from_raw(libc::EINVAL));
        }

        if events.len() <= MAX_CACHED_EVENT_BATCH {
            SCRATCH_EVENTS.with(|cell| {
                let mut scratch = cell.borrow_mut();
                if scratch.len() < events.len() {
                    scratch.resize(events.len(), libc::epoll_event { events: 0, u64: 0 });
                }
                self.wait_into(&mut scratch[..events.len()], events, timeout_ms)
            })
        } else {
            let mut sys_events =
                vec![libc::epoll_event { events: 0, u64: 0 }; events.len()];
            self.wait_into(&mut sys_events, events, timeout_ms)
        }
    }

    fn wait_into(
        &self,
        sys_events: &mut [libc::epoll_event],
        events: &mut [ReadyEvent],
        timeout_ms: i32,
    ) -> Result<usize> {
        let ready_count = unsafe {
            libc::epoll_wait(
                self.epoll_fd.get(),
                sys_events.as_mut_ptr(),
                sys_events.len() as i32,
                timeout_ms,
            )
        };
        if ready_count < 0 {
            let err = Error::from_errno();
            if err.code() == libc::EINTR {
                return Ok(0);
            }
            return Err(err);
        }

        for i in 0..ready_count as usize {
            events[i] = ReadyEvent {
                fd: sys_events[i].u64 as RawFd,
                events: sys_events[i].events,
            };
        }
        Ok(ready_count as usize)
    }

    pub(crate) fn valid(&self) -> bool {
        self.epoll_fd.valid()
    }

    fn ctl(&self, operation: i32, fd: RawFd, events: u32) -> Result<()> {
        if !self.valid() || fd < 0 {
            return Err(Error::from_raw(libc::EBADF));
        }

        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let event_ptr = if operation == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event as *mut libc::epoll_event
        };

        if unsafe { libc::epoll_ctl(self.epoll_fd.get(), operation, fd, event_ptr) } == 0 {
            return Ok(());
        }

        let err = Error::from_errno();
        if operation == libc::EPOLL_CTL_DEL && err.code() == libc::ENOENT {
            return Ok(());
        }
        Err(err)
    }
}

/// Whether any bit of `flag` is present in `event_mask`.
pub(crate) fn has_event(event_mask: u32, flag: u32) -> bool {
    event_mask & flag != 0
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

    #[test]
    fn wait_times_out_with_no_events() {
        let reactor = EpollReactor::create().unwrap();
        let mut events = [ReadyEvent::default(); 8];
        let count = reactor.wait(&mut events, 0).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn readable_pipe_end_reports_epollin() {
        let reactor = EpollReactor::create().unwrap();
        let (read_end, write_end) = make_pipe();

        reactor.add(read_end, libc::EPOLLIN as u32).unwrap();
        let written = unsafe { libc::write(write_end, [1u8].as_ptr().cast(), 1) };
        assert_eq!(written, 1);

        let mut events = [ReadyEvent::default(); 8];
        let count = reactor.wait(&mut events, 1000).unwrap();
        assert_eq!(count, 1);
        assert_eq!(events[0].fd, read_end);
        assert!(has_event(events[0].events, libc::EPOLLIN as u32));

        close_fd(read_end).unwrap();
        close_fd(write_end).unwrap();
    }

    #[test]
    fn remove_is_idempotent() {
        let reactor = EpollReactor::create().unwrap();
        let (read_end, write_end) = make_pipe();

        reactor.add(read_end, libc::EPOLLIN as u32).unwrap();
        reactor.remove(read_end).unwrap();
        // Second removal of an unregistered fd still succeeds.
        reactor.remove(read_end).unwrap();

        close_fd(read_end).unwrap();
        close_fd(write_end).unwrap();
    }

    #[test]
    fn modify_switches_interest() {
        let reactor = EpollReactor::create().unwrap();
        let (read_end, write_end) = make_pipe();

        reactor.add(write_end, libc::EPOLLIN as u32).unwrap();
        reactor
            .modify(write_end, libc::EPOLLOUT as u32)
            .unwrap();

        let mut events = [ReadyEvent::default(); 8];
        let count = reactor.wait(&mut events, 1000).unwrap();
        assert_eq!(count, 1);
        assert!(has_event(events[0].events, libc::EPOLLOUT as u32));

        close_fd(read_end).unwrap();
        close_fd(write_end).unwrap();
    }

    #[test]
    fn empty_batch_is_invalid() {
        let reactor = EpollReactor::create().unwrap();
        let mut events: [ReadyEvent; 0] = [];
        let err = reactor.wait(&mut events, 0).unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }
}

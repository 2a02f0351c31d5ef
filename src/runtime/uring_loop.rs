//! Io_uring-backed scheduler implementation.
//!
//! Registration is one-shot: each armed half-waiter submits a fresh
//! poll-add carrying a unique nonzero token, and completions are matched
//! back through a token → {fd, direction} inflight map. Submissions are
//! batched behind a pending flag and flushed before every reactor wait.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::reactor::uring::{Completion, UringReactor};
use crate::runtime::context::{enter_context, spawn_with, RuntimeContext};
use crate::runtime::queue::ReadyQueue;
use crate::runtime::roots::RootSet;
use crate::runtime::scheduler::{Scheduler, WaitKey};
use crate::runtime::stop::{StopHandle, StopSignal};
use crate::runtime::JoinHandle;

const READ_POLL_MASK: u32 =
    (libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLRDHUP) as u32;
const WRITE_POLL_MASK: u32 = (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) as u32;

const COMPLETION_BATCH: usize = 64;
pub(crate) const DEFAULT_QUEUE_DEPTH: u32 = 256;

struct WaitRegistration {
    key: WaitKey,
    token: u64,
    waker: Waker,
    deadline: Option<Instant>,
    timeout_error: Error,
}

#[derive(Default)]
struct WaiterSlot {
    readable: Option<WaitRegistration>,
    writable: Option<WaitRegistration>,
}

impl WaiterSlot {
    fn is_empty(&self) -> bool {
        self.readable.is_none() && self.writable.is_none()
    }
}

#[derive(Clone, Copy)]
struct PollContext {
    fd: RawFd,
    readable: bool,
}

pub(crate) struct UringCore {
    reactor: UringReactor,
    stop: Arc<StopSignal>,
    waiters: HashMap<RawFd, WaiterSlot>,
    inflight_polls: HashMap<u64, PollContext>,
    results: HashMap<WaitKey, Result<()>>,
    next_key: WaitKey,
    next_token: u64,
    wake_token: u64,
    submission_pending: bool,
    pending_waiters: usize,
    timed_waiters: usize,
    next_deadline: Option<Instant>,
    deadline_dirty: bool,
    loop_error: Option<Error>,
}

impl UringCore {
    fn new(reactor: UringReactor, stop: Arc<StopSignal>) -> Self {
        Self {
            reactor,
            stop,
            waiters: HashMap::new(),
            inflight_polls: HashMap::new(),
            results: HashMap::new(),
            next_key: 1,
            next_token: 1,
            wake_token: 0,
            submission_pending: false,
            pending_waiters: 0,
            timed_waiters: 0,
            next_deadline: None,
            deadline_dirty: false,
            loop_error: None,
        }
    }

    fn allocate_key(&mut self) -> WaitKey {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1).max(1);
        key
    }

    fn latch_error(&mut self, err: Error) {
        debug!("io_uring loop latched error: {err}");
        self.loop_error.get_or_insert(err);
    }

    /// Monotonic token allocator; zero is reserved and still-inflight
    /// values are skipped on wrap.
    fn allocate_token(&mut self) -> u64 {
        loop {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            if self.next_token == 0 {
                self.next_token = 1;
            }
            if token == 0 || token == self.wake_token {
                continue;
            }
            if !self.inflight_polls.contains_key(&token) {
                return token;
            }
        }
    }

    fn queue_poll_add(&mut self, token: u64, fd: RawFd, poll_mask: u32) -> Result<()> {
        let mut add = self.reactor.submit_poll_add(token, fd, poll_mask);
        if let Err(err) = add {
            if err.code() != libc::EBUSY {
                return Err(err);
            }
            self.flush_submissions()?;
            add = self.reactor.submit_poll_add(token, fd, poll_mask);
        }
        add?;
        self.submission_pending = true;
        Ok(())
    }

    fn queue_poll_remove(&mut self, token: u64) -> Result<()> {
        if token == 0 {
            return Ok(());
        }

        let mut remove = self.reactor.submit_poll_remove(token);
        if let Err(err) = remove {
            if err.code() != libc::EBUSY {
                return Err(err);
            }
            self.flush_submissions()?;
            remove = self.reactor.submit_poll_remove(token);
        }
        remove?;
        self.submission_pending = true;
        Ok(())
    }

    fn flush_submissions(&mut self) -> Result<()> {
        if !self.submission_pending {
            return Ok(());
        }
        self.reactor.submit()?;
        self.submission_pending = false;
        Ok(())
    }

    fn arm_waiter(
        &mut self,
        fd: RawFd,
        readable: bool,
        waker: &Waker,
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaitKey> {
        if fd < 0 {
            return Err(Error::from_raw(libc::EBADF));
        }

        if let Some(timeout) = timeout {
            if timeout.is_zero() {
                let key = self.allocate_key();
                self.results.insert(key, Err(timeout_error));
                waker.wake_by_ref();
                return Ok(key);
            }
        }

        if let Some(slot) = self.waiters.get(&fd) {
            let occupied = if readable {
                slot.readable.is_some()
            } else {
                slot.writable.is_some()
            };
            if occupied {
                return Err(Error::from_raw(libc::EBUSY));
            }
        }

        let key = self.allocate_key();
        let token = self.allocate_token();
        let deadline = timeout.map(|t| Instant::now() + t);

        let slot = self.waiters.entry(fd).or_default();
        let registration = WaitRegistration {
            key,
            token,
            waker: waker.clone(),
            deadline,
            timeout_error,
        };
        if readable {
            slot.readable = Some(registration);
        } else {
            slot.writable = Some(registration);
        }

        if let Some(deadline) = deadline {
            self.timed_waiters += 1;
            if self.next_deadline.map_or(true, |current| deadline < current) {
                self.next_deadline = Some(deadline);
            }
        }
        self.deadline_dirty = true;
        self.pending_waiters += 1;
        self.inflight_polls.insert(token, PollContext { fd, readable });

        let poll_mask = if readable {
            READ_POLL_MASK
        } else {
            WRITE_POLL_MASK
        };
        if let Err(err) = self.queue_poll_add(token, fd, poll_mask) {
            self.inflight_polls.remove(&token);
            let slot = self.waiters.get_mut(&fd);
            if let Some(slot) = slot {
                let registration = if readable {
                    slot.readable.take()
                } else {
                    slot.writable.take()
                };
                if registration.and_then(|r| r.deadline).is_some() {
                    self.timed_waiters = self.timed_waiters.saturating_sub(1);
                }
                if slot.is_empty() {
                    self.waiters.remove(&fd);
                }
            }
            self.pending_waiters = self.pending_waiters.saturating_sub(1);
            self.deadline_dirty = true;
            return Err(err);
        }

        Ok(key)
    }

    fn process_expired_waiters(&mut self) {
        if self.timed_waiters == 0 {
            self.next_deadline = None;
            self.deadline_dirty = false;
            return;
        }

        let now = Instant::now();
        if !self.deadline_dirty {
            if let Some(deadline) = self.next_deadline {
                if now < deadline {
                    return;
                }
            }
        }

        let mut next_deadline: Option<Instant> = None;
        let fds: Vec<RawFd> = self.waiters.keys().copied().collect();
        for fd in fds {
            for readable in [true, false] {
                let Some(slot) = self.waiters.get_mut(&fd) else {
                    break;
                };
                let registration = if readable {
                    &mut slot.readable
                } else {
                    &mut slot.writable
                };

                let expired =
                    matches!(registration, Some(r) if r.deadline.is_some_and(|d| now >= d));
                if !expired {
                    if let Some(r) = registration {
                        if let Some(deadline) = r.deadline {
                            if next_deadline.map_or(true, |current| deadline < current) {
                                next_deadline = Some(deadline);
                            }
                        }
                    }
                    continue;
                }

                let Some(r) = registration.take() else {
                    continue;
                };
                self.results.insert(r.key, Err(r.timeout_error));
                r.waker.wake();
                self.timed_waiters = self.timed_waiters.saturating_sub(1);
                self.pending_waiters = self.pending_waiters.saturating_sub(1);

                // The one-shot poll is still outstanding; cancel it so the
                // kernel does not complete a dead registration later.
                self.inflight_polls.remove(&r.token);
                if let Err(err) = self.queue_poll_remove(r.token) {
                    self.latch_error(err);
                    return;
                }
            }

            if let Some(slot) = self.waiters.get(&fd) {
                if slot.is_empty() {
                    self.waiters.remove(&fd);
                }
            }
        }

        self.next_deadline = next_deadline;
        self.deadline_dirty = false;
    }

    fn process_completion(&mut self, completion: &Completion) {
        let token = completion.user_data;
        if token == 0 {
            return;
        }

        if token == self.wake_token {
            self.stop.drain();
            if !self.stop.requested() {
                // One-shot semantics: the wake poll must be rearmed after
                // every delivery.
                let wake_fd = self.stop.wake_fd();
                let wake_token = self.wake_token;
                let rearm = self
                    .queue_poll_add(wake_token, wake_fd, READ_POLL_MASK)
                    .and_then(|()| self.flush_submissions());
                if let Err(err) = rearm {
                    self.latch_error(err);
                }
            }
            return;
        }

        let Some(context) = self.inflight_polls.remove(&token) else {
            // Completion for a waiter already expired or cancelled.
            return;
        };

        let Some(slot) = self.waiters.get_mut(&context.fd) else {
            return;
        };
        let registration = if context.readable {
            &mut slot.readable
        } else {
            &mut slot.writable
        };
        if registration.as_ref().map_or(true, |r| r.token != token) {
            return;
        }
        let Some(r) = registration.take() else {
            return;
        };

        let outcome = if completion.result >= 0 {
            Ok(())
        } else {
            Err(Error::from_raw(-completion.result))
        };
        self.results.insert(r.key, outcome);
        r.waker.wake();

        if r.deadline.is_some() {
            self.timed_waiters = self.timed_waiters.saturating_sub(1);
            self.deadline_dirty = true;
        }
        self.pending_waiters = self.pending_waiters.saturating_sub(1);

        if slot.is_empty() {
            self.waiters.remove(&context.fd);
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        self.next_deadline.map(|deadline| {
            let now = Instant::now();
            if deadline <= now {
                Duration::ZERO
            } else {
                deadline - now
            }
        })
    }
}

impl Scheduler for UringCore {
    fn wait_for_readable(
        &mut self,
        fd: RawFd,
        waker: &Waker,
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaitKey> {
        self.arm_waiter(fd, true, waker, timeout, timeout_error)
    }

    fn wait_for_writable(
        &mut self,
        fd: RawFd,
        waker: &Waker,
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaitKey> {
        self.arm_waiter(fd, false, waker, timeout, timeout_error)
    }

    fn consume_wait_result(&mut self, key: WaitKey) -> Option<Result<()>> {
        self.results.remove(&key)
    }

    fn wait_armed(&mut self, fd: RawFd, readable: bool, key: WaitKey, waker: &Waker) -> bool {
        let Some(slot) = self.waiters.get_mut(&fd) else {
            return false;
        };
        let registration = if readable {
            &mut slot.readable
        } else {
            &mut slot.writable
        };
        match registration {
            Some(r) if r.key == key => {
                r.waker = waker.clone();
                true
            }
            _ => false,
        }
    }
}

/// Single-threaded scheduler driving tasks over io_uring one-shot polls.
pub struct UringLoop {
    core: Rc<RefCell<UringCore>>,
    queue: Arc<ReadyQueue>,
    roots: Arc<RootSet>,
    stop: Arc<StopSignal>,
    init_error: Option<Error>,
}

impl UringLoop {
    /// Builds the loop with the requested submission queue depth;
    /// initialization failures are latched and reported by
    /// [`valid`](UringLoop::valid) and [`run`](UringLoop::run).
    pub fn new(queue_depth: u32) -> Self {
        match Self::init(queue_depth) {
            Ok(event_loop) => event_loop,
            Err(err) => {
                let stop =
                    Arc::new(StopSignal::create().unwrap_or_else(|_| StopSignal::dummy()));
                Self {
                    core: Rc::new(RefCell::new(UringCore::new(
                        UringReactor::closed(),
                        stop.clone(),
                    ))),
                    queue: Arc::new(ReadyQueue::new()),
                    roots: Arc::new(RootSet::new()),
                    stop,
                    init_error: Some(err),
                }
            }
        }
    }

    fn init(queue_depth: u32) -> Result<Self> {
        let stop = Arc::new(StopSignal::create()?);
        let reactor = UringReactor::create(queue_depth)?;

        let mut core = UringCore::new(reactor, stop.clone());
        core.wake_token = core.allocate_token();
        let wake_token = core.wake_token;
        core.queue_poll_add(wake_token, stop.wake_fd(), READ_POLL_MASK)?;
        core.flush_submissions()?;

        Ok(Self {
            core: Rc::new(RefCell::new(core)),
            queue: Arc::new(ReadyQueue::new()),
            roots: Arc::new(RootSet::new()),
            stop,
            init_error: None,
        })
    }

    pub fn valid(&self) -> bool {
        self.init_error.is_none()
    }

    /// Spawns a root task tracked by this loop.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        spawn_with(&self.queue, &self.roots, future)
    }

    /// Requests shutdown; callable from any thread.
    pub fn stop(&self) {
        self.stop.request();
    }

    /// A cloneable cross-thread stop handle.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.stop.clone())
    }

    /// Runs until every root task completes, `stop()` is requested, or the
    /// loop latches an irrecoverable error.
    pub fn run(&mut self) -> Result<()> {
        if let Some(err) = self.init_error {
            return Err(err);
        }

        self.stop.rearm();
        self.core.borrow_mut().loop_error = None;
        trace!("io_uring loop running");

        let context = RuntimeContext {
            queue: self.queue.clone(),
            roots: self.roots.clone(),
            scheduler: self.core.clone(),
        };
        let result = enter_context(context, || self.run_loop());
        trace!("io_uring loop finished: {result:?}");
        result
    }

    fn should_stop(&self) -> bool {
        self.stop.requested() || self.core.borrow().loop_error.is_some()
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut completions = [Completion::default(); COMPLETION_BATCH];

        loop {
            self.core.borrow_mut().process_expired_waiters();
            if self.should_stop() {
                break;
            }

            while let Some(task) = self.queue.pop() {
                if !task.is_completed() {
                    task.poll_task();
                }
                self.roots.reap_completed();
                self.core.borrow_mut().process_expired_waiters();
                if self.should_stop() {
                    break;
                }
            }
            if self.should_stop() {
                break;
            }

            if self.queue.is_empty() {
                let (pending_waiters, wait_timeout) = {
                    let core = self.core.borrow();
                    (core.pending_waiters, core.poll_timeout())
                };

                if self.roots.active_count() == 0 && pending_waiters == 0 {
                    break;
                }
                if pending_waiters == 0 {
                    debug!("io_uring loop deadlocked: active roots with no waiters");
                    return Err(Error::from_raw(libc::EDEADLK));
                }

                let wait_result = {
                    let mut core = self.core.borrow_mut();
                    core.flush_submissions()
                        .and_then(|()| core.reactor.wait(&mut completions, wait_timeout))
                };
                let count = wait_result?;

                for completion in &completions[..count] {
                    self.core.borrow_mut().process_completion(completion);
                    if self.core.borrow().loop_error.is_some() {
                        break;
                    }
                }
            }
        }

        self.roots.reap_completed();
        {
            let mut core = self.core.borrow_mut();
            if let Err(err) = core.flush_submissions() {
                core.latch_error(err);
            }
        }
        if let Some(err) = self.core.borrow().loop_error {
            return Err(err);
        }
        Ok(())
    }
}

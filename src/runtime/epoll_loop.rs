//! Epoll-backed scheduler implementation.
//!
//! The loop interleaves draining the ready FIFO with one blocking reactor
//! wait bounded by the nearest waiter deadline. Interest is edge-triggered
//! (`EPOLLET`) with explicit modify transitions; the async combinators
//! drain their sockets on every wake, which is what edge mode requires.

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
use crate::reactor::epoll::{has_event, EpollReactor, ReadyEvent};
use crate::runtime::context::{enter_context, spawn_with, RuntimeContext};
use crate::runtime::queue::ReadyQueue;
use crate::runtime::roots::RootSet;
use crate::runtime::scheduler::{Scheduler, WaitKey};
use crate::runtime::stop::{StopHandle, StopSignal};
use crate::runtime::JoinHandle;

const READ_READY_MASK: u32 =
    (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
const WRITE_READY_MASK: u32 = (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32;
const COMMON_FLAGS: u32 =
    (libc::EPOLLET | libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;

const EVENT_BATCH: usize = 64;

struct WaitRegistration {
    key: WaitKey,
    waker: Waker,
    deadline: Option<Instant>,
    timeout_error: Error,
}

#[derive(Default)]
struct WaiterSlot {
    readable: Option<WaitRegistration>,
    writable: Option<WaitRegistration>,
    registered_mask: u32,
}

impl WaiterSlot {
    fn is_empty(&self) -> bool {
        self.readable.is_none() && self.writable.is_none()
    }
}

pub(crate) struct EpollCore {
    reactor: EpollReactor,
    stop: Arc<StopSignal>,
    waiters: HashMap<RawFd, WaiterSlot>,
    results: HashMap<WaitKey, Result<()>>,
    next_key: WaitKey,
    pending_waiters: usize,
    timed_waiters: usize,
    next_deadline: Option<Instant>,
    deadline_dirty: bool,
    loop_error: Option<Error>,
}

impl EpollCore {
    fn new(reactor: EpollReactor, stop: Arc<StopSignal>) -> Self {
        Self {
            reactor,
            stop,
            waiters: HashMap::new(),
            results: HashMap::new(),
            next_key: 1,
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
        debug!("epoll loop latched error: {err}");
        self.loop_error.get_or_insert(err);
    }

    /// Re-registers the fd's interest mask from the slot occupancy.
    fn refresh_interest(reactor: &EpollReactor, fd: RawFd, slot: &mut WaiterSlot) -> Result<()> {
        let has_read_waiter = slot.readable.is_some();
        let has_write_waiter = slot.writable.is_some();

        let mut desired_mask = 0;
        if has_read_waiter || has_write_waiter {
            desired_mask = COMMON_FLAGS;
            if has_read_waiter {
                desired_mask |= libc::EPOLLIN as u32;
            }
            if has_write_waiter {
                desired_mask |= libc::EPOLLOUT as u32;
            }
        }

        if slot.registered_mask == desired_mask {
            return Ok(());
        }

        if slot.registered_mask == 0 {
            reactor.add(fd, desired_mask)?;
        } else if desired_mask == 0 {
            reactor.remove(fd)?;
        } else {
            reactor.modify(fd, desired_mask)?;
        }
        slot.registered_mask = desired_mask;
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
                // Synthesize the timeout without touching the reactor.
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
        let deadline = timeout.map(|t| Instant::now() + t);

        let slot = self.waiters.entry(fd).or_default();
        let registration = WaitRegistration {
            key,
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

        if let Err(err) = Self::refresh_interest(&self.reactor, fd, slot) {
            // Roll back the registration so the slot, counters, and
            // deadline index stay consistent.
            let registration = if readable {
                slot.readable.take()
            } else {
                slot.writable.take()
            };
            if registration.and_then(|r| r.deadline).is_some() {
                self.timed_waiters = self.timed_waiters.saturating_sub(1);
            }
            self.pending_waiters = self.pending_waiters.saturating_sub(1);
            self.deadline_dirty = true;
            if slot.is_empty() {
                self.waiters.remove(&fd);
            }
            return Err(err);
        }

        Ok(key)
    }

    /// Fires timeout results for every deadline at or before now and
    /// recomputes the earliest remaining deadline. The dirty flag
    /// suppresses the scan while nothing changed and nothing expired.
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
            let Some(slot) = self.waiters.get_mut(&fd) else {
                continue;
            };

            let expired_read = expire_registration(
                &mut slot.readable,
                now,
                &mut self.results,
                &mut self.timed_waiters,
                &mut self.pending_waiters,
                &mut next_deadline,
            );
            let expired_write = expire_registration(
                &mut slot.writable,
                now,
                &mut self.results,
                &mut self.timed_waiters,
                &mut self.pending_waiters,
                &mut next_deadline,
            );

            if expired_read || expired_write {
                if let Err(err) = Self::refresh_interest(&self.reactor, fd, slot) {
                    self.latch_error(err);
                    return;
                }
            }
            if slot.is_empty() {
                self.waiters.remove(&fd);
            }
        }

        self.next_deadline = next_deadline;
        self.deadline_dirty = false;
    }

    fn process_ready_event(&mut self, event: &ReadyEvent) {
        if event.fd == self.stop.wake_fd() {
            self.stop.drain();
            return;
        }

        let Some(slot) = self.waiters.get_mut(&event.fd) else {
            return;
        };

        // Readable half first, then writable, matching delivery order.
        if has_event(event.events, READ_READY_MASK) {
            if let Some(registration) = slot.readable.take() {
                self.results.insert(registration.key, Ok(()));
                registration.waker.wake();
                if registration.deadline.is_some() {
                    self.timed_waiters = self.timed_waiters.saturating_sub(1);
                    self.deadline_dirty = true;
                }
                self.pending_waiters = self.pending_waiters.saturating_sub(1);
            }
        }

        if has_event(event.events, WRITE_READY_MASK) {
            if let Some(registration) = slot.writable.take() {
                self.results.insert(registration.key, Ok(()));
                registration.waker.wake();
                if registration.deadline.is_some() {
                    self.timed_waiters = self.timed_waiters.saturating_sub(1);
                    self.deadline_dirty = true;
                }
                self.pending_waiters = self.pending_waiters.saturating_sub(1);
            }
        }

        if let Err(err) = Self::refresh_interest(&self.reactor, event.fd, slot) {
            self.latch_error(err);
            return;
        }
        if slot.is_empty() {
            self.waiters.remove(&event.fd);
        }
    }

    /// Milliseconds until the next deadline, `-1` for "block indefinitely".
    fn poll_timeout_ms(&self) -> i32 {
        match self.next_deadline {
            None => -1,
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    0
                } else {
                    (deadline - now).as_millis().min(i32::MAX as u128) as i32
                }
            }
        }
    }
}

fn expire_registration(
    registration: &mut Option<WaitRegistration>,
    now: Instant,
    results: &mut HashMap<WaitKey, Result<()>>,
    timed_waiters: &mut usize,
    pending_waiters: &mut usize,
    next_deadline: &mut Option<Instant>,
) -> bool {
    let expired = matches!(registration, Some(r) if r.deadline.is_some_and(|d| now >= d));
    if !expired {
        if let Some(r) = registration {
            if let Some(deadline) = r.deadline {
                if next_deadline.map_or(true, |current| deadline < current) {
                    *next_deadline = Some(deadline);
                }
            }
        }
        return false;
    }

    let Some(r) = registration.take() else {
        return false;
    };
    results.insert(r.key, Err(r.timeout_error));
    r.waker.wake();
    *timed_waiters = timed_waiters.saturating_sub(1);
    *pending_waiters = pending_waiters.saturating_sub(1);
    true
}

impl Scheduler for EpollCore {
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

/// Single-threaded scheduler driving tasks over a level/edge epoll reactor.
pub struct EpollLoop {
    core: Rc<RefCell<EpollCore>>,
    queue: Arc<ReadyQueue>,
    roots: Arc<RootSet>,
    stop: Arc<StopSignal>,
    init_error: Option<Error>,
}

impl EpollLoop {
    /// Builds the loop; initialization failures are latched and reported
    /// by [`valid`](EpollLoop::valid) and [`run`](EpollLoop::run).
    pub fn new() -> Self {
        match Self::init() {
            Ok(event_loop) => event_loop,
            Err(err) => {
                let stop = Arc::new(StopSignal::create().unwrap_or_else(|_| {
                    // Degenerate signal without a usable eventfd; the loop
                    // is invalid and will never run.
                    StopSignal::dummy()
                }));
                Self {
                    core: Rc::new(RefCell::new(EpollCore::new(
                        EpollReactor::closed(),
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

    fn init() -> Result<Self> {
        let stop = Arc::new(StopSignal::create()?);
        let reactor = EpollReactor::create()?;
        // The wake eventfd stays level-triggered so a pending stop token
        // keeps reporting until drained.
        reactor.add(stop.wake_fd(), libc::EPOLLIN as u32)?;

        Ok(Self {
            core: Rc::new(RefCell::new(EpollCore::new(reactor, stop.clone()))),
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
        trace!("epoll loop running");

        let context = RuntimeContext {
            queue: self.queue.clone(),
            roots: self.roots.clone(),
            scheduler: self.core.clone(),
        };
        let result = enter_context(context, || self.run_loop());
        trace!("epoll loop finished: {result:?}");
        result
    }

    fn should_stop(&self) -> bool {
        self.stop.requested() || self.core.borrow().loop_error.is_some()
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut events = [ReadyEvent::default(); EVENT_BATCH];

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
                let (pending_waiters, timeout_ms) = {
                    let core = self.core.borrow();
                    (core.pending_waiters, core.poll_timeout_ms())
                };

                if self.roots.active_count() == 0 && pending_waiters == 0 {
                    break;
                }
                if pending_waiters == 0 {
                    // Roots remain but nothing can ever wake them.
                    debug!("epoll loop deadlocked: active roots with no waiters");
                    return Err(Error::from_raw(libc::EDEADLK));
                }

                let wait_result = {
                    let core = self.core.borrow();
                    core.reactor.wait(&mut events, timeout_ms)
                };
                let count = wait_result?;

                for event in &events[..count] {
                    self.core.borrow_mut().process_ready_event(event);
                    if self.core.borrow().loop_error.is_some() {
                        break;
                    }
                }
            }
        }

        self.roots.reap_completed();
        if let Some(err) = self.core.borrow().loop_error {
            return Err(err);
        }
        Ok(())
    }
}

impl Default for EpollLoop {
    fn default() -> Self {
        Self::new()
    }
}

//! Composable async I/O operations.
//!
//! Every operation here is a loop over a nonblocking syscall attempt plus
//! one readiness wait: would-block suspends, anything else surfaces
//! verbatim. The readiness wait itself is a single leaf future that
//! registers with the scheduler driving the current thread and consumes a
//! one-shot result when resumed.

use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fd::UniqueFd;
use crate::net::{is_in_progress, is_would_block, Endpoint, TcpListener, TcpStream};
use crate::runtime::context::with_scheduler;
use crate::runtime::scheduler::WaitKey;

// Cancellation tokens are polled at least this often while sleeping or
// waiting with a deadline.
const CANCEL_SLICE: Duration = Duration::from_millis(20);

/// Leaf future: suspend until `fd` is ready in one direction, with an
/// optional deadline producing `timeout_error`.
struct ReadinessWait {
    fd: RawFd,
    readable: bool,
    timeout: Option<Duration>,
    timeout_error: Error,
    key: Option<WaitKey>,
}

impl ReadinessWait {
    fn new(fd: RawFd, readable: bool, timeout: Option<Duration>, timeout_error: Error) -> Self {
        Self {
            fd,
            readable,
            timeout,
            timeout_error,
            key: None,
        }
    }
}

impl Future for ReadinessWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.key {
            None => {
                let armed = with_scheduler(|scheduler| {
                    if this.readable {
                        scheduler.wait_for_readable(
                            this.fd,
                            cx.waker(),
                            this.timeout,
                            this.timeout_error,
                        )
                    } else {
                        scheduler.wait_for_writable(
                            this.fd,
                            cx.waker(),
                            this.timeout,
                            this.timeout_error,
                        )
                    }
                });
                match armed {
                    // Waiting requires a driving loop.
                    None => Poll::Ready(Err(Error::from_raw(libc::EINVAL))),
                    Some(Err(err)) => Poll::Ready(Err(err)),
                    Some(Ok(key)) => {
                        this.key = Some(key);
                        Poll::Pending
                    }
                }
            }
            Some(key) => {
                let outcome = with_scheduler(|scheduler| {
                    if let Some(result) = scheduler.consume_wait_result(key) {
                        return Poll::Ready(result);
                    }
                    if scheduler.wait_armed(this.fd, this.readable, key, cx.waker()) {
                        // Spurious poll; the registration stays armed.
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(()))
                });
                match outcome {
                    None => Poll::Ready(Err(Error::from_raw(libc::EINVAL))),
                    Some(poll) => poll,
                }
            }
        }
    }
}

/// Suspends until `fd` is readable.
pub fn wait_readable(fd: RawFd) -> impl Future<Output = Result<()>> {
    ReadinessWait::new(fd, true, None, Error::from_raw(libc::ETIMEDOUT))
}

/// Suspends until `fd` is writable.
pub fn wait_writable(fd: RawFd) -> impl Future<Output = Result<()>> {
    ReadinessWait::new(fd, false, None, Error::from_raw(libc::ETIMEDOUT))
}

/// Suspends until `fd` is readable or `timeout` elapses (`ETIMEDOUT`).
pub fn wait_readable_for(fd: RawFd, timeout: Duration) -> impl Future<Output = Result<()>> {
    ReadinessWait::new(fd, true, Some(timeout), Error::from_raw(libc::ETIMEDOUT))
}

/// Suspends until `fd` is writable or `timeout` elapses (`ETIMEDOUT`).
pub fn wait_writable_for(fd: RawFd, timeout: Duration) -> impl Future<Output = Result<()>> {
    ReadinessWait::new(fd, false, Some(timeout), Error::from_raw(libc::ETIMEDOUT))
}

/// Accepts one connection, suspending while the listener has none pending.
pub async fn async_accept(listener: &TcpListener) -> Result<TcpStream> {
    loop {
        match listener.accept() {
            Ok(stream) => return Ok(stream),
            Err(err) if is_would_block(&err) => {}
            Err(err) => return Err(err),
        }
        wait_readable(listener.native_handle()).await?;
    }
}

/// Connects to `remote`, suspending while the handshake is in flight.
pub async fn async_connect(remote: &Endpoint) -> Result<TcpStream> {
    let stream = TcpStream::connect(remote)?;

    loop {
        match stream.finish_connect() {
            Ok(()) => return Ok(stream),
            Err(err) if is_in_progress(&err) || is_would_block(&err) => {}
            Err(err) => return Err(err),
        }
        wait_writable(stream.native_handle()).await?;
    }
}

/// Reads some bytes, suspending while the socket is empty. Zero means EOF.
pub async fn async_read_some(stream: &TcpStream, buffer: &mut [u8]) -> Result<usize> {
    loop {
        match stream.read_some(buffer) {
            Ok(count) => return Ok(count),
            Err(err) if is_would_block(&err) => {}
            Err(err) => return Err(err),
        }
        wait_readable(stream.native_handle()).await?;
    }
}

/// Writes some bytes, suspending while the send buffer is full.
pub async fn async_write_some(stream: &TcpStream, buffer: &[u8]) -> Result<usize> {
    loop {
        match stream.write_some(buffer) {
            Ok(count) => return Ok(count),
            Err(err) if is_would_block(&err) => {}
            Err(err) => return Err(err),
        }
        wait_writable(stream.native_handle()).await?;
    }
}

/// Fills `buffer` completely; a peer close mid-read is `ECONNRESET`.
pub async fn async_read_exact(stream: &TcpStream, buffer: &mut [u8]) -> Result<()> {
    let mut total = 0;
    while total < buffer.len() {
        let count = async_read_some(stream, &mut buffer[total..]).await?;
        if count == 0 {
            return Err(Error::from_raw(libc::ECONNRESET));
        }
        total += count;
    }
    Ok(())
}

/// Writes `buffer` completely; a peer close mid-write is `EPIPE`.
pub async fn async_write_all(stream: &TcpStream, buffer: &[u8]) -> Result<()> {
    let mut total = 0;
    while total < buffer.len() {
        let count = async_write_some(stream, &buffer[total..]).await?;
        if count == 0 {
            return Err(Error::from_raw(libc::EPIPE));
        }
        total += count;
    }
    Ok(())
}

thread_local! {
    // One timerfd per thread: loops in one process never contend, and the
    // single-threaded scheduler means at most one sleep arms it at a time.
    static SLEEP_TIMER: Result<UniqueFd> = create_sleep_timer();
}

fn create_sleep_timer() -> Result<UniqueFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
        )
    };
    if fd < 0 {
        return Err(Error::from_errno());
    }
    Ok(UniqueFd::from_raw(fd))
}

fn sleep_timer_fd() -> Result<RawFd> {
    SLEEP_TIMER.with(|timer| match timer {
        Ok(fd) => Ok(fd.get()),
        Err(err) => Err(*err),
    })
}

fn arm_timer(timer_fd: RawFd, slice: Duration) -> Result<()> {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: slice.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(slice.subsec_nanos()),
        },
    };
    if unsafe { libc::timerfd_settime(timer_fd, 0, &spec, std::ptr::null_mut()) } != 0 {
        return Err(Error::from_errno());
    }
    Ok(())
}

fn drain_timer(timer_fd: RawFd) -> Result<()> {
    let mut expirations: u64 = 0;
    let count = unsafe {
        libc::read(
            timer_fd,
            (&mut expirations as *mut u64).cast(),
            std::mem::size_of::<u64>(),
        )
    };
    if count < 0 {
        let err = Error::from_errno();
        if err.code() == libc::EINTR || is_would_block(&err) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Sleeps for `duration`, polling `token` at least every 20 ms.
///
/// Returns `ECANCELED` when the token fires, immediately or mid-sleep.
/// Zero duration returns at once.
pub async fn async_sleep(duration: Duration, token: CancelToken) -> Result<()> {
    if token.stop_requested() {
        return Err(Error::from_raw(libc::ECANCELED));
    }
    if duration.is_zero() {
        return Ok(());
    }

    let timer_fd = sleep_timer_fd()?;
    let deadline = Instant::now() + duration;

    loop {
        if token.stop_requested() {
            return Err(Error::from_raw(libc::ECANCELED));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }

        let slice = (deadline - now).clamp(Duration::from_millis(1), CANCEL_SLICE);
        arm_timer(timer_fd, slice)?;
        wait_readable(timer_fd).await?;
        drain_timer(timer_fd)?;
    }
}

fn remaining_slice(deadline: Instant, now: Instant) -> Duration {
    (deadline - now).clamp(Duration::from_millis(1), CANCEL_SLICE)
}

/// Like [`async_read_some`], bounded by `timeout` (`ETIMEDOUT`) and
/// polling `token` each iteration (`ECANCELED`).
///
/// A zero timeout reports `ETIMEDOUT` on the first iteration unless bytes
/// are already available.
pub async fn async_read_some_with_timeout(
    stream: &TcpStream,
    buffer: &mut [u8],
    timeout: Duration,
    token: CancelToken,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;

    loop {
        if token.stop_requested() {
            return Err(Error::from_raw(libc::ECANCELED));
        }

        match stream.read_some(buffer) {
            Ok(count) => return Ok(count),
            Err(err) if is_would_block(&err) => {}
            Err(err) => return Err(err),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::from_raw(libc::ETIMEDOUT));
        }

        let slice = remaining_slice(deadline, now);
        match wait_readable_for(stream.native_handle(), slice).await {
            Ok(()) => {}
            // Slice expiry is re-checked against the deadline above.
            Err(err) if err.code() == libc::ETIMEDOUT => {}
            Err(err) => return Err(err),
        }
    }
}

/// Like [`async_write_some`], bounded by `timeout` (`ETIMEDOUT`) and
/// polling `token` each iteration (`ECANCELED`).
pub async fn async_write_some_with_timeout(
    stream: &TcpStream,
    buffer: &[u8],
    timeout: Duration,
    token: CancelToken,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;

    loop {
        if token.stop_requested() {
            return Err(Error::from_raw(libc::ECANCELED));
        }

        match stream.write_some(buffer) {
            Ok(count) => return Ok(count),
            Err(err) if is_would_block(&err) => {}
            Err(err) => return Err(err),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::from_raw(libc::ETIMEDOUT));
        }

        let slice = remaining_slice(deadline, now);
        match wait_writable_for(stream.native_handle(), slice).await {
            Ok(()) => {}
            Err(err) if err.code() == libc::ETIMEDOUT => {}
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EpollLoop;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn readiness_wait_without_runtime_is_invalid() {
        let mut wait = ReadinessWait::new(0, true, None, Error::from_raw(libc::ETIMEDOUT));
        let waker = {
            struct Noop;
            impl std::task::Wake for Noop {
                fn wake(self: Arc<Self>) {}
            }
            std::task::Waker::from(Arc::new(Noop))
        };
        let mut cx = Context::from_waker(&waker);
        let poll = Pin::new(&mut wait).poll(&mut cx);
        match poll {
            Poll::Ready(Err(err)) => assert_eq!(err.code(), libc::EINVAL),
            other => panic!("expected EINVAL, got {other:?}"),
        }
    }

    #[test]
    fn sleep_zero_is_immediate() {
        let mut event_loop = EpollLoop::new();
        let code = Arc::new(AtomicI32::new(-1));
        let out = code.clone();
        event_loop.spawn(async move {
            let result = async_sleep(Duration::ZERO, CancelToken::default()).await;
            out.store(result.map_or_else(|e| e.code(), |()| 0), Ordering::SeqCst);
        });
        event_loop.run().unwrap();
        assert_eq!(code.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sleep_on_cancelled_token_is_canceled() {
        let mut event_loop = EpollLoop::new();
        let source = crate::cancel::CancelSource::new();
        source.request_stop();
        let token = source.token();

        let code = Arc::new(AtomicI32::new(0));
        let out = code.clone();
        event_loop.spawn(async move {
            let result = async_sleep(Duration::from_secs(1), token).await;
            out.store(result.unwrap_err().code(), Ordering::SeqCst);
        });
        event_loop.run().unwrap();
        assert_eq!(code.load(Ordering::SeqCst), libc::ECANCELED);
    }

    #[test]
    fn sleep_waits_roughly_the_requested_time() {
        let mut event_loop = EpollLoop::new();
        let started = Instant::now();
        event_loop.spawn(async {
            async_sleep(Duration::from_millis(60), CancelToken::default())
                .await
                .unwrap();
        });
        event_loop.run().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(55), "slept {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "slept {elapsed:?}");
    }
}

//! Backpressure-aware buffered writer over an owned nonblocking stream.
//!
//! Producers enqueue byte buffers; crossing the high watermark flips the
//! writer into a backpressured state that rejects further input with
//! `EWOULDBLOCK` until a flush drains the queue back to the low watermark.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::net::TcpStream;
use crate::ops::async_write_some_with_timeout;

// Per-flush-iteration write bound, keeping cancellation responsive while
// amortizing wait registrations.
const FLUSH_SLICE_MIN: Duration = Duration::from_millis(1);
const FLUSH_SLICE_MAX: Duration = Duration::from_millis(100);

/// Queue thresholds in bytes; normalised so `low >= 1` and `high >= low`.
#[derive(Clone, Copy, Debug)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

/// Current backpressure state reported by [`QueuedWriter::enqueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackpressureState {
    Normal,
    HighWatermark,
}

/// Buffered async writer with low/high watermark backpressure.
pub struct QueuedWriter {
    stream: TcpStream,
    marks: Watermarks,
    queue: VecDeque<Vec<u8>>,
    front_offset: usize,
    queued_bytes: usize,
    high_watermark_active: bool,
}

impl QueuedWriter {
    /// Takes ownership of `stream`; watermarks are normalised here.
    pub fn new(stream: TcpStream, marks: Watermarks) -> Self {
        let mut marks = marks;
        if marks.low == 0 {
            marks.low = 1;
        }
        if marks.high < marks.low {
            marks.high = marks.low;
        }
        Self {
            stream,
            marks,
            queue: VecDeque::new(),
            front_offset: 0,
            queued_bytes: 0,
            high_watermark_active: false,
        }
    }

    /// Copies `bytes` into the queue.
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<BackpressureState> {
        self.enqueue_owned(bytes.to_vec())
    }

    /// Moves an owned buffer into the queue.
    ///
    /// While backpressured (`high_watermark_active` and still above the low
    /// watermark) new input is rejected with `EWOULDBLOCK`; the caller must
    /// flush first.
    pub fn enqueue_owned(&mut self, bytes: Vec<u8>) -> Result<BackpressureState> {
        if !self.stream.valid() {
            return Err(Error::from_raw(libc::EBADF));
        }
        if bytes.is_empty() {
            return Ok(self.state());
        }
        if self.high_watermark_active && self.queued_bytes >= self.marks.low {
            return Err(Error::from_raw(libc::EWOULDBLOCK));
        }

        self.queued_bytes += bytes.len();
        self.queue.push_back(bytes);
        if self.queued_bytes >= self.marks.high {
            self.high_watermark_active = true;
        }

        Ok(self.state())
    }

    /// Drains the queue within `timeout`, polling `token` each iteration.
    ///
    /// Fails with `ECANCELED` on cancellation, `ETIMEDOUT` past the
    /// deadline, and `EPIPE` when the peer stops accepting bytes.
    pub async fn flush(&mut self, timeout: Duration, token: CancelToken) -> Result<()> {
        let deadline = Instant::now() + timeout;

        while self.queued_bytes > 0 {
            if token.stop_requested() {
                return Err(Error::from_raw(libc::ECANCELED));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::from_raw(libc::ETIMEDOUT));
            }

            let slice = (deadline - now).clamp(FLUSH_SLICE_MIN, FLUSH_SLICE_MAX);
            let front_offset = self.front_offset;
            let Some(front) = self.queue.front() else {
                break;
            };
            let written = async_write_some_with_timeout(
                &self.stream,
                &front[front_offset..],
                slice,
                token.clone(),
            )
            .await?;
            if written == 0 {
                return Err(Error::from_raw(libc::EPIPE));
            }

            self.front_offset += written;
            self.queued_bytes -= written;
            if self
                .queue
                .front()
                .map_or(false, |front| self.front_offset == front.len())
            {
                self.queue.pop_front();
                self.front_offset = 0;
            }

            if self.high_watermark_active && self.queued_bytes <= self.marks.low {
                self.high_watermark_active = false;
            }
        }

        Ok(())
    }

    /// Flushes everything, then half-closes the stream's write side.
    pub async fn graceful_shutdown(&mut self, timeout: Duration, token: CancelToken) -> Result<()> {
        self.flush(timeout, token).await?;
        self.stream.shutdown_write()
    }

    /// Bytes currently queued and unwritten.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn high_watermark_active(&self) -> bool {
        self.high_watermark_active
    }

    pub fn native_handle(&self) -> RawFd {
        self.stream.native_handle()
    }

    fn state(&self) -> BackpressureState {
        if self.high_watermark_active {
            BackpressureState::HighWatermark
        } else {
            BackpressureState::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Endpoint, TcpListener};

    fn connected_stream() -> (TcpStream, TcpListener) {
        let listener = TcpListener::bind(&Endpoint::loopback(0), 16).unwrap();
        let port = listener.local_port().unwrap();
        let stream = TcpStream::connect(&Endpoint::loopback(port)).unwrap();
        (stream, listener)
    }

    #[test]
    fn watermarks_are_normalised() {
        let (stream, _listener) = connected_stream();
        let writer = QueuedWriter::new(stream, Watermarks { low: 0, high: 0 });
        assert_eq!(writer.marks.low, 1);
        assert_eq!(writer.marks.high, 1);

        let (stream, _listener) = connected_stream();
        let writer = QueuedWriter::new(stream, Watermarks { low: 100, high: 10 });
        assert_eq!(writer.marks.high, 100);
    }

    #[test]
    fn empty_enqueue_reports_state_without_counting() {
        let (stream, _listener) = connected_stream();
        let mut writer = QueuedWriter::new(
            stream,
            Watermarks {
                low: 4096,
                high: 8192,
            },
        );
        assert_eq!(writer.enqueue(&[]).unwrap(), BackpressureState::Normal);
        assert_eq!(writer.queued_bytes(), 0);
    }

    #[test]
    fn crossing_high_sets_flag_and_gates_enqueues() {
        let (stream, _listener) = connected_stream();
        let mut writer = QueuedWriter::new(
            stream,
            Watermarks {
                low: 4096,
                high: 8192,
            },
        );

        assert_eq!(
            writer.enqueue(&vec![0xA1; 6000]).unwrap(),
            BackpressureState::Normal
        );
        assert_eq!(
            writer.enqueue_owned(vec![0xB2; 6000]).unwrap(),
            BackpressureState::HighWatermark
        );
        assert!(writer.high_watermark_active());
        assert_eq!(writer.queued_bytes(), 12000);

        let err = writer.enqueue(&[0xC3; 64]).unwrap_err();
        assert_eq!(err.code(), libc::EWOULDBLOCK);
        assert_eq!(writer.queued_bytes(), 12000);
    }

    #[test]
    fn invalid_stream_is_ebadf() {
        let invalid = TcpStream::from_fd(crate::fd::UniqueFd::new());
        let mut writer = QueuedWriter::new(invalid, Watermarks { low: 1, high: 1 });
        let err = writer.enqueue(&[1]).unwrap_err();
        assert_eq!(err.code(), libc::EBADF);
    }
}

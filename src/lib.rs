//! Single-threaded cooperative async networking runtime for Linux.
//!
//! riptide drives suspendable tasks over pluggable readiness reactors —
//! a level/edge epoll backend and an io_uring one-shot poll backend — and
//! exposes a small set of composable async I/O operations plus a
//! backpressure-aware queued writer.
//!
//! # Architecture
//!
//! - **Engine / event loops**: [`Engine`] selects a backend at
//!   construction; [`EpollLoop`] and [`UringLoop`] implement the same
//!   scheduler contract (ready FIFO, per-fd waiter table, deadline index,
//!   wake eventfd).
//! - **Tasks**: [`spawn`] puts a future on the loop as a tracked root task
//!   and returns a [`JoinHandle`]; awaiting the handle yields the result
//!   or resumes a captured panic.
//! - **Async operations**: [`ops`] builds accept/connect/read/write/sleep
//!   and their timed variants from one readiness-wait primitive.
//! - **Queued writer**: [`QueuedWriter`] layers low/high watermark
//!   backpressure and graceful shutdown over the async write path.
//!
//! # Example
//!
//! ```no_run
//! use riptide::net::{Endpoint, TcpListener};
//! use riptide::{ops, Backend, Engine};
//!
//! let listener = TcpListener::bind(&Endpoint::loopback(0), 128).unwrap();
//! let mut engine = Engine::new(Backend::Epoll, 0);
//! engine.spawn(async move {
//!     let peer = ops::async_accept(&listener).await.unwrap();
//!     let mut buffer = [0u8; 1024];
//!     let count = ops::async_read_some(&peer, &mut buffer).await.unwrap();
//!     ops::async_write_all(&peer, &buffer[..count]).await.unwrap();
//! });
//! engine.run().unwrap();
//! ```

mod cancel;
mod error;
mod fd;
pub mod net;
pub mod ops;
mod reactor;
pub mod resolver;
mod runtime;
mod write_queue;

pub use cancel::{CancelSource, CancelToken};
pub use error::{Error, Result};
pub use fd::{close_fd, UniqueFd};
pub use runtime::{spawn, Backend, Engine, EpollLoop, JoinHandle, StopHandle, UringLoop};
pub use write_queue::{BackpressureState, QueuedWriter, Watermarks};

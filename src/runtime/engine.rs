//! Facade selecting one of the two event-loop backends at construction.

use std::future::Future;

use crate::error::Result;
use crate::runtime::epoll_loop::EpollLoop;
use crate::runtime::stop::StopHandle;
use crate::runtime::uring_loop::{UringLoop, DEFAULT_QUEUE_DEPTH};
use crate::runtime::JoinHandle;

/// Readiness backend driving an [`Engine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Epoll,
    IoUring,
}

enum EngineInner {
    Epoll(EpollLoop),
    Uring(UringLoop),
}

/// Owns and runs one event loop of the selected backend.
///
/// ```no_run
/// use riptide::{Backend, Engine};
///
/// let mut engine = Engine::new(Backend::Epoll, 0);
/// engine.spawn(async {
///     // async work
/// });
/// engine.run().unwrap();
/// ```
pub struct Engine {
    backend: Backend,
    inner: EngineInner,
}

impl Engine {
    /// Builds an engine over the chosen backend. `uring_queue_depth` sizes
    /// the io_uring submission queue and is ignored for epoll; zero picks
    /// the default depth.
    pub fn new(backend: Backend, uring_queue_depth: u32) -> Self {
        let inner = match backend {
            Backend::Epoll => EngineInner::Epoll(EpollLoop::new()),
            Backend::IoUring => {
                let depth = if uring_queue_depth == 0 {
                    DEFAULT_QUEUE_DEPTH
                } else {
                    uring_queue_depth
                };
                EngineInner::Uring(UringLoop::new(depth))
            }
        };
        Self { backend, inner }
    }

    /// The backend selected at construction.
    pub fn selected_backend(&self) -> Backend {
        self.backend
    }

    /// Whether backend initialization succeeded.
    pub fn valid(&self) -> bool {
        match &self.inner {
            EngineInner::Epoll(event_loop) => event_loop.valid(),
            EngineInner::Uring(event_loop) => event_loop.valid(),
        }
    }

    /// Spawns a root task tracked by the underlying loop.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match &self.inner {
            EngineInner::Epoll(event_loop) => event_loop.spawn(future),
            EngineInner::Uring(event_loop) => event_loop.spawn(future),
        }
    }

    /// Runs the loop until all root tasks complete or stop is requested.
    pub fn run(&mut self) -> Result<()> {
        match &mut self.inner {
            EngineInner::Epoll(event_loop) => event_loop.run(),
            EngineInner::Uring(event_loop) => event_loop.run(),
        }
    }

    /// Requests shutdown at the next wake-up boundary; any thread may call.
    pub fn stop(&self) {
        match &self.inner {
            EngineInner::Epoll(event_loop) => event_loop.stop(),
            EngineInner::Uring(event_loop) => event_loop.stop(),
        }
    }

    /// A cloneable cross-thread stop handle.
    pub fn stop_handle(&self) -> StopHandle {
        match &self.inner {
            EngineInner::Epoll(event_loop) => event_loop.stop_handle(),
            EngineInner::Uring(event_loop) => event_loop.stop_handle(),
        }
    }
}

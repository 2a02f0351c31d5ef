//! Runtime subsystem: task type, ready queue, scheduler contract,
//! the two event-loop backends, and the engine facade.

pub(crate) mod context;
mod engine;
mod epoll_loop;
pub(crate) mod queue;
pub(crate) mod roots;
pub(crate) mod scheduler;
pub(crate) mod stop;
pub(crate) mod task;
mod uring_loop;

pub use context::spawn;
pub use engine::{Backend, Engine};
pub use epoll_loop::EpollLoop;
pub use stop::StopHandle;
pub use task::JoinHandle;
pub use uring_loop::UringLoop;

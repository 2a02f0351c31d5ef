//! Thread-local runtime context.
//!
//! A loop installs its context for the duration of `run()`: the ready
//! queue, the root set, and a handle to its scheduler core. Leaf readiness
//! futures reach the scheduler through here, and [`spawn`] reaches the
//! queue, so neither needs an explicit loop reference threaded through
//! every call.
//!
//! Contexts nest: entering saves the previous context and restores it on
//! exit, so a loop driven from inside another loop's thread (unusual but
//! legal) behaves.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use crate::runtime::queue::ReadyQueue;
use crate::runtime::roots::RootSet;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::task::{Runnable, Task};
use crate::runtime::JoinHandle;

pub(crate) struct RuntimeContext {
    pub(crate) queue: Arc<ReadyQueue>,
    pub(crate) roots: Arc<RootSet>,
    pub(crate) scheduler: Rc<RefCell<dyn Scheduler>>,
}

impl Clone for RuntimeContext {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            roots: self.roots.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<RuntimeContext>> = const { RefCell::new(None) };
}

/// Installs `context` for the duration of `f`, restoring the previous
/// context afterwards.
pub(crate) fn enter_context<F, R>(context: RuntimeContext, f: F) -> R
where
    F: FnOnce() -> R,
{
    let previous = CURRENT.with(|current| current.borrow_mut().replace(context));
    let result = f();
    CURRENT.with(|current| {
        *current.borrow_mut() = previous;
    });
    result
}

/// Runs `f` against the current scheduler, or returns `None` outside a
/// runtime context.
pub(crate) fn with_scheduler<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut dyn Scheduler) -> R,
{
    CURRENT.with(|current| {
        let borrowed = current.borrow();
        let context = borrowed.as_ref()?;
        let mut scheduler = context.scheduler.borrow_mut();
        Some(f(&mut *scheduler))
    })
}

pub(crate) fn spawn_with<F, T>(
    queue: &Arc<ReadyQueue>,
    roots: &Arc<RootSet>,
    future: F,
) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let task = Task::new(future, queue.clone());
    roots.track(task.clone() as Arc<dyn Runnable>);
    queue.push(task.clone() as Arc<dyn Runnable>);
    JoinHandle::new(task)
}

/// Spawns a root task on the loop driving the current thread.
///
/// # Panics
/// Panics when called outside a running loop; spawning is loop-thread-only.
pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    CURRENT.with(|current| {
        let borrowed = current.borrow();
        let context = borrowed
            .as_ref()
            .expect("spawn called outside of a runtime context");
        spawn_with(&context.queue, &context.roots, future)
    })
}

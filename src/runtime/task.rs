//! Suspendable task type with result propagation and panic capture.
//!
//! A [`Task`] wraps a future together with everything the runtime needs to
//! drive it: the pinned future slot, a result slot, a captured-panic slot,
//! a completed flag, and the wakers of whoever is joining on it. Tasks are
//! initial-suspended — they run only when popped from the ready queue.
//!
//! Completion never resumes a joiner inline: finishing a task wakes the
//! join waiters, and each wake re-queues the waiting task on the ready
//! FIFO. That keeps the single-threaded invariant that no task is ever
//! polled from inside another task's poll.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::runtime::queue::ReadyQueue;

type TaskOutcome<T> = std::thread::Result<T>;

/// Object-safe surface the ready queue drives.
pub(crate) trait Runnable: Send + Sync {
    fn poll_task(self: Arc<Self>);
    fn is_completed(&self) -> bool;
}

/// A spawned computation producing a `T`.
pub(crate) struct Task<T: Send + 'static> {
    future: Mutex<Option<Pin<Box<dyn Future<Output = T> + Send>>>>,
    result: Mutex<Option<TaskOutcome<T>>>,
    queue: Arc<ReadyQueue>,
    completed: AtomicBool,
    join_waiters: Mutex<Vec<Waker>>,
}

impl<T: Send + 'static> Task<T> {
    pub(crate) fn new<F>(future: F, queue: Arc<ReadyQueue>) -> Arc<Self>
    where
        F: Future<Output = T> + Send + 'static,
    {
        Arc::new(Self {
            future: Mutex::new(Some(Box::pin(future))),
            result: Mutex::new(None),
            queue,
            completed: AtomicBool::new(false),
            join_waiters: Mutex::new(Vec::new()),
        })
    }

    fn finish(&self, outcome: TaskOutcome<T>) {
        *self.result.lock().unwrap() = Some(outcome);
        self.completed.store(true, Ordering::Release);

        let mut waiters = self.join_waiters.lock().unwrap();
        for waker in waiters.drain(..) {
            waker.wake();
        }
    }
}

impl<T: Send + 'static> Wake for Task<T> {
    fn wake(self: Arc<Self>) {
        if !self.completed.load(Ordering::Acquire) {
            let runnable: Arc<dyn Runnable> = self.clone();
            self.queue.push(runnable);
        }
    }
}

impl<T: Send + 'static> Runnable for Task<T> {
    fn poll_task(self: Arc<Self>) {
        let waker = Waker::from(self.clone());
        let mut context = Context::from_waker(&waker);

        let mut future_slot = self.future.lock().unwrap();
        let Some(mut future) = future_slot.take() else {
            return;
        };

        // A panic escaping the future body lands in the panic slot and is
        // resumed at the join point, not here.
        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut context))) {
            Ok(Poll::Pending) => {
                *future_slot = Some(future);
            }
            Ok(Poll::Ready(value)) => {
                drop(future_slot);
                self.finish(Ok(value));
            }
            Err(payload) => {
                drop(future_slot);
                self.finish(Err(payload));
            }
        }
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Awaitable handle to a spawned task.
///
/// Awaiting yields the task's value once it completes, or resumes the
/// task's captured panic in the awaiting context.
pub struct JoinHandle<T: Send + 'static> {
    task: Arc<Task<T>>,
}

impl<T: Send + 'static> JoinHandle<T> {
    pub(crate) fn new(task: Arc<Task<T>>) -> Self {
        Self { task }
    }

    /// Whether the task has run to completion (or panicked).
    pub fn is_finished(&self) -> bool {
        self.task.is_completed()
    }
}

impl<T: Send + 'static> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.task.is_completed() {
            let outcome = self
                .task
                .result
                .lock()
                .unwrap()
                .take()
                .expect("task result consumed more than once");
            return match outcome {
                Ok(value) => Poll::Ready(value),
                Err(payload) => panic::resume_unwind(payload),
            };
        }

        self.task
            .join_waiters
            .lock()
            .unwrap()
            .push(cx.waker().clone());

        // Completion may have raced the waiter registration.
        if self.task.is_completed() {
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &Arc<ReadyQueue>) {
        while let Some(task) = queue.pop() {
            if !task.is_completed() {
                task.poll_task();
            }
        }
    }

    #[test]
    fn task_completes_and_stores_result() {
        let queue = Arc::new(ReadyQueue::new());
        let task = Task::new(async { 41 + 1 }, queue.clone());
        let runnable: Arc<dyn Runnable> = task.clone();
        queue.push(runnable);

        drain(&queue);
        assert!(task.is_completed());
        assert!(matches!(*task.result.lock().unwrap(), Some(Ok(42))));
    }

    #[test]
    fn join_handle_reports_finished() {
        let queue = Arc::new(ReadyQueue::new());
        let task = Task::new(async {}, queue.clone());
        let handle = JoinHandle::new(task.clone());
        assert!(!handle.is_finished());

        queue.push(task as Arc<dyn Runnable>);
        drain(&queue);
        assert!(handle.is_finished());
    }

    #[test]
    fn panic_is_captured_not_propagated() {
        let queue = Arc::new(ReadyQueue::new());
        let task: Arc<Task<()>> = Task::new(async { panic!("boom") }, queue.clone());
        queue.push(task.clone() as Arc<dyn Runnable>);

        // The panic must not escape the poll.
        drain(&queue);
        assert!(task.is_completed());
        assert!(matches!(*task.result.lock().unwrap(), Some(Err(_))));
    }

    #[test]
    fn wake_after_completion_does_not_requeue() {
        let queue = Arc::new(ReadyQueue::new());
        let task = Task::new(async { 7 }, queue.clone());
        queue.push(task.clone() as Arc<dyn Runnable>);
        drain(&queue);

        Waker::from(task).wake();
        assert!(queue.is_empty());
    }
}

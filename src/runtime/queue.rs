//! FIFO ready queue of runnable tasks.
//!
//! Handles are enqueued once per pending resume and drained by the owning
//! event loop before it blocks on its reactor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::runtime::task::Runnable;

pub(crate) struct ReadyQueue {
    queue: Mutex<VecDeque<Arc<dyn Runnable>>>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, task: Arc<dyn Runnable>) {
        self.queue.lock().unwrap().push_back(task);
    }

    pub(crate) fn pop(&self) -> Option<Arc<dyn Runnable>> {
        self.queue.lock().unwrap().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

//! Root-task bookkeeping.
//!
//! Tasks spawned directly on a loop are tracked here; the loop reaps
//! completed roots after every resume, decrementing the active count
//! exactly once per task before dropping its handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::task::Runnable;

pub(crate) struct RootSet {
    tasks: Mutex<Vec<Arc<dyn Runnable>>>,
    active: AtomicUsize,
}

impl RootSet {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
        }
    }

    pub(crate) fn track(&self, task: Arc<dyn Runnable>) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().unwrap().push(task);
    }

    /// Drops every completed root, noting each completion once.
    pub(crate) fn reap_completed(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task| {
            if task.is_completed() {
                self.note_task_completed();
                false
            } else {
                true
            }
        });
    }

    fn note_task_completed(&self) {
        let previous = self.active.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0);
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

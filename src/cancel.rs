//! Cooperative cancellation: a shared atomic flag split into a
//! write-capable source and cheap read-only tokens.
//!
//! The runtime never force-unwinds a task. Cancellation is observed at
//! explicit polling points: sleep slice boundaries, timed I/O iterations,
//! and the resolver's poll loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read-only cancellation view.
///
/// The default token is empty and never reports cancellation.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    state: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    /// Whether the associated source has requested cancellation.
    pub fn stop_requested(&self) -> bool {
        match &self.state {
            Some(state) => state.load(Ordering::Acquire),
            None => false,
        }
    }
}

/// Owns the cancellation flag and hands out tokens observing it.
#[derive(Clone, Debug)]
pub struct CancelSource {
    state: Arc<AtomicBool>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A token bound to this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Some(self.state.clone()),
        }
    }

    /// Signals every token derived from this source.
    pub fn request_stop(&self) {
        self.state.store(true, Ordering::Release);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

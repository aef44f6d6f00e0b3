use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Side channel observed by tests and the demo: which activities ran, and how
/// many continuation waits timed out. Orchestration logic never reads it.
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    executed: Arc<Mutex<Vec<String>>>,
    retry_counter: Arc<AtomicU32>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_activity(&self, name: impl Into<String>) {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.into());
    }

    /// Activity names in execution order.
    pub fn executed_activities(&self) -> Vec<String> {
        self.executed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count_of(&self, name: &str) -> usize {
        self.executed_activities().iter().filter(|n| *n == name).count()
    }

    pub fn increment_retry_counter(&self) -> u32 {
        self.retry_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_counter.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.executed.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.retry_counter.store(0, Ordering::SeqCst);
    }
}

//! Single-flight guard: at most one holder at a time, extra callers turned away.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug)]
pub struct SingleFlight<T> {
    state: Mutex<T>,
    executed: AtomicU64,
    dropped: AtomicU64,
}

impl<T> SingleFlight<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            executed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enter the flight without waiting. `None` when another caller holds it.
    pub fn try_enter(&self) -> Option<MutexGuard<'_, T>> {
        match self.state.try_lock() {
            Ok(guard) => {
                self.executed.fetch_add(1, Ordering::SeqCst);
                Some(guard)
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    /// Wait for the flight to land, then hold it. Not counted.
    pub async fn wait(&self) -> MutexGuard<'_, T> {
        self.state.lock().await
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

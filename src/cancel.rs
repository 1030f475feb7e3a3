//! Cancellation signal for slow setup work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{KvError, Result};

/// Cooperative cancellation flag; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once `cancel()` has been called
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(KvError::Cancelled);
        }
        Ok(())
    }
}

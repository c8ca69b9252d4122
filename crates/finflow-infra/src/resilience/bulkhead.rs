//! Bounded worker pools.
//!
//! Stage jobs hold a permit from the CPU or I/O bulkhead while they run.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// A permit held while a bulkhead-protected job executes.
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    bulkhead_name: Arc<str>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        debug!(bulkhead = %self.bulkhead_name, "Bulkhead permit released");
    }
}

/// Limits how many jobs of one kind run at once.
#[derive(Clone)]
pub struct Bulkhead {
    name: Arc<str>,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(name: &str, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            name: Arc::from(name),
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Wait for a free slot. Returns `None` once the bulkhead is closed.
    pub async fn acquire(&self) -> Option<BulkheadPermit> {
        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => {
                debug!(bulkhead = %self.name, "Bulkhead permit acquired");
                Some(BulkheadPermit {
                    _permit: permit,
                    bulkhead_name: self.name.clone(),
                })
            }
            Err(_) => None,
        }
    }

    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| BulkheadPermit {
                _permit: permit,
                bulkhead_name: self.name.clone(),
            })
    }

    /// Refuse new permits; waiters get `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("max_concurrent", &self.max_concurrent)
            .field("available", &self.available_permits())
            .finish()
    }
}

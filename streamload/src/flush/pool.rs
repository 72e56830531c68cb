//! Bounded capacity for flush jobs.
//!
//! A semaphore-backed limiter: the supervisor takes a permit per submitted
//! job and the job holds it until it finishes. Permits are owned so they can
//! move into spawned tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Semaphore of flush slots with running and high-water gauges.
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    running: Arc<AtomicUsize>,
    high_water: AtomicUsize,
}

impl WorkerPool {
    /// Creates a pool. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            running: Arc::new(AtomicUsize::new(0)),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Takes a permit if one is free.
    pub fn try_acquire(&self) -> Option<FlushSlot> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;

        let now_running = self.running.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water.fetch_max(now_running, Ordering::Relaxed);
        Some(FlushSlot {
            _permit: permit,
            running: Arc::clone(&self.running),
        })
    }

    /// Waits until every permit is back, up to `timeout`.
    ///
    /// Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.semaphore.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                drop(permits);
                true
            }
            Ok(Err(_)) | Err(_) => false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Highest concurrent job count observed.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}

/// One running flush job. Dropping it frees the slot.
#[derive(Debug)]
pub struct FlushSlot {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for FlushSlot {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }
}

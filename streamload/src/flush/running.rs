//! In-flight flush job tracking.
//!
//! A job is tracked from submission, before its batch size is known, so the
//! detector can charge a pessimistic estimate for it on the next tick.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::stream::Stream;

/// Identifies one submitted flush job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

/// Running flush jobs per stream, with their batch sizes once known.
#[derive(Debug, Default)]
pub struct RunningFlushWorkers {
    workers: Mutex<HashMap<Stream, HashMap<WorkerId, Option<u64>>>>,
    next_id: AtomicU64,
}

impl RunningFlushWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job for the stream with an unknown batch size.
    pub fn track(&self, stream: &Stream) -> WorkerId {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.workers
            .lock()
            .entry(stream.clone())
            .or_default()
            .insert(id, None);
        id
    }

    /// Records the size of the batch the job took.
    pub fn register_batch_size(&self, stream: &Stream, id: WorkerId, bytes: u64) {
        if let Some(slot) = self
            .workers
            .lock()
            .get_mut(stream)
            .and_then(|jobs| jobs.get_mut(&id))
        {
            *slot = Some(bytes);
        }
    }

    /// Removes a finished job.
    pub fn complete(&self, stream: &Stream, id: WorkerId) {
        let mut workers = self.workers.lock();
        if let Some(jobs) = workers.get_mut(stream) {
            jobs.remove(&id);
            if jobs.is_empty() {
                workers.remove(stream);
            }
        }
    }

    /// Batch sizes of the stream's running jobs (`None` = not yet known).
    pub fn batch_sizes(&self, stream: &Stream) -> Vec<Option<u64>> {
        self.workers
            .lock()
            .get(stream)
            .map(|jobs| jobs.values().copied().collect())
            .unwrap_or_default()
    }

    /// Jobs running across all streams.
    pub fn running_count(&self) -> usize {
        self.workers.lock().values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_register_complete() {
        let running = RunningFlushWorkers::new();
        let users = Stream::new("users");

        let a = running.track(&users);
        let b = running.track(&users);
        assert_eq!(running.running_count(), 2);

        running.register_batch_size(&users, a, 100);
        let mut sizes = running.batch_sizes(&users);
        sizes.sort();
        assert_eq!(sizes, vec![None, Some(100)]);

        running.complete(&users, a);
        running.complete(&users, b);
        assert_eq!(running.running_count(), 0);
        assert!(running.batch_sizes(&users).is_empty());
    }
}

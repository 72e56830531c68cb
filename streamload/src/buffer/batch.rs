//! Batches taken from a stream buffer.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::memory::MemoryManager;
use crate::state::{StateId, StateManager};
use crate::stream::Stream;

use super::queue::BufferedRecord;

/// Records removed from a buffer, holding their memory until released.
///
/// [`MessageBatch::release`] acknowledges the records to the state manager
/// and returns their memory. Dropping an unreleased batch (e.g. after a
/// failed flush) returns the memory only; its checkpoints stay pending.
#[derive(Debug)]
pub struct MessageBatch {
    stream: Stream,
    records: Vec<BufferedRecord>,
    size_bytes: u64,
    memory: Arc<MemoryManager>,
    states: Arc<StateManager>,
    freed: bool,
}

impl MessageBatch {
    pub(crate) fn new(
        stream: Stream,
        records: Vec<BufferedRecord>,
        size_bytes: u64,
        memory: Arc<MemoryManager>,
        states: Arc<StateManager>,
    ) -> Self {
        Self {
            stream,
            records,
            size_bytes,
            memory,
            states,
            freed: false,
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn records(&self) -> &[BufferedRecord] {
        &self.records
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Acknowledges the records as flushed and frees their memory.
    pub fn release(mut self) {
        let mut counts: BTreeMap<StateId, u64> = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.state_id).or_default() += 1;
        }
        for (id, count) in counts {
            self.states.decrement(id, count);
        }
        self.free_memory();
    }

    fn free_memory(&mut self) {
        if self.freed {
            return;
        }
        self.freed = true;
        self.memory.free(self.size_bytes);
        debug!(
            stream = %self.stream,
            records = self.records.len(),
            bytes = self.size_bytes,
            "Batch memory released"
        );
    }
}

impl Drop for MessageBatch {
    fn drop(&mut self) {
        self.free_memory();
    }
}

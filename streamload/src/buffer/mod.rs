//! Per-stream record buffers under a global memory budget.
//!
//! Each stream's queue grows its reservation one block at a time from the
//! [`MemoryManager`]. When the budget is exhausted, [`StreamBuffers::add_record`]
//! waits and retries, which is the engine's backpressure on the input. The
//! wait ends early with the run's first failure once a flush has failed.
//!
//! ```text
//!  add_record ──► [queue full?] ──yes──► request_memory() ──0──► sleep or failure
//!                      │ no                    │ >0
//!                      ▼                       ▼
//!                   append               grow reservation
//!
//!  take(stream, max) ──► MessageBatch ──release()──► free memory + ack states
//! ```

mod batch;
mod queue;

pub use batch::MessageBatch;
pub use queue::BufferedRecord;

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::LoadError;
use crate::flush::FlushFailure;
use crate::memory::MemoryManager;
use crate::message::Record;
use crate::state::StateManager;
use crate::stream::Stream;

use queue::StreamQueue;

/// Buffers for every stream seen on the buffered path.
pub struct StreamBuffers {
    queues: DashMap<Stream, Arc<StreamQueue>>,
    memory: Arc<MemoryManager>,
    states: Arc<StateManager>,
    failure: Arc<FlushFailure>,
    retry_interval: Duration,
}

impl StreamBuffers {
    pub fn new(
        memory: Arc<MemoryManager>,
        states: Arc<StateManager>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            queues: DashMap::new(),
            memory,
            states,
            failure: Arc::new(FlushFailure::new()),
            retry_interval,
        }
    }

    /// Shares the run's failure slot so waiting producers see flush failures.
    pub fn with_failure(mut self, failure: Arc<FlushFailure>) -> Self {
        self.failure = failure;
        self
    }

    /// Appends a record, waiting for memory if the stream's queue is full.
    ///
    /// # Errors
    ///
    /// Returns the recorded flush failure if one is set before or while the
    /// record waits for memory. The record is dropped in that case.
    pub async fn add_record(&self, record: Record, size_bytes: u64) -> Result<(), LoadError> {
        self.failure.check()?;
        let stream = record.stream.clone();
        let queue = self.queue_for(&stream);
        let state_id = self.states.state_id_and_increment(&stream);

        let mut entry = BufferedRecord {
            record,
            size_bytes,
            state_id,
        };
        let mut waited = false;
        loop {
            match queue.offer(entry) {
                Ok(()) => {
                    if waited {
                        debug!(stream = %stream, "Memory became available, record buffered");
                    }
                    return Ok(());
                }
                Err(rejected) => entry = rejected,
            }

            let granted = self.memory.request_memory();
            if granted > 0 {
                queue.add_max_memory(granted);
                continue;
            }

            if !waited {
                debug!(
                    stream = %stream,
                    bytes = size_bytes,
                    "Memory budget exhausted, waiting for flushes"
                );
                waited = true;
            }
            tokio::select! {
                _ = self.failure.failed() => {
                    debug!(stream = %stream, "Flush failed while waiting for memory");
                    return self.failure.check();
                }
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Records a checkpoint against the stream's buffered records.
    pub fn add_state(&self, stream: &Stream, state: Value) -> Result<(), LoadError> {
        self.queue_for(stream);
        self.states.track_state(stream, state)
    }

    /// Records a checkpoint covering every stream's buffered records.
    pub fn add_global_state(&self, state: Value) -> Result<(), LoadError> {
        self.states.track_global_state(state)
    }

    /// Removes up to `max_bytes` from the stream's buffer.
    ///
    /// Never returns an empty batch; `None` means nothing is buffered.
    pub fn take(&self, stream: &Stream, max_bytes: u64) -> Option<MessageBatch> {
        let queue = self.queues.get(stream).map(|q| Arc::clone(&q))?;
        let (records, bytes, idle) = queue.drain(max_bytes);
        if idle > 0 {
            self.memory.free(idle);
        }
        if records.is_empty() {
            return None;
        }

        trace!(stream = %stream, records = records.len(), bytes, "Batch taken");
        Some(MessageBatch::new(
            stream.clone(),
            records,
            bytes,
            Arc::clone(&self.memory),
            Arc::clone(&self.states),
        ))
    }

    /// Buffered bytes, or `None` for an unknown stream.
    pub fn queue_size_bytes(&self, stream: &Stream) -> Option<u64> {
        self.queues.get(stream).map(|q| q.size_bytes())
    }

    /// Buffered record count, or `None` for an unknown stream.
    pub fn queue_size_records(&self, stream: &Stream) -> Option<usize> {
        self.queues.get(stream).map(|q| q.size_records())
    }

    /// When the stream last received a record.
    pub fn time_of_last_record(&self, stream: &Stream) -> Option<Instant> {
        self.queues.get(stream).and_then(|q| q.last_record_at())
    }

    /// Every stream that has a buffer.
    pub fn buffered_streams(&self) -> BTreeSet<Stream> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// Buffered bytes across all streams.
    pub fn total_queued_bytes(&self) -> u64 {
        self.queues.iter().map(|e| e.value().size_bytes()).sum()
    }

    /// Buffered records across all streams.
    pub fn total_queued_records(&self) -> usize {
        self.queues.iter().map(|e| e.value().size_records()).sum()
    }

    /// Budget reserved by buffers (including in-flight batches).
    pub fn reserved_bytes(&self) -> u64 {
        self.memory.current_memory_bytes().max(0) as u64
    }

    /// Configured budget.
    pub fn max_queue_size_bytes(&self) -> u64 {
        self.memory.max_memory_bytes()
    }

    fn queue_for(&self, stream: &Stream) -> Arc<StreamQueue> {
        if let Some(queue) = self.queues.get(stream) {
            return Arc::clone(&queue);
        }
        let queue = self
            .queues
            .entry(stream.clone())
            .or_insert_with(|| {
                debug!(stream = %stream, "Creating stream buffer");
                Arc::new(StreamQueue::default())
            })
            .clone();
        let granted = self.memory.request_memory();
        if granted > 0 {
            queue.add_max_memory(granted);
        }
        queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn buffers(max: u64, block: u64) -> StreamBuffers {
        StreamBuffers::new(
            Arc::new(MemoryManager::new(max, block)),
            Arc::new(StateManager::new()),
            Duration::from_millis(1),
        )
    }

    fn record(stream: &Stream, id: u64, size: u64) -> Record {
        Record {
            stream: stream.clone(),
            index: id,
            size_bytes: size,
            data: json!({ "id": id }),
            emitted_at: None,
        }
    }

    #[tokio::test]
    async fn test_take_respects_max_bytes() {
        let buffers = buffers(1024, 256);
        let users = Stream::new("users");
        for id in 0..5 {
            buffers.add_record(record(&users, id, 10), 10).await.unwrap();
        }

        let batch = buffers.take(&users, 25).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_bytes(), 20);
        assert_eq!(buffers.queue_size_records(&users), Some(3));
        assert_eq!(buffers.queue_size_bytes(&users), Some(30));
    }

    #[tokio::test]
    async fn test_take_returns_oversized_head_alone() {
        let buffers = buffers(1024, 256);
        let users = Stream::new("users");
        buffers.add_record(record(&users, 0, 100), 100).await.unwrap();
        buffers.add_record(record(&users, 1, 5), 5).await.unwrap();

        let batch = buffers.take(&users, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.size_bytes(), 100);
    }

    #[tokio::test]
    async fn test_unknown_and_empty_streams() {
        let buffers = buffers(1024, 256);
        let users = Stream::new("users");
        assert!(buffers.take(&users, 10).is_none());
        assert_eq!(buffers.queue_size_bytes(&users), None);
        assert_eq!(buffers.time_of_last_record(&users), None);

        buffers.add_record(record(&users, 0, 10), 10).await.unwrap();
        assert!(buffers.time_of_last_record(&users).is_some());
        buffers.take(&users, 100).unwrap().release();
        assert!(buffers.take(&users, 100).is_none());
        assert_eq!(buffers.queue_size_bytes(&users), Some(0));
    }

    #[tokio::test]
    async fn test_memory_returns_to_zero_after_release() {
        let memory = Arc::new(MemoryManager::new(1024, 64));
        let states = Arc::new(StateManager::new());
        let buffers = StreamBuffers::new(memory.clone(), states, Duration::from_millis(1));
        let users = Stream::new("users");

        for id in 0..10 {
            buffers.add_record(record(&users, id, 30), 30).await.unwrap();
        }
        assert!(memory.current_memory_bytes() >= 300);

        while let Some(batch) = buffers.take(&users, 100) {
            batch.release();
        }
        assert_eq!(memory.current_memory_bytes(), 0);
    }

    #[tokio::test]
    async fn test_release_acknowledges_checkpoint() {
        let states = Arc::new(StateManager::new());
        let buffers = StreamBuffers::new(
            Arc::new(MemoryManager::new(1024, 64)),
            states.clone(),
            Duration::from_millis(1),
        );
        let users = Stream::new("users");

        buffers.add_record(record(&users, 0, 10), 10).await.unwrap();
        buffers.add_record(record(&users, 1, 10), 10).await.unwrap();
        buffers.add_state(&users, json!({"cursor": 2})).unwrap();

        let sink = crate::state::NullCheckpointSink;
        assert_eq!(states.flush_states(&sink), 0);
        buffers.take(&users, 100).unwrap().release();
        assert_eq!(states.flush_states(&sink), 1);
    }

    #[tokio::test]
    async fn test_dropped_batch_keeps_checkpoint_pending() {
        let memory = Arc::new(MemoryManager::new(1024, 64));
        let states = Arc::new(StateManager::new());
        let buffers = StreamBuffers::new(memory.clone(), states.clone(), Duration::from_millis(1));
        let users = Stream::new("users");

        buffers.add_record(record(&users, 0, 10), 10).await.unwrap();
        buffers.add_state(&users, json!({"cursor": 1})).unwrap();

        drop(buffers.take(&users, 100));
        assert_eq!(states.flush_states(&crate::state::NullCheckpointSink), 0);
        assert_eq!(states.pending_checkpoints(), 1);
        assert_eq!(memory.current_memory_bytes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backpressure_waits_for_release() {
        let memory = Arc::new(MemoryManager::new(100, 100));
        let states = Arc::new(StateManager::new());
        let buffers = Arc::new(StreamBuffers::new(
            memory.clone(),
            states,
            Duration::from_millis(5),
        ));
        let users = Stream::new("users");

        buffers.add_record(record(&users, 0, 80), 80).await.unwrap();

        let producer = {
            let buffers = buffers.clone();
            let users = users.clone();
            tokio::spawn(async move { buffers.add_record(record(&users, 1, 80), 80).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!producer.is_finished());

        buffers.take(&users, 100).unwrap().release();
        tokio::time::timeout(Duration::from_secs(2), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(buffers.queue_size_bytes(&users), Some(80));
    }

    #[tokio::test]
    async fn test_waiting_producer_sees_flush_failure() {
        let failure = Arc::new(FlushFailure::new());
        let buffers = Arc::new(
            StreamBuffers::new(
                Arc::new(MemoryManager::new(100, 100)),
                Arc::new(StateManager::new()),
                Duration::from_secs(60),
            )
            .with_failure(Arc::clone(&failure)),
        );
        let users = Stream::new("users");
        buffers.add_record(record(&users, 0, 80), 80).await.unwrap();

        let producer = {
            let buffers = buffers.clone();
            let users = users.clone();
            tokio::spawn(async move { buffers.add_record(record(&users, 1, 80), 80).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        failure.propagate(LoadError::Protocol("flush exploded".into()));
        let err = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("flush exploded"));

        let err = buffers.add_record(record(&users, 2, 1), 1).await.unwrap_err();
        assert!(matches!(err, LoadError::Protocol(_)));
    }

    proptest! {
        #[test]
        fn test_take_round_trip(sizes in prop::collection::vec(1u64..200, 1..60),
                                max_bytes in 1u64..500) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let buffers = buffers(1 << 20, 4096);
                let users = Stream::new("users");
                for (id, size) in sizes.iter().enumerate() {
                    buffers.add_record(record(&users, id as u64, *size), *size).await.unwrap();
                }

                let mut ids = Vec::new();
                let mut total = 0u64;
                while let Some(batch) = buffers.take(&users, max_bytes) {
                    prop_assert!(!batch.is_empty());
                    prop_assert!(batch.len() == 1 || batch.size_bytes() <= max_bytes);
                    total += batch.size_bytes();
                    ids.extend(batch.records().iter().map(|r| r.record.index));
                    batch.release();
                }

                prop_assert_eq!(ids, (0..sizes.len() as u64).collect::<Vec<_>>());
                prop_assert_eq!(total, sizes.iter().sum::<u64>());
                Ok(())
            })?;
        }
    }
}

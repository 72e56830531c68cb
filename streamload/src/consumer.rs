//! Buffered-path consumer.
//!
//! ```text
//!   line ──► fail-fast check ──► deserialize ──► catalog check
//!              RECORD       ──► StreamBuffers::add_record (waits for memory or a failure)
//!              STATE        ──► StreamBuffers::add_state
//!              GLOBAL_STATE ──► StreamBuffers::add_global_state
//!   close ──► FlushWorkers::close (drain) ──► on_close(succeeded) ──► first failure
//! ```

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::buffer::StreamBuffers;
use crate::config::EngineConfig;
use crate::destination::BufferedDestination;
use crate::error::{LoadError, Phase};
use crate::flush::{FlushFailure, FlushWorkers};
use crate::memory::MemoryManager;
use crate::message::{Deserializer, JsonDeserializer, ProtocolMessage, Record};
use crate::state::{CheckpointSink, StateManager};
use crate::stream::{Catalog, Stream};

/// Accepts protocol messages into stream buffers and drives the flush
/// workers that drain them into a [`BufferedDestination`].
pub struct BufferedConsumer {
    destination: Arc<dyn BufferedDestination>,
    catalog: Arc<Catalog>,
    deserializer: JsonDeserializer,
    memory: Arc<MemoryManager>,
    buffers: Arc<StreamBuffers>,
    failure: Arc<FlushFailure>,
    flush_workers: FlushWorkers,
    next_index: DashMap<Stream, u64>,
    records_accepted: AtomicU64,
    checkpoints_accepted: AtomicU64,
    started: AtomicBool,
}

impl BufferedConsumer {
    pub fn new(
        destination: Arc<dyn BufferedDestination>,
        catalog: Arc<Catalog>,
        config: &EngineConfig,
        checkpoints: Arc<dyn CheckpointSink>,
    ) -> Self {
        let memory = Arc::new(MemoryManager::from_settings(&config.memory));
        let states = Arc::new(StateManager::new());
        let failure = Arc::new(FlushFailure::new());
        let buffers = Arc::new(
            StreamBuffers::new(
                Arc::clone(&memory),
                Arc::clone(&states),
                config.memory.retry_interval,
            )
            .with_failure(Arc::clone(&failure)),
        );
        let flush_workers = FlushWorkers::new(
            Arc::clone(&buffers),
            states,
            Arc::clone(&destination),
            checkpoints,
            Arc::clone(&failure),
            &config.flush,
        );

        Self {
            destination,
            catalog,
            deserializer: JsonDeserializer,
            memory,
            buffers,
            failure,
            flush_workers,
            next_index: DashMap::new(),
            records_accepted: AtomicU64::new(0),
            checkpoints_accepted: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Runs the destination's `on_start` hook and starts the flush supervisor.
    pub async fn start(&self) -> Result<(), LoadError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.destination
            .on_start()
            .await
            .map_err(|e| LoadError::destination(Phase::Setup, None, Some("on_start"), e))?;
        self.flush_workers.start();
        info!(streams = self.catalog.len(), "Buffered consumer started");
        Ok(())
    }

    /// Decodes one input line and accepts it.
    ///
    /// Fails fast with the recorded flush failure once any flush has failed.
    pub async fn accept(&self, line: &str, size_bytes: u64) -> Result<(), LoadError> {
        self.failure.check()?;
        let message = self.deserializer.deserialize(line)?;
        self.accept_message(message, size_bytes).await
    }

    /// Accepts an already decoded message.
    ///
    /// Blocks while the stream's buffer is full and the memory budget is
    /// exhausted, unless a flush fails in the meantime.
    pub async fn accept_message(
        &self,
        message: ProtocolMessage,
        size_bytes: u64,
    ) -> Result<(), LoadError> {
        self.failure.check()?;

        match message {
            ProtocolMessage::Record(wire) => {
                let stream =
                    self.known_stream(Stream::from_parts(wire.namespace.clone(), &wire.stream))?;
                let index = {
                    let mut next = self.next_index.entry(stream).or_insert(0);
                    let index = *next;
                    *next += 1;
                    index
                };
                let record = Record::from_message(wire, index, size_bytes);
                self.buffers.add_record(record, size_bytes).await?;
                self.records_accepted.fetch_add(1, Ordering::Relaxed);
            }
            ProtocolMessage::State(state) => {
                let stream =
                    self.known_stream(Stream::from_parts(state.namespace, &state.stream))?;
                self.buffers.add_state(&stream, state.data)?;
                self.checkpoints_accepted.fetch_add(1, Ordering::Relaxed);
            }
            ProtocolMessage::GlobalState(state) => {
                self.buffers.add_global_state(state.data)?;
                self.checkpoints_accepted.fetch_add(1, Ordering::Relaxed);
            }
            ProtocolMessage::StreamComplete(descriptor) => {
                debug!(stream = %descriptor.stream, "Stream complete received");
            }
            ProtocolMessage::Trace(trace) => {
                debug!(message = %trace.message, "Trace received");
            }
        }
        Ok(())
    }

    /// Accepts every non-blank line of the reader, stopping at the first error.
    pub async fn consume<R>(&self, reader: R) -> Result<u64, LoadError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut accepted = 0u64;
        let mut line_number = 0u64;

        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            self.accept(&line, line.len() as u64)
                .await
                .map_err(|e| match e {
                    LoadError::Deserialize(reason) => {
                        LoadError::Deserialize(format!("input line {}: {}", line_number, reason))
                    }
                    other => other,
                })?;
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Drains all buffers, runs `on_close` and returns the first failure.
    pub async fn close(&self) -> Result<(), LoadError> {
        let drained = self.flush_workers.close().await;
        let succeeded = drained.is_ok() && !self.failure.is_failed();

        let closed = self
            .destination
            .on_close(succeeded)
            .await
            .map_err(|e| LoadError::destination(Phase::Teardown, None, Some("on_close"), e));

        if let Some(err) = self.failure.error() {
            warn!(error = %err, "Buffered consumer closed after a flush failure");
            return Err(err);
        }
        drained?;
        closed?;

        info!(
            records = self.records_accepted(),
            checkpoints = self.checkpoints_accepted.load(Ordering::Relaxed),
            peak_workers = self.flush_workers.peak_workers(),
            "Buffered consumer closed"
        );
        Ok(())
    }

    pub fn buffers(&self) -> &Arc<StreamBuffers> {
        &self.buffers
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn flush_workers(&self) -> &FlushWorkers {
        &self.flush_workers
    }

    pub fn records_accepted(&self) -> u64 {
        self.records_accepted.load(Ordering::Relaxed)
    }

    fn known_stream(&self, stream: Stream) -> Result<Stream, LoadError> {
        if self.catalog.contains(&stream) {
            Ok(stream)
        } else {
            Err(LoadError::UnknownStream(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferedRecord;
    use crate::error::DestinationError;
    use crate::state::Checkpoint;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        flushed: Mutex<Vec<(Stream, u64)>>,
        closed: Mutex<Option<bool>>,
        fail: bool,
    }

    impl BufferedDestination for Collect {
        fn flush<'a>(
            &'a self,
            stream: &'a Stream,
            records: &'a [BufferedRecord],
        ) -> BoxFuture<'a, Result<(), DestinationError>> {
            Box::pin(async move {
                if self.fail {
                    return Err(DestinationError::new("table locked"));
                }
                let mut flushed = self.flushed.lock();
                flushed.extend(records.iter().map(|r| (stream.clone(), r.record.index)));
                Ok(())
            })
        }

        fn on_close(&self, succeeded: bool) -> BoxFuture<'_, Result<(), DestinationError>> {
            Box::pin(async move {
                *self.closed.lock() = Some(succeeded);
                Ok(())
            })
        }

        fn optimal_batch_size_bytes(&self) -> u64 {
            1024
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.flush.supervisor_interval = Duration::from_millis(10);
        config.flush.max_time_between_flushes = Duration::from_millis(20);
        config.memory.retry_interval = Duration::from_millis(1);
        config
    }

    fn record(stream: &str, id: u64) -> String {
        format!(r#"{{"type":"RECORD","stream":"{}","data":{{"id":{}}}}}"#, stream, id)
    }

    fn state(stream: &str, cursor: u64) -> String {
        format!(r#"{{"type":"STATE","stream":"{}","data":{{"cursor":{}}}}}"#, stream, cursor)
    }

    #[tokio::test]
    async fn test_records_flow_through_to_destination() {
        let destination = Arc::new(Collect::default());
        let catalog = Arc::new(Catalog::new(vec![Stream::new("users")]));
        let checkpoints = Arc::new(Mutex::new(Vec::<Checkpoint>::new()));
        let sink = Arc::clone(&checkpoints);
        let consumer = BufferedConsumer::new(
            destination.clone(),
            catalog,
            &config(),
            Arc::new(move |c: Checkpoint| sink.lock().push(c)),
        );

        consumer.start().await.unwrap();
        for id in 0..5 {
            let line = record("users", id);
            consumer.accept(&line, line.len() as u64).await.unwrap();
        }
        let line = state("users", 5);
        consumer.accept(&line, line.len() as u64).await.unwrap();
        consumer.close().await.unwrap();

        let mut indices: Vec<u64> = destination.flushed.lock().iter().map(|(_, i)| *i).collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(*destination.closed.lock(), Some(true));
        assert_eq!(consumer.records_accepted(), 5);

        let checkpoints = checkpoints.lock();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].record_count, 5);
        assert_eq!(checkpoints[0].state["cursor"], 5);
    }

    #[tokio::test]
    async fn test_unknown_stream_is_rejected() {
        let consumer = BufferedConsumer::new(
            Arc::new(Collect::default()),
            Arc::new(Catalog::new(vec![Stream::new("users")])),
            &config(),
            Arc::new(crate::state::NullCheckpointSink),
        );

        let err = consumer.accept(&record("ghosts", 1), 10).await.unwrap_err();
        assert!(matches!(err, LoadError::UnknownStream(ref s) if s.name() == "ghosts"));
        let err = consumer.accept(&state("ghosts", 1), 10).await.unwrap_err();
        assert!(matches!(err, LoadError::UnknownStream(_)));
    }

    #[tokio::test]
    async fn test_flush_failure_fails_fast_and_closes_unsuccessfully() {
        let destination = Arc::new(Collect {
            fail: true,
            ..Collect::default()
        });
        let consumer = BufferedConsumer::new(
            destination.clone(),
            Arc::new(Catalog::new(vec![Stream::new("users")])),
            &config(),
            Arc::new(crate::state::NullCheckpointSink),
        );
        consumer.start().await.unwrap();
        consumer.accept(&record("users", 1), 40).await.unwrap();

        let mut rejected = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Err(e) = consumer.accept(&record("users", 2), 40).await {
                rejected = Some(e);
                break;
            }
        }
        let rejected = rejected.expect("flush failure should stop intake");
        assert_eq!(rejected.phase(), Some(Phase::Flush));

        let err = consumer.close().await.unwrap_err();
        assert!(err.to_string().contains("table locked"));
        assert_eq!(*destination.closed.lock(), Some(false));
    }

    #[tokio::test]
    async fn test_producer_waiting_for_memory_sees_flush_failure() {
        let destination = Arc::new(Collect {
            fail: true,
            ..Collect::default()
        });
        let mut config = config();
        config.memory.max_memory_bytes = 100;
        config.memory.block_size_bytes = 100;
        config.memory.retry_interval = Duration::from_secs(60);
        let consumer = BufferedConsumer::new(
            destination.clone(),
            Arc::new(Catalog::new(vec![Stream::new("users")])),
            &config,
            Arc::new(crate::state::NullCheckpointSink),
        );

        consumer.accept(&record("users", 1), 80).await.unwrap();
        consumer.start().await.unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(3),
            consumer.accept(&record("users", 2), 80),
        )
        .await
        .expect("intake must not stay blocked after a flush failure")
        .unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Flush));
        assert_eq!(consumer.records_accepted(), 1);

        assert!(consumer.close().await.is_err());
        assert_eq!(*destination.closed.lock(), Some(false));
    }

    #[tokio::test]
    async fn test_global_checkpoint_covers_all_streams() {
        let destination = Arc::new(Collect::default());
        let catalog = Arc::new(Catalog::new(vec![Stream::new("users"), Stream::new("orders")]));
        let checkpoints = Arc::new(Mutex::new(Vec::<Checkpoint>::new()));
        let sink = Arc::clone(&checkpoints);
        let consumer = BufferedConsumer::new(
            destination,
            catalog,
            &config(),
            Arc::new(move |c: Checkpoint| sink.lock().push(c)),
        );

        consumer.start().await.unwrap();
        for id in 0..3 {
            consumer.accept(&record("users", id), 10).await.unwrap();
            consumer.accept(&record("orders", id), 10).await.unwrap();
        }
        let global = r#"{"type":"GLOBAL_STATE","data":{"lsn":6}}"#;
        consumer.accept(global, 10).await.unwrap();
        let err = consumer.accept(&state("users", 1), 10).await.unwrap_err();
        assert!(matches!(err, LoadError::Protocol(_)));
        consumer.close().await.unwrap();

        let checkpoints = checkpoints.lock();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].scope, crate::state::StateScope::Global);
        assert_eq!(checkpoints[0].record_count, 6);
        assert_eq!(checkpoints[0].state["lsn"], 6);
    }

    #[tokio::test]
    async fn test_consume_reports_line_number() {
        let consumer = BufferedConsumer::new(
            Arc::new(Collect::default()),
            Arc::new(Catalog::new(vec![Stream::new("users")])),
            &config(),
            Arc::new(crate::state::NullCheckpointSink),
        );
        let input = format!("{}\n\n{{oops\n", record("users", 1));

        let err = consumer.consume(input.as_bytes()).await.unwrap_err();
        assert!(matches!(err, LoadError::Deserialize(ref m) if m.starts_with("input line 3")));
        assert_eq!(consumer.records_accepted(), 1);
    }
}

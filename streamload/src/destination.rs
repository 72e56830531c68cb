//! Destination contracts.
//!
//! Two hook surfaces, one per write path:
//!
//! - [`StandardDestination`] drives the task path. The engine calls
//!   `setup`, then per stream `open_stream`, feeds records to per-shard
//!   [`RecordAccumulator`]s, chains `process_batch` while it returns a
//!   batch, then `close_stream` and finally `teardown`.
//! - [`BufferedDestination`] drives the buffered path: `on_start`, repeated
//!   `flush(stream, records)` chosen by the flush detector, then `on_close`.
//!
//! Hooks return [`DestinationError`]; the engine adds the phase, stream and
//! task before surfacing it.

use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;

use crate::buffer::BufferedRecord;
use crate::error::DestinationError;
use crate::message::Record;
use crate::stream::Stream;

// =============================================================================
// Task path
// =============================================================================

/// An accumulation result that may need more processing.
pub trait Batch: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// True once the batch is durably written and the chain can stop.
    fn is_persisted(&self) -> bool {
        false
    }
}

/// Collects a shard's records into batches.
pub trait RecordAccumulator: Send + 'static {
    type Batch: Batch;

    /// Adds a record, returning a batch when one is ready.
    fn accept(&mut self, record: Record) -> Result<Option<Self::Batch>, DestinationError>;

    /// Forces out whatever is pending. `end_of_stream` is true when the
    /// shard has read its completion marker.
    fn flush(&mut self, end_of_stream: bool) -> Result<Option<Self::Batch>, DestinationError>;
}

/// Destination hooks for the task path.
pub trait StandardDestination: Send + Sync + 'static {
    type Batch: Batch;
    type Accumulator: RecordAccumulator<Batch = Self::Batch>;

    /// Runs once before any stream is opened.
    fn setup(&self) -> impl Future<Output = Result<(), DestinationError>> + Send {
        async { Ok(()) }
    }

    /// Prepares a stream for writes.
    fn open_stream(
        &self,
        stream: &Stream,
    ) -> impl Future<Output = Result<(), DestinationError>> + Send;

    /// Creates the accumulator for one shard of a stream.
    fn record_accumulator(&self, stream: &Stream, shard: usize) -> Self::Accumulator;

    /// Processes a batch, optionally yielding a follow-up batch.
    fn process_batch(
        &self,
        stream: &Stream,
        batch: Self::Batch,
    ) -> impl Future<Output = Result<Option<Self::Batch>, DestinationError>> + Send;

    /// Pairs an upstream checkpoint with a batch.
    ///
    /// Not wired into any path yet; the default keeps it inert.
    fn handle_destination_state(
        &self,
        _state: &Value,
        _batch: &Self::Batch,
    ) -> Option<Self::Batch> {
        None
    }

    /// Finalizes a stream.
    fn close_stream(
        &self,
        stream: &Stream,
        succeeded: bool,
    ) -> impl Future<Output = Result<(), DestinationError>> + Send;

    /// Runs once after every stream is closed, or after a failure.
    fn teardown(
        &self,
        succeeded: bool,
    ) -> impl Future<Output = Result<(), DestinationError>> + Send;
}

// =============================================================================
// Buffered path
// =============================================================================

/// Default size trigger for a stream buffer (10 MiB).
pub const DEFAULT_QUEUE_FLUSH_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

/// Destination hooks for the buffered path.
pub trait BufferedDestination: Send + Sync + 'static {
    /// Runs before any record is accepted.
    fn on_start(&self) -> BoxFuture<'_, Result<(), DestinationError>> {
        Box::pin(async { Ok(()) })
    }

    /// Writes a batch of one stream's records.
    fn flush<'a>(
        &'a self,
        stream: &'a Stream,
        records: &'a [BufferedRecord],
    ) -> BoxFuture<'a, Result<(), DestinationError>>;

    /// Runs after the final drain.
    fn on_close(&self, _succeeded: bool) -> BoxFuture<'_, Result<(), DestinationError>> {
        Box::pin(async { Ok(()) })
    }

    /// Bytes a flush job takes per batch.
    fn optimal_batch_size_bytes(&self) -> u64;

    /// Buffered bytes that trip the size trigger.
    fn queue_flush_threshold_bytes(&self) -> u64 {
        DEFAULT_QUEUE_FLUSH_THRESHOLD_BYTES.max(self.optimal_batch_size_bytes())
    }
}

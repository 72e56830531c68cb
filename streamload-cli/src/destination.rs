//! Built-in destination that counts what it receives.
//!
//! Implements both write paths so the CLI can exercise either engine mode
//! without an external system. Acknowledged checkpoints are printed to
//! stdout as JSON lines; everything else goes through `tracing`.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::{debug, info};

use streamload::buffer::BufferedRecord;
use streamload::destination::{Batch, BufferedDestination, RecordAccumulator, StandardDestination};
use streamload::error::DestinationError;
use streamload::message::Record;
use streamload::state::{Checkpoint, StateScope};
use streamload::stream::Stream;

/// Records per batch on the task path.
pub const DEFAULT_BATCH_RECORDS: usize = 1000;

/// Bytes per flush on the buffered path (1 MiB).
pub const DEFAULT_FLUSH_BYTES: u64 = 1024 * 1024;

/// Per-stream totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamTotals {
    pub records: u64,
    pub bytes: u64,
    pub batches: u64,
}

/// Counts records per stream and logs each hook.
#[derive(Debug)]
pub struct LogDestination {
    batch_records: usize,
    totals: Mutex<BTreeMap<Stream, StreamTotals>>,
    closed: Mutex<BTreeMap<Stream, bool>>,
    torn_down: Mutex<Option<bool>>,
}

impl LogDestination {
    pub fn new(batch_records: usize) -> Self {
        Self {
            batch_records: batch_records.max(1),
            totals: Mutex::new(BTreeMap::new()),
            closed: Mutex::new(BTreeMap::new()),
            torn_down: Mutex::new(None),
        }
    }

    /// Totals per stream, in stream order.
    pub fn totals(&self) -> BTreeMap<Stream, StreamTotals> {
        self.totals.lock().clone()
    }

    /// `succeeded` flag of each closed stream.
    pub fn close_outcomes(&self) -> BTreeMap<Stream, bool> {
        self.closed.lock().clone()
    }

    /// `succeeded` flag passed to teardown, if it ran.
    pub fn teardown_outcome(&self) -> Option<bool> {
        *self.torn_down.lock()
    }

    /// Renders the end-of-run summary.
    pub fn summary(&self) -> String {
        let totals = self.totals.lock();
        let closed = self.closed.lock();
        let mut out = String::new();
        for (stream, t) in totals.iter() {
            let status = match closed.get(stream) {
                Some(true) => "ok",
                Some(false) => "failed",
                None => "open",
            };
            out.push_str(&format!(
                "{:<32} {:>10} records {:>12} bytes {:>6} batches  {}\n",
                stream.to_string(),
                t.records,
                t.bytes,
                t.batches,
                status
            ));
        }
        let records: u64 = totals.values().map(|t| t.records).sum();
        out.push_str(&format!("{} streams, {} records\n", totals.len(), records));
        out
    }

    fn record_batch(&self, stream: &Stream, records: u64, bytes: u64) {
        let mut totals = self.totals.lock();
        let entry = totals.entry(stream.clone()).or_default();
        entry.records += records;
        entry.bytes += bytes;
        entry.batches += 1;
    }
}

/// Renders an acknowledged checkpoint in the input envelope format, with
/// the covered record count attached.
pub fn checkpoint_line(checkpoint: Checkpoint) -> Value {
    match checkpoint.scope {
        StateScope::Stream(stream) => json!({
            "type": "STATE",
            "stream": stream.name(),
            "namespace": stream.namespace(),
            "data": checkpoint.state,
            "records": checkpoint.record_count,
        }),
        StateScope::Global => json!({
            "type": "GLOBAL_STATE",
            "data": checkpoint.state,
            "records": checkpoint.record_count,
        }),
    }
}

/// Prints an acknowledged checkpoint as a JSON line on stdout.
pub fn print_checkpoint(checkpoint: Checkpoint) {
    let line = checkpoint_line(checkpoint);
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{}", line) {
        debug!(error = %e, "Failed to print checkpoint");
    }
}

// =============================================================================
// Task path
// =============================================================================

/// Records collected by one accumulator.
#[derive(Debug)]
pub struct CountedBatch {
    records: u64,
    bytes: u64,
}

impl Batch for CountedBatch {
    fn name(&self) -> &str {
        "counted"
    }
}

/// Emits a batch every `limit` records.
#[derive(Debug)]
pub struct CountingAccumulator {
    limit: usize,
    pending: u64,
    bytes: u64,
}

impl CountingAccumulator {
    fn take(&mut self) -> Option<CountedBatch> {
        if self.pending == 0 {
            return None;
        }
        let batch = CountedBatch {
            records: self.pending,
            bytes: self.bytes,
        };
        self.pending = 0;
        self.bytes = 0;
        Some(batch)
    }
}

impl RecordAccumulator for CountingAccumulator {
    type Batch = CountedBatch;

    fn accept(&mut self, record: Record) -> Result<Option<CountedBatch>, DestinationError> {
        self.pending += 1;
        self.bytes += record.size_bytes;
        if self.pending as usize >= self.limit {
            return Ok(self.take());
        }
        Ok(None)
    }

    fn flush(&mut self, _end_of_stream: bool) -> Result<Option<CountedBatch>, DestinationError> {
        Ok(self.take())
    }
}

impl StandardDestination for LogDestination {
    type Batch = CountedBatch;
    type Accumulator = CountingAccumulator;

    async fn setup(&self) -> Result<(), DestinationError> {
        info!(batch_records = self.batch_records, "Log destination setup");
        Ok(())
    }

    async fn open_stream(&self, stream: &Stream) -> Result<(), DestinationError> {
        self.totals.lock().entry(stream.clone()).or_default();
        info!(stream = %stream, "Stream opened");
        Ok(())
    }

    fn record_accumulator(&self, _stream: &Stream, _shard: usize) -> CountingAccumulator {
        CountingAccumulator {
            limit: self.batch_records,
            pending: 0,
            bytes: 0,
        }
    }

    async fn process_batch(
        &self,
        stream: &Stream,
        batch: CountedBatch,
    ) -> Result<Option<CountedBatch>, DestinationError> {
        debug!(stream = %stream, records = batch.records, bytes = batch.bytes, "Batch processed");
        self.record_batch(stream, batch.records, batch.bytes);
        Ok(None)
    }

    async fn close_stream(&self, stream: &Stream, succeeded: bool) -> Result<(), DestinationError> {
        self.closed.lock().insert(stream.clone(), succeeded);
        info!(stream = %stream, succeeded, "Stream closed");
        Ok(())
    }

    async fn teardown(&self, succeeded: bool) -> Result<(), DestinationError> {
        *self.torn_down.lock() = Some(succeeded);
        info!(succeeded, "Log destination teardown");
        Ok(())
    }
}

// =============================================================================
// Buffered path
// =============================================================================

impl BufferedDestination for LogDestination {
    fn on_start(&self) -> BoxFuture<'_, Result<(), DestinationError>> {
        Box::pin(async move {
            info!("Log destination started");
            Ok(())
        })
    }

    fn flush<'a>(
        &'a self,
        stream: &'a Stream,
        records: &'a [BufferedRecord],
    ) -> BoxFuture<'a, Result<(), DestinationError>> {
        Box::pin(async move {
            let bytes: u64 = records.iter().map(|r| r.size_bytes).sum();
            debug!(stream = %stream, records = records.len(), bytes, "Flushed");
            self.record_batch(stream, records.len() as u64, bytes);
            Ok(())
        })
    }

    fn on_close(&self, succeeded: bool) -> BoxFuture<'_, Result<(), DestinationError>> {
        Box::pin(async move {
            let streams: Vec<Stream> = self.totals.lock().keys().cloned().collect();
            let mut closed = self.closed.lock();
            for stream in streams {
                closed.insert(stream, succeeded);
            }
            *self.torn_down.lock() = Some(succeeded);
            info!(succeeded, "Log destination closed");
            Ok(())
        })
    }

    fn optimal_batch_size_bytes(&self) -> u64 {
        DEFAULT_FLUSH_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(size: u64) -> Record {
        Record {
            stream: Stream::new("users"),
            index: 0,
            size_bytes: size,
            data: json!({}),
            emitted_at: None,
        }
    }

    #[test]
    fn test_accumulator_emits_every_limit_records() {
        let destination = LogDestination::new(3);
        let mut acc = destination.record_accumulator(&Stream::new("users"), 0);

        assert!(acc.accept(record(10)).unwrap().is_none());
        assert!(acc.accept(record(10)).unwrap().is_none());
        let batch = acc.accept(record(10)).unwrap().unwrap();
        assert_eq!((batch.records, batch.bytes), (3, 30));

        assert!(acc.flush(true).unwrap().is_none());
        acc.accept(record(5)).unwrap();
        let rest = acc.flush(true).unwrap().unwrap();
        assert_eq!((rest.records, rest.bytes), (1, 5));
    }

    #[tokio::test]
    async fn test_summary_lists_streams_and_status() {
        let destination = LogDestination::new(10);
        let users = Stream::new("users");
        StandardDestination::open_stream(&destination, &users).await.unwrap();
        destination
            .process_batch(&users, CountedBatch { records: 4, bytes: 100 })
            .await
            .unwrap();
        StandardDestination::close_stream(&destination, &users, true)
            .await
            .unwrap();

        assert_eq!(
            destination.totals()[&users],
            StreamTotals {
                records: 4,
                bytes: 100,
                batches: 1
            }
        );
        let summary = destination.summary();
        assert!(summary.contains("users"));
        assert!(summary.contains("ok"));
        assert!(summary.ends_with("1 streams, 4 records\n"));
    }

    #[test]
    fn test_checkpoint_lines() {
        let per_stream = checkpoint_line(Checkpoint {
            scope: StateScope::Stream(Stream::with_namespace("public", "users")),
            state: json!({"cursor": 3}),
            record_count: 3,
        });
        assert_eq!(per_stream["type"], "STATE");
        assert_eq!(per_stream["stream"], "users");
        assert_eq!(per_stream["namespace"], "public");
        assert_eq!(per_stream["records"], 3);

        let global = checkpoint_line(Checkpoint {
            scope: StateScope::Global,
            state: json!({"lsn": 9}),
            record_count: 12,
        });
        assert_eq!(global["type"], "GLOBAL_STATE");
        assert_eq!(global["data"]["lsn"], 9);
        assert!(global.get("stream").is_none());
    }
}

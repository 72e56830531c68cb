//! Lifecycle tasks.
//!
//! Each task calls one destination hook and returns the next step of the
//! graph. The per-stream `work:<stream>` counter is held once by every live
//! accumulator replica and once by every batch chain; the close gate opens
//! when it drops back to zero after the stream's input is consumed.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::context::{LifecycleContext, StreamState};
use crate::destination::{Batch, RecordAccumulator, StandardDestination};
use crate::error::{LoadError, Phase};
use crate::message::Message;
use crate::scheduler::{Concurrency, ScheduledTask, Task, TaskResult};
use crate::stream::Stream;

pub(crate) const SETUP: &str = "setup";
pub(crate) const OPEN_STREAM: &str = "open_stream";
pub(crate) const ACCUMULATE_RECORDS: &str = "accumulate_records";
pub(crate) const PROCESS_BATCH: &str = "process_batch";
pub(crate) const CLOSE_STREAM: &str = "close_stream";
pub(crate) const TEARDOWN: &str = "teardown";

type Ctx<D> = Arc<LifecycleContext<D>>;

fn work_counter(stream: &Stream) -> String {
    format!("work:{}", stream)
}

/// Entry point of the graph.
pub(crate) fn setup<D: StandardDestination>(ctx: &Ctx<D>) -> ScheduledTask {
    ScheduledTask::plain(SetupTask {
        ctx: Arc::clone(ctx),
    })
}

/// Releases one hold on the work counter and offers the close gate.
fn finish_work<D: StandardDestination>(ctx: &Ctx<D>, stream: &Stream) -> ScheduledTask {
    let ctx = Arc::clone(ctx);
    let stream = stream.clone();
    ScheduledTask::decrement(work_counter(&stream), move || close_gate(&ctx, &stream))
}

/// Closes the stream once its input is consumed and no work holds it.
fn close_gate<D: StandardDestination>(ctx: &Ctx<D>, stream: &Stream) -> ScheduledTask {
    let ctx = Arc::clone(ctx);
    let stream = stream.clone();
    ScheduledTask::once_only(format!("close:{}", stream), move || {
        let gate = stream.clone();
        ScheduledTask::gate_on_stream_complete(gate, move || {
            ScheduledTask::gate_on_counter_zero(work_counter(&stream), move || {
                ScheduledTask::plain(CloseStreamTask {
                    limits: Concurrency::unbounded(CLOSE_STREAM),
                    ctx,
                    stream,
                })
            })
        })
    })
}

fn teardown<D: StandardDestination>(ctx: &Ctx<D>) -> ScheduledTask {
    let ctx = Arc::clone(ctx);
    ScheduledTask::once_only(TEARDOWN, move || ScheduledTask::plain(TeardownTask { ctx }))
}

fn process_batch<D: StandardDestination>(
    ctx: &Ctx<D>,
    stream: &Stream,
    batch: D::Batch,
) -> ScheduledTask {
    ScheduledTask::plain(ProcessBatchTask {
        limits: Concurrency::new(
            PROCESS_BATCH,
            ctx.settings.process_batch_concurrency,
            ctx.settings.process_batch_per_stream,
        ),
        ctx: Arc::clone(ctx),
        stream: stream.clone(),
        batch: Mutex::new(Some(batch)),
    })
}

// =============================================================================
// Setup
// =============================================================================

struct SetupTask<D: StandardDestination> {
    ctx: Ctx<D>,
}

impl<D: StandardDestination> Task for SetupTask<D> {
    fn name(&self) -> &str {
        SETUP
    }

    fn execute(&self) -> BoxFuture<'_, TaskResult> {
        Box::pin(async move {
            info!(streams = self.ctx.catalog.len(), "Setting up destination");
            self.ctx
                .destination
                .setup()
                .await
                .map_err(|e| LoadError::destination(Phase::Setup, None, Some(SETUP), e))?;

            if self.ctx.catalog.is_empty() {
                return Ok(teardown(&self.ctx));
            }

            let ctx = Arc::clone(&self.ctx);
            Ok(ScheduledTask::fan_out_per_stream(move |stream: &Stream| {
                ScheduledTask::plain(OpenStreamTask {
                    limits: Concurrency::new(OPEN_STREAM, ctx.settings.open_stream_concurrency, 1),
                    ctx: Arc::clone(&ctx),
                    stream: stream.clone(),
                })
            }))
        })
    }
}

// =============================================================================
// Open
// =============================================================================

struct OpenStreamTask<D: StandardDestination> {
    limits: Concurrency,
    ctx: Ctx<D>,
    stream: Stream,
}

impl<D: StandardDestination> Task for OpenStreamTask<D> {
    fn name(&self) -> &str {
        OPEN_STREAM
    }

    fn concurrency(&self) -> Option<&Concurrency> {
        Some(&self.limits)
    }

    fn stream(&self) -> Option<&Stream> {
        Some(&self.stream)
    }

    fn execute(&self) -> BoxFuture<'_, TaskResult> {
        Box::pin(async move {
            let stream = &self.stream;
            self.ctx.destination.open_stream(stream).await.map_err(|e| {
                LoadError::destination(Phase::OpenStream, Some(stream), Some(OPEN_STREAM), e)
            })?;
            self.ctx.mark_opened(stream);
            info!(stream = %stream, shards = self.ctx.shards, "Stream opened");

            let ctx = Arc::clone(&self.ctx);
            let stream = stream.clone();
            Ok(ScheduledTask::replicate(self.ctx.shards, move |shard| {
                let accumulator = ctx.destination.record_accumulator(&stream, shard);
                let task = AccumulateRecordsTask {
                    limits: Concurrency::new(
                        ACCUMULATE_RECORDS,
                        ctx.settings.accumulate_concurrency,
                        0,
                    ),
                    ctx: Arc::clone(&ctx),
                    stream: stream.clone(),
                    shard,
                    accumulator: Mutex::new(accumulator),
                    finished: AtomicBool::new(false),
                };
                ScheduledTask::increment(work_counter(&stream), move || {
                    ScheduledTask::plain(task)
                })
            }))
        })
    }
}

// =============================================================================
// Accumulate
// =============================================================================

/// Reads one shard into its accumulator.
///
/// Each execution reads one chunk. It stops early when the accumulator hands
/// back a batch, and for good once the shard's completion marker is read.
struct AccumulateRecordsTask<D: StandardDestination> {
    limits: Concurrency,
    ctx: Ctx<D>,
    stream: Stream,
    shard: usize,
    accumulator: Mutex<D::Accumulator>,
    finished: AtomicBool,
}

impl<D: StandardDestination> AccumulateRecordsTask<D> {
    fn accumulate_error(&self, e: crate::error::DestinationError) -> LoadError {
        LoadError::destination(
            Phase::Accumulate,
            Some(&self.stream),
            Some(ACCUMULATE_RECORDS),
            e,
        )
    }
}

impl<D: StandardDestination> Task for AccumulateRecordsTask<D> {
    fn name(&self) -> &str {
        ACCUMULATE_RECORDS
    }

    fn concurrency(&self) -> Option<&Concurrency> {
        Some(&self.limits)
    }

    fn stream(&self) -> Option<&Stream> {
        Some(&self.stream)
    }

    fn consumes_stream(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }

    fn execute(&self) -> BoxFuture<'_, TaskResult> {
        Box::pin(async move {
            if self.finished.load(Ordering::SeqCst) {
                return Ok(ScheduledTask::Noop);
            }

            let mut reader = self.ctx.messages.open(&self.stream, self.shard)?;
            while let Some(message) = reader.next().await {
                match message {
                    Message::Record(record) => {
                        self.ctx.set_state(&self.stream, StreamState::Accumulating);
                        self.ctx.record_accumulated();
                        let accepted = self.accumulator.lock().accept(record);
                        if let Some(batch) = accepted.map_err(|e| self.accumulate_error(e))? {
                            debug!(
                                stream = %self.stream,
                                shard = self.shard,
                                batch = batch.name(),
                                "Batch ready"
                            );
                            let ctx = Arc::clone(&self.ctx);
                            let stream = self.stream.clone();
                            let counter = work_counter(&stream);
                            return Ok(ScheduledTask::increment(counter, move || {
                                process_batch(&ctx, &stream, batch)
                            }));
                        }
                    }
                    Message::EndOfStream => {
                        self.finished.store(true, Ordering::SeqCst);
                        let flushed = self.accumulator.lock().flush(true);
                        debug!(stream = %self.stream, shard = self.shard, "Shard input consumed");
                        // The final batch inherits this replica's hold on the work counter.
                        return Ok(match flushed.map_err(|e| self.accumulate_error(e))? {
                            Some(batch) => process_batch(&self.ctx, &self.stream, batch),
                            None => finish_work(&self.ctx, &self.stream),
                        });
                    }
                    Message::Timeout => break,
                }
            }
            Ok(ScheduledTask::Noop)
        })
    }
}

// =============================================================================
// Process
// =============================================================================

/// Processes a batch, chaining while the destination returns a follow-up.
struct ProcessBatchTask<D: StandardDestination> {
    limits: Concurrency,
    ctx: Ctx<D>,
    stream: Stream,
    batch: Mutex<Option<D::Batch>>,
}

impl<D: StandardDestination> Task for ProcessBatchTask<D> {
    fn name(&self) -> &str {
        PROCESS_BATCH
    }

    fn concurrency(&self) -> Option<&Concurrency> {
        Some(&self.limits)
    }

    fn stream(&self) -> Option<&Stream> {
        Some(&self.stream)
    }

    fn execute(&self) -> BoxFuture<'_, TaskResult> {
        Box::pin(async move {
            let taken = self.batch.lock().take();
            let Some(batch) = taken else {
                return Ok(finish_work(&self.ctx, &self.stream));
            };

            self.ctx
                .set_state(&self.stream, StreamState::ProcessingBatch);
            let name = batch.name().to_string();
            let next = self
                .ctx
                .destination
                .process_batch(&self.stream, batch)
                .await
                .map_err(|e| {
                    LoadError::destination(
                        Phase::ProcessBatch,
                        Some(&self.stream),
                        Some(PROCESS_BATCH),
                        e,
                    )
                })?;

            match next {
                Some(next) if !next.is_persisted() => {
                    debug!(stream = %self.stream, from = %name, to = next.name(), "Batch chained");
                    Ok(process_batch(&self.ctx, &self.stream, next))
                }
                _ => {
                    debug!(stream = %self.stream, batch = %name, "Batch chain complete");
                    self.ctx.set_state(&self.stream, StreamState::Accumulating);
                    Ok(finish_work(&self.ctx, &self.stream))
                }
            }
        })
    }
}

// =============================================================================
// Close and teardown
// =============================================================================

struct CloseStreamTask<D: StandardDestination> {
    limits: Concurrency,
    ctx: Ctx<D>,
    stream: Stream,
}

impl<D: StandardDestination> Task for CloseStreamTask<D> {
    fn name(&self) -> &str {
        CLOSE_STREAM
    }

    fn concurrency(&self) -> Option<&Concurrency> {
        Some(&self.limits)
    }

    fn stream(&self) -> Option<&Stream> {
        Some(&self.stream)
    }

    fn execute(&self) -> BoxFuture<'_, TaskResult> {
        Box::pin(async move {
            let stream = &self.stream;
            if !self.ctx.claim_close(stream) {
                return Ok(ScheduledTask::Noop);
            }

            while !self.ctx.messages.is_stream_complete(stream) {
                tokio::time::sleep(self.ctx.settings.poll_interval).await;
            }

            self.ctx.set_state(stream, StreamState::Closing);
            self.ctx
                .destination
                .close_stream(stream, true)
                .await
                .map_err(|e| {
                    LoadError::destination(Phase::CloseStream, Some(stream), Some(CLOSE_STREAM), e)
                })?;
            self.ctx.mark_closed(stream);
            info!(
                stream = %stream,
                remaining = self.ctx.pending_close_count(),
                "Stream closed"
            );

            Ok(teardown(&self.ctx))
        })
    }
}

struct TeardownTask<D: StandardDestination> {
    ctx: Ctx<D>,
}

impl<D: StandardDestination> Task for TeardownTask<D> {
    fn name(&self) -> &str {
        TEARDOWN
    }

    fn execute(&self) -> BoxFuture<'_, TaskResult> {
        Box::pin(async move {
            if !self.ctx.claim_teardown() {
                return Ok(ScheduledTask::Noop);
            }

            while self.ctx.pending_close_count() > 0 {
                tokio::time::sleep(self.ctx.settings.poll_interval).await;
            }

            self.ctx
                .destination
                .teardown(true)
                .await
                .map_err(|e| LoadError::destination(Phase::Teardown, None, Some(TEARDOWN), e))?;
            self.ctx.mark_teardown_done();
            info!(
                records = self.ctx.records_accumulated(),
                "Destination torn down"
            );
            Ok(ScheduledTask::Terminate)
        })
    }
}

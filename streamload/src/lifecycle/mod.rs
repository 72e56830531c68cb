//! Destination lifecycle on top of the task scheduler.
//!
//! ```text
//! Setup
//!   └─► FanOutPerStream ─► OpenStream(s)                       [open_stream: N per sync, 1 per stream]
//!         └─► Replicate(shards) ─► +work(s) ─► AccumulateRecords(s, shard)
//!               │   re-run per chunk until the shard reads its marker
//!               ├─ batch ─► +work(s) ─► ProcessBatch(s) ─► ProcessBatch ... ─► -work(s)
//!               └─ marker ─► flush(eos) ─► [ProcessBatch chain] ─► -work(s)
//!                                                                    │
//!   OnceOnly(close:s) ◄──────────────────────────────────────────────┘
//!     └─► GateOnStreamComplete(s) ─► GateOnCounterZero(work:s) ─► CloseStream(s)
//!           └─► OnceOnly(teardown) ─► Teardown (waits for every close) ─► Terminate
//! ```
//!
//! Any hook failure stops the scheduler; [`DestinationRunner::run`] then
//! closes the streams that were opened with `succeeded = false`, tears the
//! destination down the same way, and returns the original error. Input that
//! fails beside the run reports through [`DestinationRunner::abort_signal`]
//! and takes the same path.

mod context;
mod tasks;

pub use context::StreamState;

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::destination::StandardDestination;
use crate::error::LoadError;
use crate::message::MessageQueue;
use crate::scheduler::{
    AbortSignal, NullTelemetrySink, RunStats, RunnerConfig, TaskRunner, TelemetrySink, WorkQueue,
};
use crate::stream::{Catalog, Stream};

use context::LifecycleContext;

/// Drives a [`StandardDestination`] through its lifecycle for every stream
/// in the catalog.
pub struct DestinationRunner<D: StandardDestination> {
    ctx: Arc<LifecycleContext<D>>,
    runner_config: RunnerConfig,
    telemetry: Arc<dyn TelemetrySink>,
    abort: AbortSignal,
}

impl<D: StandardDestination> DestinationRunner<D> {
    pub fn new(
        destination: Arc<D>,
        catalog: Arc<Catalog>,
        messages: Arc<MessageQueue>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(LifecycleContext::new(
                destination,
                catalog,
                messages,
                config.scheduler.clone(),
            )),
            runner_config: RunnerConfig::from(&config.scheduler),
            telemetry: Arc::new(NullTelemetrySink),
            abort: AbortSignal::new(),
        }
    }

    /// Replaces the scheduler telemetry sink.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Handle that fails this run from outside, e.g. when input breaks.
    ///
    /// Aborting before end-of-input is published keeps every stream from
    /// closing successfully.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Lifecycle state of a catalog stream.
    pub fn stream_state(&self, stream: &Stream) -> Option<StreamState> {
        self.ctx.state(stream)
    }

    /// Records handed to accumulators so far.
    pub fn records_accumulated(&self) -> u64 {
        self.ctx.records_accumulated()
    }

    /// Runs the lifecycle to completion. Call once per runner.
    pub async fn run(&self) -> Result<RunStats, LoadError> {
        let queue = Arc::new(WorkQueue::new());
        queue.enqueue(tasks::setup(&self.ctx));

        let runner = TaskRunner::new(
            self.runner_config.clone(),
            Arc::clone(&self.ctx.catalog),
            Arc::clone(&self.ctx.messages),
            queue,
        )
        .with_telemetry(Arc::clone(&self.telemetry))
        .with_abort(self.abort.clone());

        match runner.run().await {
            Ok(stats) => {
                info!(
                    streams = self.ctx.catalog.len(),
                    records = self.ctx.records_accumulated(),
                    "Destination run complete"
                );
                Ok(stats)
            }
            Err(err) => {
                self.clean_up_after_failure(&err).await;
                Err(err)
            }
        }
    }

    /// Best-effort close and teardown with `succeeded = false`.
    ///
    /// Hook errors here are logged; the run's original error wins.
    async fn clean_up_after_failure(&self, err: &LoadError) {
        warn!(error = %err, "Destination run failed, cleaning up");

        for stream in self.ctx.open_streams() {
            self.ctx.set_state(&stream, StreamState::Closing);
            match self.ctx.destination.close_stream(&stream, false).await {
                Ok(()) => self.ctx.mark_closed(&stream),
                Err(e) => warn!(stream = %stream, error = %e, "close_stream failed during cleanup"),
            }
        }

        if !self.ctx.is_teardown_done() {
            match self.ctx.destination.teardown(false).await {
                Ok(()) => self.ctx.mark_teardown_done(),
                Err(e) => warn!(error = %e, "teardown failed during cleanup"),
            }
        }
    }
}

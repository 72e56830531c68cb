//! Flush supervisor and jobs.
//!
//! ```text
//!   supervisor tick ──► allocatable = pool.available()
//!        │                 while allocatable > 0:
//!        │                   stream = detector.next_stream_to_flush(threshold)?
//!        │                   spawn flush job(stream)
//!        ▼
//!   flush job: take(optimal) ─► register size ─► destination.flush ─► release ─► flush_states
//! ```
//!
//! Jobs report failures into the shared [`FlushFailure`] slot; the consumer
//! checks it before accepting more input.

use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::StreamBuffers;
use crate::config::FlushSettings;
use crate::destination::BufferedDestination;
use crate::error::{LoadError, Phase};
use crate::state::{CheckpointSink, StateManager};
use crate::stream::Stream;

use super::detector::FlushDetector;
use super::failure::FlushFailure;
use super::pool::{FlushSlot, WorkerPool};
use super::running::{RunningFlushWorkers, WorkerId};

/// Poll step while waiting for buffers to drain on close.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Shared {
    buffers: Arc<StreamBuffers>,
    states: Arc<StateManager>,
    destination: Arc<dyn BufferedDestination>,
    checkpoints: Arc<dyn CheckpointSink>,
    failure: Arc<FlushFailure>,
    detector: FlushDetector,
    running: Arc<RunningFlushWorkers>,
    pool: WorkerPool,
    optimal_batch_size_bytes: u64,
}

/// Supervisor plus the pool of flush jobs it submits.
pub struct FlushWorkers {
    shared: Arc<Shared>,
    settings: FlushSettings,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl FlushWorkers {
    pub fn new(
        buffers: Arc<StreamBuffers>,
        states: Arc<StateManager>,
        destination: Arc<dyn BufferedDestination>,
        checkpoints: Arc<dyn CheckpointSink>,
        failure: Arc<FlushFailure>,
        settings: &FlushSettings,
    ) -> Self {
        let running = Arc::new(RunningFlushWorkers::new());
        let optimal_batch_size_bytes = destination.optimal_batch_size_bytes();
        let detector = FlushDetector::new(
            Arc::clone(&buffers),
            Arc::clone(&running),
            settings,
            optimal_batch_size_bytes,
            destination.queue_flush_threshold_bytes(),
        );

        Self {
            shared: Arc::new(Shared {
                buffers,
                states,
                destination,
                checkpoints,
                failure,
                detector,
                running,
                pool: WorkerPool::new(settings.max_flush_workers),
                optimal_batch_size_bytes,
            }),
            settings: settings.clone(),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    /// Starts the supervisor tick. Idempotent.
    pub fn start(&self) {
        let mut slot = self.supervisor.lock();
        if slot.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        let period = self.settings.supervisor_interval;
        info!(
            workers = shared.pool.capacity(),
            interval_ms = period.as_millis() as u64,
            "Flush supervisor started"
        );

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => Shared::retrieve_work(&shared),
                }
            }
            debug!("Flush supervisor stopped");
        }));
    }

    /// Drains every buffer, acknowledges remaining checkpoints and stops.
    ///
    /// Returns the first flush failure, or a timeout if the drain exceeds the
    /// configured bound.
    pub async fn close(&self) -> Result<(), LoadError> {
        info!("Closing flush workers, draining buffers");
        self.shared.detector.set_closing(true);

        let started = Instant::now();
        let mut last_progress = Instant::now();
        let drained = loop {
            if self.shared.failure.is_failed() {
                warn!("Flush failure recorded, abandoning drain");
                break Ok(());
            }
            let remaining = self.shared.buffers.total_queued_records();
            if remaining == 0 {
                break Ok(());
            }
            if started.elapsed() >= self.settings.shutdown_timeout {
                break Err(LoadError::ShutdownTimeout(self.settings.shutdown_timeout));
            }
            if last_progress.elapsed() >= self.settings.shutdown_progress_interval {
                info!(
                    remaining_records = remaining,
                    remaining_bytes = self.shared.buffers.total_queued_bytes(),
                    running_workers = self.shared.running.running_count(),
                    "Waiting for buffers to drain"
                );
                last_progress = Instant::now();
            }

            Shared::retrieve_work(&self.shared);
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        };

        let remaining = self
            .settings
            .shutdown_timeout
            .saturating_sub(started.elapsed());
        let idle = self.shared.pool.wait_idle(remaining).await;

        self.shutdown.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                warn!(error = %e, "Flush supervisor ended abnormally");
            }
        }

        if !idle {
            warn!(
                running_workers = self.shared.running.running_count(),
                "Flush jobs still running at shutdown deadline"
            );
        }

        let acknowledged = self
            .shared
            .states
            .flush_states(self.shared.checkpoints.as_ref());
        info!(
            checkpoints = acknowledged,
            peak_workers = self.shared.pool.high_water(),
            "Flush workers closed"
        );

        self.shared.failure.check()?;
        drained?;
        if !idle {
            return Err(LoadError::ShutdownTimeout(self.settings.shutdown_timeout));
        }
        Ok(())
    }

    /// Runs one supervisor pass immediately.
    pub fn tick(&self) {
        Shared::retrieve_work(&self.shared);
    }

    /// Flush jobs currently running.
    pub fn running_count(&self) -> usize {
        self.shared.running.running_count()
    }

    /// Highest number of concurrent flush jobs observed.
    pub fn peak_workers(&self) -> usize {
        self.shared.pool.high_water()
    }
}

impl Shared {
    /// One supervisor pass: submit jobs while capacity and candidates remain.
    fn retrieve_work(this: &Arc<Self>) {
        if this.failure.is_failed() {
            return;
        }

        let mut allocatable = this.pool.available();
        while allocatable > 0 {
            let threshold = this.detector.compute_threshold_bytes();
            let Some(stream) = this.detector.next_stream_to_flush(threshold) else {
                break;
            };
            let Some(permit) = this.pool.try_acquire() else {
                break;
            };
            let worker = this.running.track(&stream);
            debug!(stream = %stream, threshold, "Submitting flush job");

            let shared = Arc::clone(this);
            tokio::spawn(async move { shared.run_job(stream, worker, permit).await });
            allocatable -= 1;
        }
    }

    async fn run_job(self: Arc<Self>, stream: Stream, worker: WorkerId, _permit: FlushSlot) {
        let outcome = AssertUnwindSafe(self.flush_stream(&stream, worker))
            .catch_unwind()
            .await;
        self.running.complete(&stream, worker);

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(LoadError::Flush {
                stream: stream.clone(),
                reason: "flush job panicked".to_string(),
            }),
        };
        if let Err(err) = result {
            error!(stream = %stream, error = %err, "Flush job failed");
            self.failure.propagate(err);
        }
    }

    async fn flush_stream(&self, stream: &Stream, worker: WorkerId) -> Result<(), LoadError> {
        let Some(batch) = self.buffers.take(stream, self.optimal_batch_size_bytes) else {
            debug!(stream = %stream, "Nothing to flush");
            return Ok(());
        };
        self.running
            .register_batch_size(stream, worker, batch.size_bytes());

        let started = Instant::now();
        self.destination
            .flush(stream, batch.records())
            .await
            .map_err(|e| LoadError::destination(Phase::Flush, Some(stream), Some("flush"), e))?;

        info!(
            stream = %stream,
            records = batch.len(),
            bytes = batch.size_bytes(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Flushed batch"
        );
        batch.release();
        self.states.flush_states(self.checkpoints.as_ref());
        Ok(())
    }
}

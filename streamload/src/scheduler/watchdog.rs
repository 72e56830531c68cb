//! Stall detection for the dispatch loop.
//!
//! The runner and the watchdog share a [`LoopHeartbeat`]. Each loop iteration
//! touches the heartbeat and publishes how many tasks are queued or in flight.
//! A loop that has pending tasks but has not touched the heartbeat within the
//! threshold is reported as stalled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default stall detection threshold (30 seconds).
pub const STALL_DETECTION_THRESHOLD_MS: u64 = 30_000;

/// Default watchdog check interval (10 seconds).
pub const STALL_WATCHDOG_INTERVAL_SECS: u64 = 10;

/// Liveness data published by the dispatch loop.
#[derive(Debug)]
pub struct LoopHeartbeat {
    origin: Instant,
    /// Milliseconds after `origin` of the last loop iteration
    touched_at_ms: AtomicU64,
    pending_tasks: AtomicU64,
}

impl LoopHeartbeat {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            touched_at_ms: AtomicU64::new(0),
            pending_tasks: AtomicU64::new(0),
        }
    }

    /// Records that the loop made an iteration.
    pub fn touch(&self) {
        self.touched_at_ms.store(self.offset_ms(), Ordering::Relaxed);
    }

    /// Publishes queued plus in-flight tasks.
    pub fn set_pending(&self, tasks: usize) {
        self.pending_tasks.store(tasks as u64, Ordering::Relaxed);
    }

    pub fn pending(&self) -> u64 {
        self.pending_tasks.load(Ordering::Relaxed)
    }

    /// Time since the last iteration.
    pub fn quiet_for(&self) -> Duration {
        let touched = self.touched_at_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.offset_ms().saturating_sub(touched))
    }

    fn offset_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for LoopHeartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Health of the dispatch loop at one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopHealth {
    Healthy,
    Idle,
    Stalled,
}

/// Periodically classifies a [`LoopHeartbeat`] and warns on stalls.
pub struct StallWatchdog {
    heartbeat: Arc<LoopHeartbeat>,
    threshold: Duration,
    period: Duration,
}

impl StallWatchdog {
    pub fn new(heartbeat: Arc<LoopHeartbeat>) -> Self {
        Self {
            heartbeat,
            threshold: Duration::from_millis(STALL_DETECTION_THRESHOLD_MS),
            period: Duration::from_secs(STALL_WATCHDOG_INTERVAL_SECS),
        }
    }

    /// Overrides the threshold and check period.
    pub fn with_timing(mut self, threshold: Duration, period: Duration) -> Self {
        self.threshold = threshold;
        self.period = period;
        self
    }

    /// Checks every period until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticks = tokio::time::interval(self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while shutdown
            .run_until_cancelled(ticks.tick())
            .await
            .is_some()
        {
            self.check();
        }
    }

    fn check(&self) -> LoopHealth {
        let quiet = self.heartbeat.quiet_for();
        let pending = self.heartbeat.pending();
        let health = classify(quiet, self.threshold, pending);

        match health {
            LoopHealth::Stalled => warn!(
                quiet_ms = quiet.as_millis() as u64,
                pending_tasks = pending,
                threshold_ms = self.threshold.as_millis() as u64,
                "Dispatch loop stalled with {} pending tasks",
                pending
            ),
            LoopHealth::Idle => debug!(quiet_ms = quiet.as_millis() as u64, "Dispatch loop idle"),
            LoopHealth::Healthy => debug!(pending_tasks = pending, "Dispatch loop healthy"),
        }
        health
    }
}

fn classify(quiet: Duration, threshold: Duration, pending: u64) -> LoopHealth {
    if quiet <= threshold {
        LoopHealth::Healthy
    } else if pending == 0 {
        LoopHealth::Idle
    } else {
        LoopHealth::Stalled
    }
}

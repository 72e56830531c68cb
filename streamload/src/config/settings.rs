//! Engine settings, grouped by component.
//!
//! Defaults live in [`super::defaults`]; INI loading in [`super::file`].

use std::time::Duration;

use crate::error::LoadError;

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Task scheduler and lifecycle concurrency
    pub scheduler: SchedulerSettings,
    /// Global buffer budget
    pub memory: MemorySettings,
    /// Flush detector and worker pool
    pub flush: FlushSettings,
    /// Sharded message queue
    pub queue: QueueSettings,
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Maximum plain tasks in flight. Default: 128
    pub max_concurrent_tasks: usize,
    /// Delay used by tasks that poll for a condition. Default: 100ms
    pub poll_interval: Duration,
    /// Concurrent `open_stream` executions. Default: 4
    pub open_stream_concurrency: usize,
    /// Concurrent accumulate executions across the sync, 0 for unbounded. Default: 0
    pub accumulate_concurrency: usize,
    /// Concurrent batch processing across the sync, 0 for unbounded. Default: 0
    pub process_batch_concurrency: usize,
    /// Concurrent batch processing per stream, 0 for unbounded. Default: 1
    pub process_batch_per_stream: usize,
}

/// Memory budget settings.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    /// Total bytes buffers may reserve. Default: 1GB
    pub max_memory_bytes: u64,
    /// Bytes granted per request. Default: 10MB
    pub block_size_bytes: u64,
    /// Back-off when the budget is exhausted. Default: 10ms
    pub retry_interval: Duration,
}

/// Flush settings.
#[derive(Debug, Clone)]
pub struct FlushSettings {
    /// Budget fraction that switches to eager flushing. Default: 0.90
    pub eager_flush_fraction: f64,
    /// Time trigger for a stream's flush. Default: 5 minutes
    pub max_time_between_flushes: Duration,
    /// Supervisor tick. Default: 1s
    pub supervisor_interval: Duration,
    /// Flush jobs in flight. Default: 5
    pub max_flush_workers: usize,
    /// Drain progress log interval during close. Default: 5s
    pub shutdown_progress_interval: Duration,
    /// Upper bound on the close drain. Default: 10 minutes
    pub shutdown_timeout: Duration,
}

/// Message queue settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// How long a shard read waits for data. Default: 200ms
    pub consumer_timeout: Duration,
    /// Poll step while waiting. Default: 50ms
    pub wait_time: Duration,
    /// Bytes per read before a chunk boundary. Default: 10MB
    pub chunk_size_bytes: u64,
    /// Channels per stream. Default: 1
    pub shards_per_stream: usize,
}

impl EngineConfig {
    /// Checks cross-field constraints that the parser cannot.
    pub fn validate(&self) -> Result<(), LoadError> {
        let invalid = |msg: &str| Err(LoadError::Config(msg.to_string()));

        if self.scheduler.max_concurrent_tasks == 0 {
            return invalid("scheduler.max_concurrent_tasks must be at least 1");
        }
        if self.scheduler.open_stream_concurrency == 0 {
            return invalid("scheduler.open_stream_concurrency must be at least 1");
        }
        if self.queue.shards_per_stream == 0 {
            return invalid("queue.shards_per_stream must be at least 1");
        }
        if self.queue.wait_time.is_zero() {
            return invalid("queue.wait_time_ms must be greater than 0");
        }
        if self.queue.chunk_size_bytes == 0 {
            return invalid("queue.chunk_size must be greater than 0");
        }
        if self.flush.max_flush_workers == 0 {
            return invalid("flush.max_flush_workers must be at least 1");
        }
        if self.flush.supervisor_interval.is_zero() {
            return invalid("flush.supervisor_interval_ms must be greater than 0");
        }
        if !(self.flush.eager_flush_fraction > 0.0 && self.flush.eager_flush_fraction <= 1.0) {
            return invalid("flush.eager_flush_fraction must be in (0, 1]");
        }
        if self.memory.block_size_bytes == 0 {
            return invalid("memory.block_size must be greater than 0");
        }
        if self.memory.block_size_bytes > self.memory.max_memory_bytes {
            return invalid("memory.block_size must not exceed memory.max_memory");
        }
        Ok(())
    }
}

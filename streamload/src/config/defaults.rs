//! Default values for every engine setting.
//!
//! Contains all `DEFAULT_*` constants and the `Default` implementations of
//! the settings structs.

use std::time::Duration;

use super::settings::*;

// =============================================================================
// Scheduler
// =============================================================================

/// Maximum plain tasks dispatched at once.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 128;

/// Delay between checks in tasks that wait on a condition (stream completion,
/// open streams closing).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Streams that may be opened concurrently.
pub const DEFAULT_OPEN_STREAM_CONCURRENCY: usize = 4;

/// Concurrent accumulate executions across the sync (0 = unbounded).
pub const DEFAULT_ACCUMULATE_CONCURRENCY: usize = 0;

/// Concurrent batch processing across the sync (0 = unbounded).
pub const DEFAULT_PROCESS_BATCH_CONCURRENCY: usize = 0;

/// Concurrent batch processing per stream.
pub const DEFAULT_PROCESS_BATCH_PER_STREAM: usize = 1;

// =============================================================================
// Memory
// =============================================================================

/// Global buffer budget (1 GiB).
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

/// Block handed out per memory request (10 MiB).
pub const DEFAULT_BLOCK_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Back-off before retrying a memory request when the budget is exhausted.
pub const DEFAULT_MEMORY_RETRY_MS: u64 = 10;

// =============================================================================
// Flush
// =============================================================================

/// Fraction of the budget above which every stream is flushed eagerly.
pub const DEFAULT_EAGER_FLUSH_FRACTION: f64 = 0.90;

/// Longest a buffered stream may go without a flush (5 minutes).
pub const DEFAULT_MAX_TIME_BETWEEN_FLUSHES_MS: u64 = 5 * 60 * 1000;

/// Flush supervisor tick.
pub const DEFAULT_SUPERVISOR_INTERVAL_MS: u64 = 1000;

/// Flush jobs that may run at once.
pub const DEFAULT_MAX_FLUSH_WORKERS: usize = 5;

/// Interval between drain progress logs during shutdown.
pub const DEFAULT_SHUTDOWN_PROGRESS_INTERVAL_MS: u64 = 5000;

/// Upper bound on the shutdown drain (10 minutes).
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10 * 60 * 1000;

// =============================================================================
// Message queue
// =============================================================================

/// Wait for data before a shard read yields a timeout.
pub const DEFAULT_CONSUMER_TIMEOUT_MS: u64 = 200;

/// Sleep between empty polls of a shard.
pub const DEFAULT_WAIT_TIME_MS: u64 = 50;

/// Bytes read from a shard before the read stops at a chunk boundary.
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Independent channels per stream.
pub const DEFAULT_SHARDS_PER_STREAM: usize = 1;

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            open_stream_concurrency: DEFAULT_OPEN_STREAM_CONCURRENCY,
            accumulate_concurrency: DEFAULT_ACCUMULATE_CONCURRENCY,
            process_batch_concurrency: DEFAULT_PROCESS_BATCH_CONCURRENCY,
            process_batch_per_stream: DEFAULT_PROCESS_BATCH_PER_STREAM,
        }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
            retry_interval: Duration::from_millis(DEFAULT_MEMORY_RETRY_MS),
        }
    }
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            eager_flush_fraction: DEFAULT_EAGER_FLUSH_FRACTION,
            max_time_between_flushes: Duration::from_millis(DEFAULT_MAX_TIME_BETWEEN_FLUSHES_MS),
            supervisor_interval: Duration::from_millis(DEFAULT_SUPERVISOR_INTERVAL_MS),
            max_flush_workers: DEFAULT_MAX_FLUSH_WORKERS,
            shutdown_progress_interval: Duration::from_millis(
                DEFAULT_SHUTDOWN_PROGRESS_INTERVAL_MS,
            ),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            consumer_timeout: Duration::from_millis(DEFAULT_CONSUMER_TIMEOUT_MS),
            wait_time: Duration::from_millis(DEFAULT_WAIT_TIME_MS),
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            shards_per_stream: DEFAULT_SHARDS_PER_STREAM,
        }
    }
}

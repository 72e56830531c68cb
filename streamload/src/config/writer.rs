//! INI serialization for `EngineConfig`.

use std::time::Duration;

use super::settings::EngineConfig;
use super::size::format_size;

/// Convert an `EngineConfig` to a commented INI string.
pub(super) fn to_config_string(config: &EngineConfig) -> String {
    let s = &config.scheduler;
    let m = &config.memory;
    let f = &config.flush;
    let q = &config.queue;

    format!(
        r#"[scheduler]
; Plain tasks dispatched at once
max_concurrent_tasks = {}
; Delay for tasks waiting on stream completion or teardown (ms)
poll_interval_ms = {}
; Streams opened concurrently
open_stream_concurrency = {}
; Accumulate executions across the sync (0 = unbounded)
accumulate_concurrency = {}
; Batch processing across the sync (0 = unbounded)
process_batch_concurrency = {}
; Batch processing per stream (0 = unbounded)
process_batch_per_stream = {}

[memory]
; Total buffer budget (e.g. 512MB, 1GB)
max_memory = {}
; Bytes granted per memory request
block_size = {}
; Back-off when the budget is exhausted (ms)
retry_interval_ms = {}

[flush]
; Budget fraction above which every stream is flushed
eager_flush_fraction = {}
; Longest a stream may go without a flush (ms)
max_time_between_flushes_ms = {}
; Supervisor tick (ms)
supervisor_interval_ms = {}
; Flush jobs in flight
max_flush_workers = {}
; Drain progress log interval during close (ms)
shutdown_progress_interval_ms = {}
; Upper bound on the close drain (ms)
shutdown_timeout_ms = {}

[queue]
; Wait for data before a read yields a timeout (ms)
consumer_timeout_ms = {}
; Poll step while waiting (ms)
wait_time_ms = {}
; Bytes per read before a chunk boundary
chunk_size = {}
; Channels per stream
shards_per_stream = {}
"#,
        s.max_concurrent_tasks,
        millis(s.poll_interval),
        s.open_stream_concurrency,
        s.accumulate_concurrency,
        s.process_batch_concurrency,
        s.process_batch_per_stream,
        format_size(m.max_memory_bytes),
        format_size(m.block_size_bytes),
        millis(m.retry_interval),
        f.eager_flush_fraction,
        millis(f.max_time_between_flushes),
        millis(f.supervisor_interval),
        f.max_flush_workers,
        millis(f.shutdown_progress_interval),
        millis(f.shutdown_timeout),
        millis(q.consumer_timeout),
        millis(q.wait_time),
        format_size(q.chunk_size_bytes),
        q.shards_per_stream,
    )
}

fn millis(d: Duration) -> u128 {
    d.as_millis()
}

//! Task scheduler.
//!
//! A single dispatch loop ([`TaskRunner`]) pulls [`ScheduledTask`]s from a
//! FIFO [`WorkQueue`]. Plain tasks run on spawned tokio tasks under a global
//! ceiling plus per-type and per-stream limits ([`ConcurrencyCounters`]);
//! control combinators (fan-outs, once-only claims, counters and gates) are
//! interpreted on the loop itself.
//!
//! # Example
//!
//! ```ignore
//! use streamload::scheduler::{RunnerConfig, ScheduledTask, TaskRunner, WorkQueue};
//!
//! let queue = Arc::new(WorkQueue::new());
//! queue.enqueue(ScheduledTask::plain(MySetupTask::new()));
//!
//! let runner = TaskRunner::new(RunnerConfig::default(), catalog, messages, queue);
//! let stats = runner.run().await?;
//! ```

mod abort;
mod concurrency;
mod config;
mod dispatch;
mod queue;
mod runner;
mod task;
mod telemetry;
mod watchdog;

pub use abort::AbortSignal;
pub use concurrency::{ConcurrencyCounters, ConcurrencyPermit, DeferReason};
pub use config::RunnerConfig;
pub use queue::WorkQueue;
pub use runner::{RunStats, TaskRunner};
pub use task::{
    Concurrency, IndexedTaskBuilder, ScheduledTask, StreamTaskBuilder, Task, TaskBuilder,
    TaskResult,
};
pub use telemetry::{NullTelemetrySink, TelemetryEvent, TelemetrySink, TracingTelemetrySink};
pub use watchdog::{
    LoopHealth, LoopHeartbeat, StallWatchdog, STALL_DETECTION_THRESHOLD_MS,
    STALL_WATCHDOG_INTERVAL_SECS,
};

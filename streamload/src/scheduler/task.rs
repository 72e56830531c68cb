//! Tasks and control combinators.
//!
//! A [`ScheduledTask`] is either a plain [`Task`] (work that runs on a spawned
//! tokio task) or a control combinator that the runner interprets inline
//! without consuming a worker:
//!
//! | Variant                | Effect in the dispatch loop                        |
//! |------------------------|----------------------------------------------------|
//! | `Terminate`            | stop the loop                                      |
//! | `FanOutPerStream`      | enqueue `builder(stream)` for each catalog stream  |
//! | `FanOutAvailable`      | enqueue one instance per available slot            |
//! | `Replicate`            | enqueue `builder(i)` for `i in 0..count`           |
//! | `OnceOnly`             | enqueue `builder()` the first time `id` is seen    |
//! | `GateOnCounterZero`    | enqueue `builder()` once the counter is 0          |
//! | `GateOnStreamComplete` | enqueue `builder()` once the stream is complete    |
//! | `IncrementCounter`     | counter += 1, enqueue `builder()`                  |
//! | `DecrementCounter`     | counter -= 1, enqueue `builder()`                  |
//! | `Noop`                 | drop                                               |
//!
//! Not-ready gates are put back on the queue rather than awaited.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

use crate::error::LoadError;
use crate::stream::Stream;

/// What a task execution produces: the next task to enqueue.
pub type TaskResult = Result<ScheduledTask, LoadError>;

/// Concurrency limits for a task type. Zero means unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concurrency {
    /// Task-type id the counters are keyed by.
    pub id: String,
    /// Instances of this type across the whole run.
    pub per_sync: usize,
    /// Instances of this type for one stream.
    pub per_stream: usize,
}

impl Concurrency {
    pub fn new(id: impl Into<String>, per_sync: usize, per_stream: usize) -> Self {
        Self {
            id: id.into(),
            per_sync,
            per_stream,
        }
    }

    /// Tracked, but never limited.
    pub fn unbounded(id: impl Into<String>) -> Self {
        Self::new(id, 0, 0)
    }

    /// Instances `FanOutAvailable` should create: the smaller configured
    /// limit, at least one.
    pub fn available_parallelism(&self) -> usize {
        [self.per_sync, self.per_stream]
            .into_iter()
            .filter(|limit| *limit > 0)
            .min()
            .unwrap_or(1)
    }
}

/// A unit of work executed off the dispatch loop.
pub trait Task: Send + Sync + 'static {
    /// Name used in logs and telemetry.
    fn name(&self) -> &str;

    /// Concurrency limits, if the type is limited or tracked.
    fn concurrency(&self) -> Option<&Concurrency> {
        None
    }

    /// Stream affinity, for per-stream limits.
    fn stream(&self) -> Option<&Stream> {
        None
    }

    /// True while the task still has stream input to read. The runner puts
    /// such a task back on the queue after each execution until its stream
    /// is complete.
    fn consumes_stream(&self) -> bool {
        false
    }

    /// Runs the task.
    fn execute(&self) -> BoxFuture<'_, TaskResult>;
}

/// Builder invoked once to produce the next task.
pub type TaskBuilder = Box<dyn FnOnce() -> ScheduledTask + Send>;

/// Builder invoked per stream.
pub type StreamTaskBuilder = Arc<dyn Fn(&Stream) -> ScheduledTask + Send + Sync>;

/// Builder invoked per instance index.
pub type IndexedTaskBuilder = Arc<dyn Fn(usize) -> ScheduledTask + Send + Sync>;

/// An entry on the work queue.
pub enum ScheduledTask {
    Plain(Box<dyn Task>),
    Terminate,
    FanOutPerStream(StreamTaskBuilder),
    FanOutAvailable(IndexedTaskBuilder),
    Replicate {
        count: usize,
        builder: IndexedTaskBuilder,
    },
    OnceOnly {
        id: String,
        builder: TaskBuilder,
    },
    GateOnCounterZero {
        id: String,
        builder: TaskBuilder,
    },
    GateOnStreamComplete {
        stream: Stream,
        builder: TaskBuilder,
    },
    IncrementCounter {
        id: String,
        builder: TaskBuilder,
    },
    DecrementCounter {
        id: String,
        builder: TaskBuilder,
    },
    Noop,
}

impl ScheduledTask {
    pub fn plain(task: impl Task) -> Self {
        ScheduledTask::Plain(Box::new(task))
    }

    pub fn fan_out_per_stream(
        builder: impl Fn(&Stream) -> ScheduledTask + Send + Sync + 'static,
    ) -> Self {
        ScheduledTask::FanOutPerStream(Arc::new(builder))
    }

    pub fn fan_out_available(
        builder: impl Fn(usize) -> ScheduledTask + Send + Sync + 'static,
    ) -> Self {
        ScheduledTask::FanOutAvailable(Arc::new(builder))
    }

    pub fn replicate(
        count: usize,
        builder: impl Fn(usize) -> ScheduledTask + Send + Sync + 'static,
    ) -> Self {
        ScheduledTask::Replicate {
            count,
            builder: Arc::new(builder),
        }
    }

    pub fn once_only(
        id: impl Into<String>,
        builder: impl FnOnce() -> ScheduledTask + Send + 'static,
    ) -> Self {
        ScheduledTask::OnceOnly {
            id: id.into(),
            builder: Box::new(builder),
        }
    }

    pub fn gate_on_counter_zero(
        id: impl Into<String>,
        builder: impl FnOnce() -> ScheduledTask + Send + 'static,
    ) -> Self {
        ScheduledTask::GateOnCounterZero {
            id: id.into(),
            builder: Box::new(builder),
        }
    }

    pub fn gate_on_stream_complete(
        stream: Stream,
        builder: impl FnOnce() -> ScheduledTask + Send + 'static,
    ) -> Self {
        ScheduledTask::GateOnStreamComplete {
            stream,
            builder: Box::new(builder),
        }
    }

    pub fn increment(
        id: impl Into<String>,
        builder: impl FnOnce() -> ScheduledTask + Send + 'static,
    ) -> Self {
        ScheduledTask::IncrementCounter {
            id: id.into(),
            builder: Box::new(builder),
        }
    }

    pub fn decrement(
        id: impl Into<String>,
        builder: impl FnOnce() -> ScheduledTask + Send + 'static,
    ) -> Self {
        ScheduledTask::DecrementCounter {
            id: id.into(),
            builder: Box::new(builder),
        }
    }

    /// True for everything but `Plain`.
    pub fn is_control(&self) -> bool {
        !matches!(self, ScheduledTask::Plain(_))
    }

    /// Short variant name for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduledTask::Plain(_) => "plain",
            ScheduledTask::Terminate => "terminate",
            ScheduledTask::FanOutPerStream(_) => "fan_out_per_stream",
            ScheduledTask::FanOutAvailable(_) => "fan_out_available",
            ScheduledTask::Replicate { .. } => "replicate",
            ScheduledTask::OnceOnly { .. } => "once_only",
            ScheduledTask::GateOnCounterZero { .. } => "gate_on_counter_zero",
            ScheduledTask::GateOnStreamComplete { .. } => "gate_on_stream_complete",
            ScheduledTask::IncrementCounter { .. } => "increment_counter",
            ScheduledTask::DecrementCounter { .. } => "decrement_counter",
            ScheduledTask::Noop => "noop",
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduledTask::Plain(task) => f.debug_tuple("Plain").field(&task.name()).finish(),
            ScheduledTask::Replicate { count, .. } => {
                f.debug_struct("Replicate").field("count", count).finish()
            }
            ScheduledTask::OnceOnly { id, .. }
            | ScheduledTask::GateOnCounterZero { id, .. }
            | ScheduledTask::IncrementCounter { id, .. }
            | ScheduledTask::DecrementCounter { id, .. } => {
                f.debug_struct(self.kind()).field("id", id).finish()
            }
            ScheduledTask::GateOnStreamComplete { stream, .. } => f
                .debug_struct("GateOnStreamComplete")
                .field("stream", stream)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}

//! Scheduler telemetry.
//!
//! The runner emits structured events through a [`TelemetrySink`] and does
//! not care how they are consumed. Sinks decide whether to log, count or
//! drop them.

use std::time::Duration;
use tracing::{debug, trace, warn};

use super::concurrency::DeferReason;
use crate::stream::Stream;

// =============================================================================
// Events
// =============================================================================

/// Events emitted by the task runner.
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    /// A plain task was spawned.
    TaskDispatched {
        task: String,
        stream: Option<Stream>,
    },

    /// A plain task was put back because a limit was reached.
    TaskDeferred {
        task: String,
        stream: Option<Stream>,
        reason: DeferReason,
    },

    /// A plain task finished successfully.
    TaskCompleted {
        task: String,
        stream: Option<Stream>,
        duration: Duration,
    },

    /// A plain task returned an error or panicked.
    TaskFailed {
        task: String,
        stream: Option<Stream>,
        error: String,
    },

    /// A control combinator was interpreted.
    ControlTaskHandled { kind: &'static str },

    /// A stream's consumers saw its completion marker.
    StreamCompleted { stream: Stream },
}

impl TelemetryEvent {
    /// Returns the stream associated with this event, if any.
    pub fn stream(&self) -> Option<&Stream> {
        match self {
            Self::TaskDispatched { stream, .. }
            | Self::TaskDeferred { stream, .. }
            | Self::TaskCompleted { stream, .. }
            | Self::TaskFailed { stream, .. } => stream.as_ref(),
            Self::StreamCompleted { stream } => Some(stream),
            Self::ControlTaskHandled { .. } => None,
        }
    }

    /// Returns a short name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskDispatched { .. } => "task_dispatched",
            Self::TaskDeferred { .. } => "task_deferred",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::ControlTaskHandled { .. } => "control_task_handled",
            Self::StreamCompleted { .. } => "stream_completed",
        }
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Receives runner events. `emit` runs on the dispatch loop and must not block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Drops every event. The runner's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Writes events to `tracing`: failures at warn, completions at debug, the rest at trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::TaskDispatched { task, stream } => {
                trace!(task = %task, stream = ?stream, "Task dispatched");
            }
            TelemetryEvent::TaskDeferred {
                task,
                stream,
                reason,
            } => {
                trace!(task = %task, stream = ?stream, reason = %reason, "Task deferred");
            }
            TelemetryEvent::TaskCompleted {
                task,
                stream,
                duration,
            } => {
                debug!(
                    task = %task,
                    stream = ?stream,
                    duration_ms = duration.as_millis(),
                    "Task completed"
                );
            }
            TelemetryEvent::TaskFailed {
                task,
                stream,
                error,
            } => {
                warn!(task = %task, stream = ?stream, error = %error, "Task failed");
            }
            TelemetryEvent::ControlTaskHandled { kind } => {
                trace!(kind, "Control task handled");
            }
            TelemetryEvent::StreamCompleted { stream } => {
                debug!(stream = %stream, "Stream completed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_and_tracing_sinks() {
        let event = TelemetryEvent::ControlTaskHandled { kind: "noop" };
        NullTelemetrySink.emit(event.clone());
        TracingTelemetrySink.emit(event);
    }

    #[test]
    fn test_event_stream() {
        let users = Stream::new("users");
        let event = TelemetryEvent::StreamCompleted {
            stream: users.clone(),
        };
        assert_eq!(event.stream(), Some(&users));
        assert_eq!(
            TelemetryEvent::ControlTaskHandled { kind: "noop" }.stream(),
            None
        );
    }

    #[test]
    fn test_event_type_names() {
        let event = TelemetryEvent::TaskDeferred {
            task: "accumulate_records".to_string(),
            stream: None,
            reason: DeferReason::PerSyncLimit,
        };
        assert_eq!(event.event_type(), "task_deferred");
        assert_eq!(
            TelemetryEvent::TaskFailed {
                task: "setup".to_string(),
                stream: None,
                error: "boom".to_string(),
            }
            .event_type(),
            "task_failed"
        );
    }
}

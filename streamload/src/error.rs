//! Error types for the write engine.
//!
//! [`LoadError`] is the single error that escapes a run. It is `Clone` so the
//! shared first-failure slot can hand the original error to every observer.
//! Destination hooks return [`DestinationError`]; the engine wraps it with
//! the [`Phase`], stream and task that were running when it failed.

use crate::stream::Stream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Destination lifecycle phase a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Setup,
    OpenStream,
    Accumulate,
    Flush,
    ProcessBatch,
    CloseStream,
    Teardown,
}

impl Phase {
    /// Returns the phase name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::OpenStream => "open_stream",
            Phase::Accumulate => "accumulate",
            Phase::Flush => "flush",
            Phase::ProcessBatch => "process_batch",
            Phase::CloseStream => "close_stream",
            Phase::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by destination hooks.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DestinationError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DestinationError {
    /// Creates an error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors that abort a run.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// Contract violation between components.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Input referenced a stream outside the configured catalog.
    #[error("Stream '{0}' is not in the configured catalog")]
    UnknownStream(Stream),

    /// An input line could not be decoded.
    #[error("Failed to deserialize input message: {0}")]
    Deserialize(String),

    /// Reading the input failed.
    #[error("Failed to read input: {0}")]
    Input(#[source] Arc<std::io::Error>),

    /// A destination hook failed.
    #[error("Destination {phase} failed{}: {source}", describe_context(.stream, .task))]
    Destination {
        phase: Phase,
        stream: Option<Stream>,
        task: Option<String>,
        #[source]
        source: Arc<DestinationError>,
    },

    /// A flush job ended without reporting a result.
    #[error("Flush worker for stream '{stream}' failed: {reason}")]
    Flush { stream: Stream, reason: String },

    /// A scheduled task panicked.
    #[error("Task '{task}' panicked: {reason}")]
    TaskPanicked { task: String, reason: String },

    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Shutdown did not complete in time.
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

impl LoadError {
    /// Wraps a destination hook failure with its context.
    pub fn destination(
        phase: Phase,
        stream: Option<&Stream>,
        task: Option<&str>,
        source: DestinationError,
    ) -> Self {
        LoadError::Destination {
            phase,
            stream: stream.cloned(),
            task: task.map(str::to_string),
            source: Arc::new(source),
        }
    }

    /// Returns the phase for destination failures.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            LoadError::Destination { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::Input(Arc::new(err))
    }
}

fn describe_context(stream: &Option<Stream>, task: &Option<String>) -> String {
    match (stream, task) {
        (Some(stream), Some(task)) => format!(" (stream '{}', task '{}')", stream, task),
        (Some(stream), None) => format!(" (stream '{}')", stream),
        (None, Some(task)) => format!(" (task '{}')", task),
        (None, None) => String::new(),
    }
}

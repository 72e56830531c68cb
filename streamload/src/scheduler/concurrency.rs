//! Per-type and per-stream concurrency counters.
//!
//! Every plain task that declares a [`Concurrency`] holds a
//! [`ConcurrencyPermit`] while it runs. The permit increments the task type's
//! sync-wide counter and, for tasks with a stream, the (type, stream)
//! counter. Dropping it decrements both, so a panicking task still releases
//! its slot.
//!
//! Limits are checked before acquiring: the runner defers a task whose
//! counters are at their limit instead of waiting.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::task::Concurrency;
use crate::stream::Stream;

/// Why a task could not be dispatched yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The runner's plain-task ceiling is reached.
    GlobalLimit,
    /// The task type's sync-wide limit is reached.
    PerSyncLimit,
    /// The task type's limit for this stream is reached.
    PerStreamLimit,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeferReason::GlobalLimit => "global_limit",
            DeferReason::PerSyncLimit => "per_sync_limit",
            DeferReason::PerStreamLimit => "per_stream_limit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn acquire(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Counters {
    per_sync: DashMap<String, Arc<Gauge>>,
    per_stream: DashMap<(String, Stream), Arc<Gauge>>,
}

/// Counters for every task type seen by the runner.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyCounters {
    inner: Arc<Counters>,
}

impl ConcurrencyCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a slot for a task, or says which limit blocks it.
    ///
    /// Tasks without a [`Concurrency`] always get an empty permit.
    pub fn try_acquire(
        &self,
        concurrency: Option<&Concurrency>,
        stream: Option<&Stream>,
    ) -> Result<ConcurrencyPermit, DeferReason> {
        let Some(concurrency) = concurrency else {
            return Ok(ConcurrencyPermit::default());
        };

        let sync_gauge = self.sync_gauge(&concurrency.id);
        if concurrency.per_sync > 0 && sync_gauge.current() >= concurrency.per_sync {
            return Err(DeferReason::PerSyncLimit);
        }

        let stream_gauge = stream.map(|s| self.stream_gauge(&concurrency.id, s));
        if let Some(gauge) = &stream_gauge {
            if concurrency.per_stream > 0 && gauge.current() >= concurrency.per_stream {
                return Err(DeferReason::PerStreamLimit);
            }
        }

        // The dispatch loop is the only acquirer, so check-then-increment
        // cannot overshoot.
        sync_gauge.acquire();
        if let Some(gauge) = &stream_gauge {
            gauge.acquire();
        }

        Ok(ConcurrencyPermit {
            gauges: std::iter::once(sync_gauge).chain(stream_gauge).collect(),
        })
    }

    /// Running instances of a task type.
    pub fn in_flight(&self, id: &str) -> usize {
        self.inner.per_sync.get(id).map(|g| g.current()).unwrap_or(0)
    }

    /// Highest concurrent instances of a task type observed.
    pub fn peak(&self, id: &str) -> usize {
        self.inner.per_sync.get(id).map(|g| g.peak()).unwrap_or(0)
    }

    /// Running instances of a task type for one stream.
    pub fn in_flight_for_stream(&self, id: &str, stream: &Stream) -> usize {
        self.inner
            .per_stream
            .get(&(id.to_string(), stream.clone()))
            .map(|g| g.current())
            .unwrap_or(0)
    }

    /// Highest concurrent instances of a task type for one stream.
    pub fn peak_for_stream(&self, id: &str, stream: &Stream) -> usize {
        self.inner
            .per_stream
            .get(&(id.to_string(), stream.clone()))
            .map(|g| g.peak())
            .unwrap_or(0)
    }

    fn sync_gauge(&self, id: &str) -> Arc<Gauge> {
        Arc::clone(
            self.inner
                .per_sync
                .entry(id.to_string())
                .or_default()
                .value(),
        )
    }

    fn stream_gauge(&self, id: &str, stream: &Stream) -> Arc<Gauge> {
        Arc::clone(
            self.inner
                .per_stream
                .entry((id.to_string(), stream.clone()))
                .or_default()
                .value(),
        )
    }
}

/// Held by a running task; releases its counters on drop.
#[derive(Debug, Default)]
pub struct ConcurrencyPermit {
    gauges: Vec<Arc<Gauge>>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        for gauge in &self.gauges {
            gauge.release();
        }
    }
}

//! Shared state for one destination run.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::SchedulerSettings;
use crate::destination::StandardDestination;
use crate::message::MessageQueue;
use crate::stream::{Catalog, Stream};

/// Where a stream is in the destination lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    NotOpened,
    Open,
    Accumulating,
    ProcessingBatch,
    Closing,
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::NotOpened => "not_opened",
            StreamState::Open => "open",
            StreamState::Accumulating => "accumulating",
            StreamState::ProcessingBatch => "processing_batch",
            StreamState::Closing => "closing",
            StreamState::Closed => "closed",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the lifecycle tasks share.
pub(crate) struct LifecycleContext<D: StandardDestination> {
    pub destination: Arc<D>,
    pub catalog: Arc<Catalog>,
    pub messages: Arc<MessageQueue>,
    pub settings: SchedulerSettings,
    /// Accumulator replicas per stream, one per message queue shard.
    pub shards: usize,
    /// Streams whose `close_stream` has not completed. Teardown waits on it.
    pending_close: Mutex<HashSet<Stream>>,
    /// Streams a close task has claimed.
    close_claimed: Mutex<HashSet<Stream>>,
    /// Streams opened and not yet closed, for failure cleanup.
    opened: Mutex<HashSet<Stream>>,
    teardown_claimed: AtomicBool,
    teardown_done: AtomicBool,
    states: DashMap<Stream, StreamState>,
    records_accumulated: AtomicU64,
}

impl<D: StandardDestination> LifecycleContext<D> {
    pub fn new(
        destination: Arc<D>,
        catalog: Arc<Catalog>,
        messages: Arc<MessageQueue>,
        settings: SchedulerSettings,
    ) -> Self {
        let shards = messages.shard_count();
        let states = catalog
            .streams()
            .iter()
            .map(|s| (s.clone(), StreamState::NotOpened))
            .collect();
        let pending_close = catalog.streams().iter().cloned().collect();

        Self {
            destination,
            catalog,
            messages,
            settings,
            shards,
            pending_close: Mutex::new(pending_close),
            close_claimed: Mutex::new(HashSet::new()),
            opened: Mutex::new(HashSet::new()),
            teardown_claimed: AtomicBool::new(false),
            teardown_done: AtomicBool::new(false),
            states,
            records_accumulated: AtomicU64::new(0),
        }
    }

    pub fn set_state(&self, stream: &Stream, state: StreamState) {
        self.states.insert(stream.clone(), state);
    }

    pub fn state(&self, stream: &Stream) -> Option<StreamState> {
        self.states.get(stream).map(|s| *s)
    }

    pub fn mark_opened(&self, stream: &Stream) {
        self.opened.lock().insert(stream.clone());
        self.set_state(stream, StreamState::Open);
    }

    /// True for the first caller per stream.
    pub fn claim_close(&self, stream: &Stream) -> bool {
        self.close_claimed.lock().insert(stream.clone())
    }

    pub fn mark_closed(&self, stream: &Stream) {
        self.opened.lock().remove(stream);
        self.pending_close.lock().remove(stream);
        self.set_state(stream, StreamState::Closed);
    }

    pub fn pending_close_count(&self) -> usize {
        self.pending_close.lock().len()
    }

    /// Opened streams whose close has not completed, in stream order.
    pub fn open_streams(&self) -> Vec<Stream> {
        let mut streams: Vec<Stream> = self.opened.lock().iter().cloned().collect();
        streams.sort();
        streams
    }

    /// True for the first caller.
    pub fn claim_teardown(&self) -> bool {
        !self.teardown_claimed.swap(true, Ordering::SeqCst)
    }

    pub fn mark_teardown_done(&self) {
        self.teardown_done.store(true, Ordering::SeqCst);
    }

    pub fn is_teardown_done(&self) -> bool {
        self.teardown_done.load(Ordering::SeqCst)
    }

    pub fn record_accumulated(&self) {
        self.records_accumulated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records_accumulated(&self) -> u64 {
        self.records_accumulated.load(Ordering::Relaxed)
    }
}

//! Checkpoint tracking for the buffered path.
//!
//! Every buffered record is attributed to the currently open [`StateId`] of
//! its lane. When a checkpoint arrives it seals that id and a fresh one is
//! opened for later records. A sealed checkpoint is acknowledged only once
//! every record attributed to it has been flushed, and only after every
//! earlier checkpoint of the same lane:
//!
//! ```text
//!   records ──► [id 1: open, 3 pending] ──checkpoint A──► [id 1: sealed(A)]
//!                                                          [id 2: open]
//!   batch released (3 records of id 1) ──► id 1 pending = 0 ──► emit A
//! ```
//!
//! A run uses either per-stream checkpoints (one lane per stream) or global
//! checkpoints (one lane shared by every stream). Records that arrive before
//! the first checkpoint sit in per-stream lanes; a first global checkpoint
//! folds those lanes into the global one, so it is acknowledged only after
//! every stream's earlier records are flushed. Mixing the two kinds in one
//! run is a protocol violation.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::stream::Stream;

/// Identifies the group of records preceding one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

impl StateId {
    /// Returns the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// What a checkpoint covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateScope {
    Stream(Stream),
    Global,
}

impl fmt::Display for StateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateScope::Stream(stream) => write!(f, "{}", stream),
            StateScope::Global => f.write_str("<global>"),
        }
    }
}

/// The checkpoint kind a run has committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Stream,
    Global,
}

/// An acknowledged checkpoint, ready to be emitted upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub scope: StateScope,
    pub state: Value,
    /// Records covered by this checkpoint.
    pub record_count: u64,
}

impl Checkpoint {
    /// The stream of a per-stream checkpoint.
    pub fn stream(&self) -> Option<&Stream> {
        match &self.scope {
            StateScope::Stream(stream) => Some(stream),
            StateScope::Global => None,
        }
    }
}

/// Receives acknowledged checkpoints.
pub trait CheckpointSink: Send + Sync {
    fn emit(&self, checkpoint: Checkpoint);
}

impl<F> CheckpointSink for F
where
    F: Fn(Checkpoint) + Send + Sync,
{
    fn emit(&self, checkpoint: Checkpoint) {
        self(checkpoint)
    }
}

/// Sink that discards checkpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCheckpointSink;

impl CheckpointSink for NullCheckpointSink {
    fn emit(&self, _checkpoint: Checkpoint) {}
}

#[derive(Debug)]
struct StateEntry {
    id: StateId,
    /// Records attributed but not yet released.
    pending: i64,
    /// Records attributed in total.
    received: u64,
    /// Set once the checkpoint arrives.
    state: Option<Value>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    kind: Option<StateKind>,
    lanes: HashMap<StateScope, VecDeque<StateEntry>>,
    owners: HashMap<StateId, StateScope>,
    /// Per-stream ids folded into a global entry.
    folded: HashMap<StateId, StateId>,
}

impl Inner {
    /// Lane a record of `stream` is attributed to.
    fn lane_for(&self, stream: &Stream) -> StateScope {
        match self.kind {
            Some(StateKind::Global) => StateScope::Global,
            _ => StateScope::Stream(stream.clone()),
        }
    }

    /// Returns the lane's open entry, creating one if the newest is sealed.
    fn open_entry(&mut self, scope: &StateScope) -> &mut StateEntry {
        let entries = self.lanes.entry(scope.clone()).or_default();
        if entries.back().map_or(true, |entry| entry.state.is_some()) {
            self.next_id += 1;
            let id = StateId(self.next_id);
            self.owners.insert(id, scope.clone());
            entries.push_back(StateEntry {
                id,
                pending: 0,
                received: 0,
                state: None,
            });
        }

        let last = entries.len() - 1;
        &mut entries[last]
    }

    /// Commits the run to `kind`, rejecting a switch between kinds.
    fn commit(&mut self, kind: StateKind) -> Result<(), LoadError> {
        match self.kind {
            Some(current) if current != kind => Err(LoadError::Protocol(format!(
                "{:?} checkpoint received in a run using {:?} checkpoints",
                kind, current
            ))),
            _ => {
                self.kind = Some(kind);
                Ok(())
            }
        }
    }

    /// Moves every per-stream open entry into the global open entry.
    fn fold_into_global(&mut self) {
        let stream_lanes: Vec<StateScope> = self
            .lanes
            .keys()
            .filter(|scope| matches!(scope, StateScope::Stream(_)))
            .cloned()
            .collect();

        let mut moved = Vec::new();
        for scope in stream_lanes {
            if let Some(entries) = self.lanes.remove(&scope) {
                moved.extend(entries);
            }
        }

        let global = self.open_entry(&StateScope::Global);
        let global_id = global.id;
        for entry in &moved {
            global.pending += entry.pending;
            global.received += entry.received;
        }
        let records = global.received;

        for entry in moved {
            self.owners.remove(&entry.id);
            self.folded.insert(entry.id, global_id);
        }
        info!(records, "Switched to global checkpoints");
    }
}

/// Tracks checkpoints against outstanding record counts.
#[derive(Debug, Default)]
pub struct StateManager {
    inner: Mutex<Inner>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes one record of `stream` to its lane's open state id.
    pub fn state_id_and_increment(&self, stream: &Stream) -> StateId {
        let mut inner = self.inner.lock();
        let lane = inner.lane_for(stream);
        let entry = inner.open_entry(&lane);
        entry.pending += 1;
        entry.received += 1;
        entry.id
    }

    /// Seals the stream's open id with a checkpoint payload.
    ///
    /// # Errors
    ///
    /// Fails if the run already uses global checkpoints.
    pub fn track_state(&self, stream: &Stream, state: Value) -> Result<(), LoadError> {
        let mut inner = self.inner.lock();
        inner.commit(StateKind::Stream)?;
        let entry = inner.open_entry(&StateScope::Stream(stream.clone()));
        debug!(
            stream = %stream,
            state_id = entry.id.0,
            records = entry.received,
            "Checkpoint received"
        );
        entry.state = Some(state);
        Ok(())
    }

    /// Seals the global open id with a checkpoint payload.
    ///
    /// The first global checkpoint of a run also covers records buffered
    /// before it on any stream.
    ///
    /// # Errors
    ///
    /// Fails if the run already uses per-stream checkpoints.
    pub fn track_global_state(&self, state: Value) -> Result<(), LoadError> {
        let mut inner = self.inner.lock();
        let first = inner.kind.is_none();
        inner.commit(StateKind::Global)?;
        if first {
            inner.fold_into_global();
        }
        let entry = inner.open_entry(&StateScope::Global);
        debug!(
            state_id = entry.id.0,
            records = entry.received,
            "Global checkpoint received"
        );
        entry.state = Some(state);
        Ok(())
    }

    /// The checkpoint kind in use, once the first checkpoint has arrived.
    pub fn kind(&self) -> Option<StateKind> {
        self.inner.lock().kind
    }

    /// Marks `count` records of a state id as flushed.
    pub fn decrement(&self, id: StateId, count: u64) {
        let mut inner = self.inner.lock();
        let id = inner.folded.get(&id).copied().unwrap_or(id);
        let Some(scope) = inner.owners.get(&id).cloned() else {
            warn!(state_id = id.0, count, "Decrement for unknown state id");
            return;
        };
        let Some(entry) = inner
            .lanes
            .get_mut(&scope)
            .and_then(|entries| entries.iter_mut().find(|e| e.id == id))
        else {
            return;
        };
        entry.pending -= i64::try_from(count).unwrap_or(i64::MAX);
        if entry.pending < 0 {
            warn!(
                scope = %scope,
                state_id = id.0,
                pending = entry.pending,
                "State id released more records than it received"
            );
        }
    }

    /// Emits every checkpoint whose records are fully flushed, in arrival
    /// order per lane. Returns the number emitted.
    pub fn flush_states(&self, sink: &dyn CheckpointSink) -> usize {
        let ready = {
            let mut inner = self.inner.lock();
            let Inner {
                lanes,
                owners,
                folded,
                ..
            } = &mut *inner;

            let mut ready = Vec::new();
            for (scope, entries) in lanes.iter_mut() {
                while entries
                    .front()
                    .is_some_and(|e| e.state.is_some() && e.pending <= 0)
                {
                    if let Some(entry) = entries.pop_front() {
                        owners.remove(&entry.id);
                        folded.retain(|_, target| *target != entry.id);
                        if let Some(state) = entry.state {
                            ready.push(Checkpoint {
                                scope: scope.clone(),
                                state,
                                record_count: entry.received,
                            });
                        }
                    }
                }
            }
            ready
        };

        let emitted = ready.len();
        for checkpoint in ready {
            debug!(
                scope = %checkpoint.scope,
                records = checkpoint.record_count,
                "Checkpoint acknowledged"
            );
            sink.emit(checkpoint);
        }
        emitted
    }

    /// Sealed checkpoints not yet emitted.
    pub fn pending_checkpoints(&self) -> usize {
        self.inner
            .lock()
            .lanes
            .values()
            .flat_map(|entries| entries.iter())
            .filter(|e| e.state.is_some())
            .count()
    }
}

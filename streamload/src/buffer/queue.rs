//! A single stream's bounded buffer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;

use crate::message::Record;
use crate::state::StateId;

/// A buffered record with its accounting data.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub record: Record,
    pub size_bytes: u64,
    pub state_id: StateId,
}

#[derive(Debug, Default)]
struct Inner {
    records: VecDeque<BufferedRecord>,
    current_bytes: u64,
    /// Bytes of budget reserved by this queue.
    max_bytes: u64,
    last_record_at: Option<Instant>,
}

/// FIFO of records bounded by the memory reserved for it.
///
/// Appends may come from several producers; draining happens under the same
/// lock so a take observes a consistent prefix.
#[derive(Debug, Default)]
pub(crate) struct StreamQueue {
    inner: Mutex<Inner>,
}

impl StreamQueue {
    /// Appends if the reservation has room, otherwise hands the record back.
    pub fn offer(&self, entry: BufferedRecord) -> Result<(), BufferedRecord> {
        let mut inner = self.inner.lock();
        if inner.current_bytes + entry.size_bytes > inner.max_bytes {
            return Err(entry);
        }
        inner.current_bytes += entry.size_bytes;
        inner.last_record_at = Some(Instant::now());
        inner.records.push_back(entry);
        Ok(())
    }

    /// Grows the reservation.
    pub fn add_max_memory(&self, bytes: u64) {
        self.inner.lock().max_bytes += bytes;
    }

    /// Removes a prefix of at most `max_bytes`, or the first record alone if
    /// it is larger. The drained bytes leave the reservation with the batch.
    ///
    /// Returns `(records, drained_bytes, idle_bytes)`. When the queue ends up
    /// empty its unused reservation is given up as `idle_bytes`, so idle
    /// streams do not hold budget.
    pub fn drain(&self, max_bytes: u64) -> (Vec<BufferedRecord>, u64, u64) {
        let mut inner = self.inner.lock();
        let mut taken = Vec::new();
        let mut bytes = 0u64;

        while let Some(front) = inner.records.front() {
            let fits = bytes + front.size_bytes <= max_bytes;
            if !fits && !taken.is_empty() {
                break;
            }
            let Some(entry) = inner.records.pop_front() else {
                break;
            };
            bytes += entry.size_bytes;
            taken.push(entry);
            if !fits {
                break;
            }
        }

        inner.current_bytes -= bytes;
        inner.max_bytes = inner.max_bytes.saturating_sub(bytes);

        let mut idle = 0;
        if inner.records.is_empty() {
            idle = inner.max_bytes;
            inner.max_bytes = 0;
        }
        (taken, bytes, idle)
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().current_bytes
    }

    pub fn size_records(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn last_record_at(&self) -> Option<Instant> {
        self.inner.lock().last_record_at
    }
}

//! Decides which stream to flush next.
//!
//! Called synchronously by the supervisor on each tick. Streams are visited
//! in priority order and the first one that trips a trigger is returned:
//!
//! - **size**: `buffered - in_flight_estimate > threshold`
//! - **time**: `now - last_flush >= max_time_between_flushes`
//!
//! Priority is buffered bytes descending, then oldest last record first
//! (streams without records last), then stream identity.
//!
//! The in-flight estimate charges each running job its batch size, or
//! `min(optimal_batch, buffered)` while its size is still unknown. This keeps
//! the supervisor from piling more jobs onto a stream that is already being
//! drained.

use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::buffer::StreamBuffers;
use crate::config::FlushSettings;
use crate::stream::Stream;

use super::running::RunningFlushWorkers;

/// Flush trigger logic over the stream buffers.
pub struct FlushDetector {
    buffers: Arc<StreamBuffers>,
    running: Arc<RunningFlushWorkers>,
    optimal_batch_size_bytes: u64,
    queue_flush_threshold_bytes: u64,
    eager_flush_fraction: f64,
    max_time_between_flushes: Duration,
    closing: AtomicBool,
    last_flush: Mutex<HashMap<Stream, Instant>>,
}

impl FlushDetector {
    pub fn new(
        buffers: Arc<StreamBuffers>,
        running: Arc<RunningFlushWorkers>,
        settings: &FlushSettings,
        optimal_batch_size_bytes: u64,
        queue_flush_threshold_bytes: u64,
    ) -> Self {
        Self {
            buffers,
            running,
            optimal_batch_size_bytes,
            queue_flush_threshold_bytes,
            eager_flush_fraction: settings.eager_flush_fraction,
            max_time_between_flushes: settings.max_time_between_flushes,
            closing: AtomicBool::new(false),
            last_flush: Mutex::new(HashMap::new()),
        }
    }

    /// Forces eager draining (threshold 0) while closing.
    pub fn set_closing(&self, closing: bool) {
        self.closing.store(closing, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Minimum effective buffered bytes for a size trigger.
    ///
    /// Zero while closing or once reserved memory reaches the eager fraction
    /// of the budget.
    pub fn compute_threshold_bytes(&self) -> u64 {
        if self.is_closing() {
            return 0;
        }
        let max = self.buffers.max_queue_size_bytes();
        if max > 0 {
            let usage = self.buffers.reserved_bytes() as f64 / max as f64;
            if usage >= self.eager_flush_fraction {
                debug!(usage, "Memory usage above eager flush fraction");
                return 0;
            }
        }
        self.queue_flush_threshold_bytes
    }

    /// First stream in priority order that trips a trigger.
    ///
    /// Updates the returned stream's last-flush time.
    pub fn next_stream_to_flush(&self, threshold_bytes: u64) -> Option<Stream> {
        let now = Instant::now();
        for stream in self.streams_by_priority() {
            let buffered = self.buffers.queue_size_bytes(&stream).unwrap_or(0);
            if buffered == 0 {
                continue;
            }

            let in_flight = self.estimate_in_flight_bytes(&stream, buffered);
            let size_trigger = buffered.saturating_sub(in_flight) > threshold_bytes;
            let time_trigger = self.is_time_triggered(&stream, now);

            debug!(
                stream = %stream,
                buffered,
                in_flight,
                threshold_bytes,
                size_trigger,
                time_trigger,
                "Evaluated flush triggers"
            );

            if size_trigger || time_trigger {
                self.last_flush.lock().insert(stream.clone(), now);
                return Some(stream);
            }
        }
        None
    }

    /// Buffered streams in flush priority order.
    pub fn streams_by_priority(&self) -> Vec<Stream> {
        let mut keyed: Vec<(Stream, u64, Option<Instant>)> = self
            .buffers
            .buffered_streams()
            .into_iter()
            .map(|s| {
                let bytes = self.buffers.queue_size_bytes(&s).unwrap_or(0);
                let last = self.buffers.time_of_last_record(&s);
                (s, bytes, last)
            })
            .collect();

        keyed.sort_by(|(sa, ba, ta), (sb, bb, tb)| {
            bb.cmp(ba)
                .then_with(|| oldest_first(ta, tb))
                .then_with(|| sa.cmp(sb))
        });
        keyed.into_iter().map(|(s, _, _)| s).collect()
    }

    /// Bytes already claimed by running jobs for the stream.
    pub fn estimate_in_flight_bytes(&self, stream: &Stream, buffered: u64) -> u64 {
        let penalty = self.optimal_batch_size_bytes.min(buffered);
        self.running
            .batch_sizes(stream)
            .into_iter()
            .map(|size| size.unwrap_or(penalty))
            .sum()
    }

    fn is_time_triggered(&self, stream: &Stream, now: Instant) -> bool {
        let mut last_flush = self.last_flush.lock();
        let last = *last_flush.entry(stream.clone()).or_insert(now);
        now.duration_since(last) >= self.max_time_between_flushes
    }
}

/// `None` sorts after every timestamp.
fn oldest_first(a: &Option<Instant>, b: &Option<Instant>) -> CmpOrdering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;
    use crate::message::Record;
    use crate::state::StateManager;
    use serde_json::json;

    const MB: u64 = 1024 * 1024;

    struct Fixture {
        buffers: Arc<StreamBuffers>,
        running: Arc<RunningFlushWorkers>,
        detector: FlushDetector,
    }

    fn fixture(max_time: Duration) -> Fixture {
        let buffers = Arc::new(StreamBuffers::new(
            Arc::new(MemoryManager::new(1024 * MB, 10 * MB)),
            Arc::new(StateManager::new()),
            Duration::from_millis(1),
        ));
        let running = Arc::new(RunningFlushWorkers::new());
        let settings = FlushSettings {
            max_time_between_flushes: max_time,
            ..FlushSettings::default()
        };
        let detector = FlushDetector::new(buffers.clone(), running.clone(), &settings, 100, 150);
        Fixture {
            buffers,
            running,
            detector,
        }
    }

    async fn fill(buffers: &StreamBuffers, stream: &Stream, records: u64, size: u64) {
        for i in 0..records {
            let record = Record {
                stream: stream.clone(),
                index: i,
                size_bytes: size,
                data: json!(i),
                emitted_at: None,
            };
            buffers.add_record(record, size).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_threshold_default_and_closing() {
        let f = fixture(Duration::from_secs(300));
        assert_eq!(f.detector.compute_threshold_bytes(), 150);
        f.detector.set_closing(true);
        assert_eq!(f.detector.compute_threshold_bytes(), 0);
    }

    #[tokio::test]
    async fn test_threshold_zero_when_budget_nearly_full() {
        let buffers = Arc::new(StreamBuffers::new(
            Arc::new(MemoryManager::new(100, 95)),
            Arc::new(StateManager::new()),
            Duration::from_millis(1),
        ));
        let detector = FlushDetector::new(
            buffers.clone(),
            Arc::new(RunningFlushWorkers::new()),
            &FlushSettings::default(),
            50,
            50,
        );
        fill(&buffers, &Stream::new("users"), 1, 10).await;
        assert_eq!(detector.compute_threshold_bytes(), 0);
    }

    #[tokio::test]
    async fn test_size_trigger_without_running_workers() {
        let f = fixture(Duration::from_secs(300));
        let users = Stream::new("users");
        fill(&f.buffers, &users, 20, 10).await;

        assert_eq!(f.detector.next_stream_to_flush(150), Some(users));
    }

    #[tokio::test]
    async fn test_running_worker_penalty_suppresses_flush() {
        let f = fixture(Duration::from_secs(300));
        let users = Stream::new("users");
        fill(&f.buffers, &users, 20, 10).await;

        // Unknown size: charged min(optimal=100, buffered=200) = 100 → 100 effective.
        let worker = f.running.track(&users);
        assert_eq!(f.detector.estimate_in_flight_bytes(&users, 200), 100);
        assert_eq!(f.detector.next_stream_to_flush(150), None);

        // Known small size: 200 - 20 = 180 effective.
        f.running.register_batch_size(&users, worker, 20);
        assert_eq!(f.detector.next_stream_to_flush(150), Some(users));
    }

    #[tokio::test]
    async fn test_time_trigger_fires_below_threshold() {
        let f = fixture(Duration::from_millis(20));
        let users = Stream::new("users");
        fill(&f.buffers, &users, 1, 10).await;

        // First evaluation starts the clock.
        assert_eq!(f.detector.next_stream_to_flush(150), None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.detector.next_stream_to_flush(150), Some(users.clone()));
        // Returning the stream reset its timer.
        assert_eq!(f.detector.next_stream_to_flush(150), None);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let f = fixture(Duration::from_secs(300));
        let small = Stream::new("small");
        let big = Stream::new("big");
        let tie_b = Stream::new("tie_b");
        let tie_a = Stream::new("tie_a");

        fill(&f.buffers, &small, 1, 10).await;
        fill(&f.buffers, &big, 5, 10).await;
        fill(&f.buffers, &tie_b, 2, 10).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        fill(&f.buffers, &tie_a, 2, 10).await;

        let order = f.detector.streams_by_priority();
        // tie_b received its last record earlier, so it precedes tie_a.
        assert_eq!(order, vec![big, tie_b, tie_a, small]);
    }

    #[test]
    fn test_oldest_first_puts_none_last() {
        let now = Instant::now();
        assert_eq!(oldest_first(&Some(now), &None), CmpOrdering::Less);
        assert_eq!(oldest_first(&None, &Some(now)), CmpOrdering::Greater);
        assert_eq!(oldest_first(&None, &None), CmpOrdering::Equal);
    }
}

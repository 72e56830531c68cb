//! Task runner core: struct and run loop.
//!
//! Control combinators are interpreted inline by the loop (see `dispatch`);
//! plain tasks are spawned and report back on the completion channel.
//!
//! ```text
//!   ┌──────────── WorkQueue ◄───────────────────────────┐
//!   │                                                   │ next task
//!   ▼                                                   │
//!  loop ──► control? ── interpret, enqueue follow-ups ──┤
//!   │                                                   │
//!   └──► plain ── limits ok? ── spawn ── TaskCompletion ┘
//!                     │
//!                     └── no: defer (re-enqueue)
//! ```
//!
//! The loop stops after `Terminate`, or on the first task failure, once the
//! tasks already in flight have reported back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::abort::AbortSignal;
use super::concurrency::ConcurrencyCounters;
use super::config::RunnerConfig;
use super::queue::WorkQueue;
use super::task::{ScheduledTask, Task, TaskResult};
use super::telemetry::{NullTelemetrySink, TelemetryEvent, TelemetrySink};
use super::watchdog::{LoopHeartbeat, StallWatchdog};
use crate::error::LoadError;
use crate::message::MessageQueue;
use crate::stream::{Catalog, Stream};

/// Number of loop iterations between yield points (scheduler fairness).
pub(crate) const YIELD_EVERY_N_ITERATIONS: u64 = 50;

/// Wait applied when a full pass over the queue made no progress.
pub(crate) const IDLE_BACKOFF: Duration = Duration::from_millis(2);

/// Sent by a spawned task when it finishes.
pub(crate) struct TaskCompletion {
    pub task: Box<dyn Task>,
    pub result: TaskResult,
    pub duration: Duration,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Plain tasks spawned.
    pub dispatched: u64,
    /// Plain tasks that finished successfully.
    pub completed: u64,
    /// Plain tasks that returned an error or panicked.
    pub failed: u64,
    /// Dispatch attempts put back because a limit was reached.
    pub deferred: u64,
    /// Control combinators interpreted.
    pub control_handled: u64,
    /// Streams whose completion marker was consumed on every shard.
    pub streams_completed: u64,
}

// =============================================================================
// Task Runner
// =============================================================================

/// Executes a task graph from a [`WorkQueue`] until it terminates.
pub struct TaskRunner {
    pub(crate) config: RunnerConfig,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) messages: Arc<MessageQueue>,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) limits: ConcurrencyCounters,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,

    pub(crate) completion_tx: mpsc::UnboundedSender<TaskCompletion>,
    completion_rx: mpsc::UnboundedReceiver<TaskCompletion>,

    /// Plain tasks spawned and not yet reported back.
    pub(crate) in_flight: usize,

    /// Named counters for increment/decrement/gate combinators.
    pub(crate) counters: HashMap<String, i64>,

    /// Ids already claimed by `OnceOnly`.
    pub(crate) seen_once: HashSet<String>,

    completed_streams: HashSet<Stream>,

    /// Consecutive queue entries handled without progress.
    pub(crate) unproductive: usize,

    pub(crate) terminated: bool,
    failure: Option<LoadError>,
    abort: AbortSignal,
    pub(crate) stats: RunStats,

    heartbeat: Arc<LoopHeartbeat>,
    loop_count: u64,
}

impl TaskRunner {
    pub fn new(
        config: RunnerConfig,
        catalog: Arc<Catalog>,
        messages: Arc<MessageQueue>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            config,
            catalog,
            messages,
            queue,
            limits: ConcurrencyCounters::new(),
            telemetry: Arc::new(NullTelemetrySink),
            completion_tx,
            completion_rx,
            in_flight: 0,
            counters: HashMap::new(),
            seen_once: HashSet::new(),
            completed_streams: HashSet::new(),
            unproductive: 0,
            terminated: false,
            failure: None,
            abort: AbortSignal::new(),
            stats: RunStats::default(),
            heartbeat: Arc::new(LoopHeartbeat::new()),
            loop_count: 0,
        }
    }

    /// Replaces the telemetry sink.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Lets another task fail the run through `signal`.
    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    /// Concurrency counters, shared with the spawned tasks' permits.
    pub fn concurrency(&self) -> ConcurrencyCounters {
        self.limits.clone()
    }

    /// Runs the graph until `Terminate` or the first failure.
    pub async fn run(mut self) -> Result<RunStats, LoadError> {
        let shutdown = CancellationToken::new();
        self.spawn_watchdog(shutdown.clone());
        let _watchdog = shutdown.drop_guard();

        info!(
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            streams = self.catalog.len(),
            "Task runner started"
        );

        while !self.is_finished() {
            self.update_activity_timestamp();

            if self.is_stopping() {
                // Only wait for what is already running.
                match self.completion_rx.recv().await {
                    Some(completion) => self.handle_completion(completion),
                    None => break,
                }
            } else {
                tokio::select! {
                    biased;

                    _ = self.abort.aborted() => self.handle_abort(),

                    Some(completion) = self.completion_rx.recv() => {
                        self.handle_completion(completion);
                    }

                    next = self.queue.dequeue() => match next {
                        Some(task) => self.handle_scheduled(task).await,
                        None => self.handle_queue_closed().await,
                    },
                }

                if self.unproductive > self.queue.len() {
                    self.back_off().await;
                }
            }

            self.update_pending_work_count();
            self.maybe_yield().await;
        }

        debug!(abandoned = self.queue.len(), "Task runner loop exited");
        match self.failure.take() {
            Some(err) => {
                error!(error = %err, stats = ?self.stats, "Task runner failed");
                Err(err)
            }
            None => {
                info!(
                    dispatched = self.stats.dispatched,
                    deferred = self.stats.deferred,
                    control = self.stats.control_handled,
                    streams = self.stats.streams_completed,
                    "Task runner finished"
                );
                Ok(self.stats)
            }
        }
    }

    /// True after `Terminate` or a failure.
    fn is_stopping(&self) -> bool {
        self.terminated || self.failure.is_some()
    }

    fn is_finished(&self) -> bool {
        self.is_stopping() && self.in_flight == 0
    }

    /// Records a task's outcome and enqueues its successor.
    fn handle_completion(&mut self, completion: TaskCompletion) {
        let TaskCompletion {
            task,
            result,
            duration,
        } = completion;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.unproductive = 0;
        let stream = task.stream().cloned();

        match result {
            Ok(next) => {
                self.stats.completed += 1;
                self.telemetry.emit(TelemetryEvent::TaskCompleted {
                    task: task.name().to_string(),
                    stream: stream.clone(),
                    duration,
                });
                self.push(next);

                let Some(stream) = stream else {
                    return;
                };
                if self.messages.is_stream_complete(&stream) {
                    self.mark_stream_completed(stream);
                } else if task.consumes_stream() && !self.is_stopping() {
                    self.queue.enqueue(ScheduledTask::Plain(task));
                }
            }
            Err(err) => {
                self.stats.failed += 1;
                error!(
                    task = task.name(),
                    stream = ?stream,
                    error = %err,
                    "Task failed, stopping dispatch"
                );
                self.telemetry.emit(TelemetryEvent::TaskFailed {
                    task: task.name().to_string(),
                    stream,
                    error: err.to_string(),
                });
                if self.failure.is_none() {
                    self.failure = Some(err);
                }
            }
        }
    }

    /// Stops dispatch with the abort reason; in-flight tasks still drain.
    fn handle_abort(&mut self) {
        let err = self.abort.reason().unwrap_or_else(|| {
            LoadError::Protocol("run aborted without a reason".to_string())
        });
        error!(error = %err, in_flight = self.in_flight, "Run aborted, stopping dispatch");
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    fn mark_stream_completed(&mut self, stream: Stream) {
        if self.completed_streams.insert(stream.clone()) {
            info!(stream = %stream, "Stream input consumed");
            self.stats.streams_completed += 1;
            self.telemetry
                .emit(TelemetryEvent::StreamCompleted { stream });
        }
    }

    /// The queue was closed and drained without a `Terminate`.
    async fn handle_queue_closed(&mut self) {
        if self.in_flight > 0 {
            if let Some(completion) = self.completion_rx.recv().await {
                self.handle_completion(completion);
            }
            return;
        }
        self.failure = Some(LoadError::Protocol(
            "work queue closed before the task graph terminated".to_string(),
        ));
    }

    /// Waits briefly for a completion after a pass with no progress.
    async fn back_off(&mut self) {
        tokio::select! {
            Some(completion) = self.completion_rx.recv() => {
                self.handle_completion(completion);
            }
            _ = tokio::time::sleep(IDLE_BACKOFF) => {}
        }
        self.unproductive = 0;
    }

    /// Enqueues a follow-up task. `Noop` is dropped here.
    pub(crate) fn push(&self, task: ScheduledTask) {
        if !matches!(task, ScheduledTask::Noop) {
            self.queue.enqueue(task);
        }
    }

    fn spawn_watchdog(&self, shutdown: CancellationToken) {
        let watchdog = StallWatchdog::new(Arc::clone(&self.heartbeat))
            .with_timing(self.config.stall_threshold, self.config.watchdog_interval);
        tokio::spawn(watchdog.run(shutdown));
    }

    fn update_activity_timestamp(&self) {
        self.heartbeat.touch();
    }

    fn update_pending_work_count(&self) {
        self.heartbeat.set_pending(self.queue.len() + self.in_flight);
    }

    /// Yields periodically for scheduler fairness.
    async fn maybe_yield(&mut self) {
        self.loop_count += 1;
        if self.loop_count % YIELD_EVERY_N_ITERATIONS == 0 {
            tokio::task::yield_now().await;
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("in_flight", &self.in_flight)
            .field("queued", &self.queue.len())
            .field("terminated", &self.terminated)
            .field("loop_count", &self.loop_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::scheduler::task::Concurrency;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Harness {
        queue: Arc<WorkQueue>,
        messages: Arc<MessageQueue>,
        runner: TaskRunner,
    }

    fn harness(streams: &[&str]) -> Harness {
        let catalog = Arc::new(Catalog::new(streams.iter().map(|s| Stream::new(*s))));
        let settings = QueueSettings {
            consumer_timeout: Duration::from_millis(30),
            wait_time: Duration::from_millis(5),
            ..QueueSettings::default()
        };
        let messages = Arc::new(MessageQueue::new(&catalog, &settings));
        let queue = Arc::new(WorkQueue::new());
        let runner = TaskRunner::new(
            RunnerConfig::default(),
            catalog,
            Arc::clone(&messages),
            Arc::clone(&queue),
        );
        Harness {
            queue,
            messages,
            runner,
        }
    }

    /// Decrements `work` and terminates once it reaches zero.
    fn finish_work() -> ScheduledTask {
        ScheduledTask::decrement("work", || {
            ScheduledTask::gate_on_counter_zero("work", || {
                ScheduledTask::once_only("done", || ScheduledTask::Terminate)
            })
        })
    }

    struct Counting {
        hits: Arc<AtomicUsize>,
        next: fn() -> ScheduledTask,
    }

    impl Task for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn execute(&self) -> BoxFuture<'_, TaskResult> {
            Box::pin(async move {
                self.hits.fetch_add(1, Ordering::SeqCst);
                Ok((self.next)())
            })
        }
    }

    struct Slow {
        limits: Concurrency,
        stream: Option<Stream>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Task for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn concurrency(&self) -> Option<&Concurrency> {
            Some(&self.limits)
        }

        fn stream(&self) -> Option<&Stream> {
            self.stream.as_ref()
        }

        fn execute(&self) -> BoxFuture<'_, TaskResult> {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(finish_work())
            })
        }
    }

    struct Failing;

    impl Task for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn execute(&self) -> BoxFuture<'_, TaskResult> {
            Box::pin(async { Err(LoadError::Protocol("boom".to_string())) })
        }
    }

    struct Panicking;

    impl Task for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn execute(&self) -> BoxFuture<'_, TaskResult> {
            Box::pin(async { panic!("kaboom") })
        }
    }

    struct Hold {
        released: Arc<AtomicBool>,
    }

    impl Task for Hold {
        fn name(&self) -> &str {
            "hold"
        }

        fn execute(&self) -> BoxFuture<'_, TaskResult> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                self.released.store(true, Ordering::SeqCst);
                Ok(ScheduledTask::decrement("work", || ScheduledTask::Noop))
            })
        }
    }

    #[tokio::test]
    async fn test_gate_waits_for_counter_zero_and_fires_once() {
        let h = harness(&["users"]);
        let released = Arc::new(AtomicBool::new(false));
        let opened_early = Arc::new(AtomicBool::new(false));
        let gate_hits = Arc::new(AtomicUsize::new(0));

        let held = Arc::clone(&released);
        h.queue.enqueue(ScheduledTask::increment("work", move || {
            ScheduledTask::plain(Hold { released: held })
        }));
        let (seen, early, hits) = (
            Arc::clone(&released),
            Arc::clone(&opened_early),
            Arc::clone(&gate_hits),
        );
        h.queue
            .enqueue(ScheduledTask::gate_on_counter_zero("work", move || {
                if !seen.load(Ordering::SeqCst) {
                    early.store(true, Ordering::SeqCst);
                }
                hits.fetch_add(1, Ordering::SeqCst);
                ScheduledTask::Terminate
            }));

        tokio::time::timeout(Duration::from_secs(5), h.runner.run())
            .await
            .unwrap()
            .unwrap();
        assert!(!opened_early.load(Ordering::SeqCst));
        assert_eq!(gate_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runs_until_terminate() {
        let h = harness(&["users"]);
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        h.queue.enqueue(ScheduledTask::replicate(5, move |_| {
            let hits = Arc::clone(&counted);
            ScheduledTask::increment("work", move || {
                ScheduledTask::plain(Counting {
                    hits,
                    next: finish_work,
                })
            })
        }));

        let stats = h.runner.run().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(stats.dispatched, 5);
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_once_only_runs_builder_once() {
        let h = harness(&["users"]);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            h.queue.enqueue(ScheduledTask::once_only("setup", move || {
                ScheduledTask::plain(Counting {
                    hits,
                    next: || ScheduledTask::Noop,
                })
            }));
        }
        h.queue.enqueue(ScheduledTask::Terminate);

        h.runner.run().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fan_out_per_stream() {
        let h = harness(&["users", "orders", "items"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        h.queue
            .enqueue(ScheduledTask::fan_out_per_stream(move |stream: &Stream| {
                record.lock().push(stream.clone());
                ScheduledTask::Noop
            }));
        h.queue.enqueue(ScheduledTask::Terminate);

        h.runner.run().await.unwrap();
        let mut names: Vec<String> = seen.lock().iter().map(|s| s.to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["items", "orders", "users"]);
    }

    #[tokio::test]
    async fn test_fan_out_available_uses_smallest_limit() {
        for (limits, expected) in [
            (Concurrency::new("slow", 3, 0), 3),
            (Concurrency::new("slow", 4, 2), 2),
            (Concurrency::unbounded("slow"), 1),
        ] {
            let h = harness(&["users"]);
            let built = Arc::new(AtomicUsize::new(0));
            let b = Arc::clone(&built);
            h.queue.enqueue(ScheduledTask::fan_out_available(move |_| {
                b.fetch_add(1, Ordering::SeqCst);
                ScheduledTask::plain(Slow {
                    limits: limits.clone(),
                    stream: None,
                    running: Arc::new(AtomicUsize::new(0)),
                    peak: Arc::new(AtomicUsize::new(0)),
                })
            }));
            h.queue.enqueue(ScheduledTask::Terminate);

            h.runner.run().await.unwrap();
            // The instance built to read the limits counts toward the total.
            assert_eq!(built.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test]
    async fn test_per_sync_limit_bounds_concurrency() {
        let h = harness(&["users"]);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        h.queue.enqueue(ScheduledTask::replicate(8, move |_| {
            let task = Slow {
                limits: Concurrency::new("slow", 2, 0),
                stream: None,
                running: r.clone(),
                peak: p.clone(),
            };
            ScheduledTask::increment("work", move || ScheduledTask::plain(task))
        }));

        let stats = h.runner.run().await.unwrap();
        assert_eq!(stats.completed, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(stats.deferred > 0);
    }

    #[tokio::test]
    async fn test_per_stream_limit_bounds_each_stream() {
        let h = harness(&["users", "orders"]);
        let counters = h.runner.concurrency();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        h.queue.enqueue(ScheduledTask::replicate(6, move |i| {
            let stream = if i % 2 == 0 { "users" } else { "orders" };
            let task = Slow {
                limits: Concurrency::new("slow", 0, 1),
                stream: Some(Stream::new(stream)),
                running: r.clone(),
                peak: p.clone(),
            };
            ScheduledTask::increment("work", move || ScheduledTask::plain(task))
        }));

        h.runner.run().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(counters.peak_for_stream("slow", &Stream::new("users")), 1);
        assert_eq!(counters.peak_for_stream("slow", &Stream::new("orders")), 1);
        assert_eq!(counters.in_flight("slow"), 0);
    }

    #[tokio::test]
    async fn test_failure_stops_run_after_in_flight_drains() {
        let h = harness(&["users"]);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        h.queue.enqueue(ScheduledTask::plain(Slow {
            limits: Concurrency::unbounded("slow"),
            stream: None,
            running: Arc::clone(&running),
            peak: Arc::clone(&peak),
        }));
        h.queue.enqueue(ScheduledTask::plain(Failing));

        let err = h.runner.run().await.unwrap_err();
        assert!(matches!(err, LoadError::Protocol(ref m) if m == "boom"));
        // The sibling finished before the runner returned.
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_task_panicked() {
        let h = harness(&["users"]);
        h.queue.enqueue(ScheduledTask::plain(Panicking));

        let err = h.runner.run().await.unwrap_err();
        match err {
            LoadError::TaskPanicked { task, reason } => {
                assert_eq!(task, "panicking");
                assert!(reason.contains("kaboom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_closed_queue_without_terminate_is_protocol_error() {
        let h = harness(&["users"]);
        h.queue.enqueue(ScheduledTask::Noop);
        h.queue.close();

        let err = h.runner.run().await.unwrap_err();
        assert!(matches!(err, LoadError::Protocol(_)));
    }

    /// Reads one shard until the completion marker.
    struct Drain {
        messages: Arc<MessageQueue>,
        stream: Stream,
        records: Arc<AtomicUsize>,
        finished: AtomicBool,
    }

    impl Task for Drain {
        fn name(&self) -> &str {
            "drain"
        }

        fn stream(&self) -> Option<&Stream> {
            Some(&self.stream)
        }

        fn consumes_stream(&self) -> bool {
            !self.finished.load(Ordering::SeqCst)
        }

        fn execute(&self) -> BoxFuture<'_, TaskResult> {
            Box::pin(async move {
                let mut reader = self.messages.open(&self.stream, 0)?;
                while let Some(message) = reader.next().await {
                    match message {
                        crate::message::Message::Record(_) => {
                            self.records.fetch_add(1, Ordering::SeqCst);
                        }
                        crate::message::Message::EndOfStream => {
                            self.finished.store(true, Ordering::SeqCst);
                        }
                        crate::message::Message::Timeout => {}
                    }
                }
                Ok(ScheduledTask::Noop)
            })
        }
    }

    #[tokio::test]
    async fn test_abort_stops_a_waiting_graph() {
        let h = harness(&["users"]);
        let signal = AbortSignal::new();
        h.queue
            .enqueue(ScheduledTask::gate_on_stream_complete(Stream::new("users"), || {
                ScheduledTask::Terminate
            }));
        let runner = h.runner.with_abort(signal.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signal.abort(LoadError::Deserialize("input line 7: bad".into()));
        });

        let err = tokio::time::timeout(Duration::from_secs(5), runner.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, LoadError::Deserialize(ref m) if m.contains("line 7")));
    }

    #[tokio::test]
    async fn test_consuming_task_requeued_until_stream_complete() {
        let h = harness(&["users"]);
        let users = Stream::new("users");
        let records = Arc::new(AtomicUsize::new(0));

        h.queue.enqueue(ScheduledTask::plain(Drain {
            messages: Arc::clone(&h.messages),
            stream: users.clone(),
            records: Arc::clone(&records),
            finished: AtomicBool::new(false),
        }));
        h.queue
            .enqueue(ScheduledTask::gate_on_stream_complete(users, || {
                ScheduledTask::Terminate
            }));

        let messages = Arc::clone(&h.messages);
        tokio::spawn(async move {
            for id in 0..3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                messages
                    .publish_line(&format!(
                        r#"{{"type":"RECORD","stream":"users","data":{{"id":{}}}}}"#,
                        id
                    ))
                    .unwrap();
            }
            messages
                .publish_line(r#"{"type":"STREAM_COMPLETE","stream":"users"}"#)
                .unwrap();
        });

        let stats = tokio::time::timeout(Duration::from_secs(5), h.runner.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(records.load(Ordering::SeqCst), 3);
        assert_eq!(stats.streams_completed, 1);
        assert!(stats.dispatched >= 1);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        #[test]
        fn test_limits_hold_for_any_task_mix(
            tasks in 1usize..14,
            per_sync in 1usize..4,
            per_stream in 1usize..3,
            stream_count in 1usize..4,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let names: Vec<String> = (0..stream_count).map(|i| format!("s{}", i)).collect();
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                let h = harness(&refs);
                let counters = h.runner.concurrency();
                let running = Arc::new(AtomicUsize::new(0));
                let peak = Arc::new(AtomicUsize::new(0));
                let (r, p) = (running.clone(), peak.clone());
                let streams = names.clone();
                h.queue.enqueue(ScheduledTask::replicate(tasks, move |i| {
                    let task = Slow {
                        limits: Concurrency::new("slow", per_sync, per_stream),
                        stream: Some(Stream::new(&streams[i % streams.len()])),
                        running: r.clone(),
                        peak: p.clone(),
                    };
                    ScheduledTask::increment("work", move || ScheduledTask::plain(task))
                }));

                let stats = h.runner.run().await.unwrap();
                proptest::prop_assert_eq!(stats.completed, tasks as u64);
                proptest::prop_assert!(peak.load(Ordering::SeqCst) <= per_sync);
                proptest::prop_assert!(counters.peak("slow") <= per_sync);
                for name in &names {
                    let stream = Stream::new(name.as_str());
                    proptest::prop_assert!(counters.peak_for_stream("slow", &stream) <= per_stream);
                }
                proptest::prop_assert_eq!(counters.in_flight("slow"), 0);
                Ok(())
            })?;
        }
    }
}

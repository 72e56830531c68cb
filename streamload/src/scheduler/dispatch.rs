//! Dispatching queue entries.
//!
//! Control combinators are interpreted here, on the loop, and never occupy a
//! worker slot. Plain tasks go through the global ceiling and the
//! per-type/per-stream counters before they are spawned; a task that does
//! not fit is put back at the tail of the queue.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::concurrency::{ConcurrencyPermit, DeferReason};
use super::runner::{TaskCompletion, TaskRunner};
use super::task::{IndexedTaskBuilder, ScheduledTask, Task};
use super::telemetry::TelemetryEvent;
use crate::error::LoadError;

impl TaskRunner {
    /// Handles one dequeued entry.
    pub(crate) async fn handle_scheduled(&mut self, scheduled: ScheduledTask) {
        let kind = scheduled.kind();
        let progressed = match scheduled {
            ScheduledTask::Plain(task) => {
                self.dispatch_plain(task);
                return;
            }
            ScheduledTask::Terminate => {
                debug!(in_flight = self.in_flight, "Terminate reached");
                self.terminated = true;
                true
            }
            ScheduledTask::FanOutPerStream(builder) => {
                for stream in self.catalog.streams() {
                    self.push(builder(stream));
                }
                true
            }
            ScheduledTask::FanOutAvailable(builder) => {
                self.fan_out_available(builder);
                true
            }
            ScheduledTask::Replicate { count, builder } => {
                for i in 0..count {
                    self.push(builder(i));
                }
                true
            }
            ScheduledTask::OnceOnly { id, builder } => {
                if self.seen_once.insert(id.clone()) {
                    self.push(builder());
                } else {
                    trace!(id = %id, "Once-only task already claimed");
                }
                true
            }
            ScheduledTask::GateOnCounterZero { id, builder } => {
                if self.counter(&id) == 0 {
                    self.push(builder());
                    true
                } else {
                    self.queue
                        .enqueue(ScheduledTask::GateOnCounterZero { id, builder });
                    false
                }
            }
            ScheduledTask::GateOnStreamComplete { stream, builder } => {
                if self.messages.is_stream_complete(&stream) {
                    self.push(builder());
                    true
                } else {
                    self.queue
                        .enqueue(ScheduledTask::GateOnStreamComplete { stream, builder });
                    false
                }
            }
            ScheduledTask::IncrementCounter { id, builder } => {
                *self.counters.entry(id).or_insert(0) += 1;
                self.push(builder());
                true
            }
            ScheduledTask::DecrementCounter { id, builder } => {
                let value = self.counters.entry(id.clone()).or_insert(0);
                *value -= 1;
                if *value < 0 {
                    warn!(id = %id, value = *value, "Counter decremented below zero");
                }
                self.push(builder());
                true
            }
            ScheduledTask::Noop => true,
        };

        self.stats.control_handled += 1;
        self.telemetry
            .emit(TelemetryEvent::ControlTaskHandled { kind });
        if progressed {
            self.unproductive = 0;
        } else {
            self.unproductive += 1;
        }
        tokio::task::yield_now().await;
    }

    /// Current value of a named counter.
    pub(crate) fn counter(&self, id: &str) -> i64 {
        self.counters.get(id).copied().unwrap_or(0)
    }

    /// Enqueues one instance per available slot of the task type.
    ///
    /// The first instance is built to read the type's limits; the smaller
    /// non-zero limit wins, and unbounded types get a single instance.
    fn fan_out_available(&mut self, builder: IndexedTaskBuilder) {
        let first = builder(0);
        let count = match &first {
            ScheduledTask::Plain(task) => task
                .concurrency()
                .map_or(1, |c| c.available_parallelism()),
            _ => 1,
        };
        trace!(count, "Fanning out to available slots");
        self.push(first);
        for i in 1..count {
            self.push(builder(i));
        }
    }

    fn dispatch_plain(&mut self, task: Box<dyn Task>) {
        if self.in_flight >= self.config.max_concurrent_tasks {
            self.defer(task, DeferReason::GlobalLimit);
            return;
        }
        match self.limits.try_acquire(task.concurrency(), task.stream()) {
            Ok(permit) => self.spawn_task(task, permit),
            Err(reason) => self.defer(task, reason),
        }
    }

    fn defer(&mut self, task: Box<dyn Task>, reason: DeferReason) {
        trace!(task = task.name(), reason = %reason, "Task deferred");
        self.stats.deferred += 1;
        self.unproductive += 1;
        self.telemetry.emit(TelemetryEvent::TaskDeferred {
            task: task.name().to_string(),
            stream: task.stream().cloned(),
            reason,
        });
        self.queue.enqueue(ScheduledTask::Plain(task));
    }

    /// Spawns a plain task.
    ///
    /// The permit moves into the spawned future and is dropped before the
    /// completion is sent, so the slot is free by the time the loop sees it.
    fn spawn_task(&mut self, task: Box<dyn Task>, permit: ConcurrencyPermit) {
        self.in_flight += 1;
        self.unproductive = 0;
        self.stats.dispatched += 1;

        trace!(task = task.name(), stream = ?task.stream(), "Task dispatched");
        self.telemetry.emit(TelemetryEvent::TaskDispatched {
            task: task.name().to_string(),
            stream: task.stream().cloned(),
        });

        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(task.execute()).catch_unwind().await;
            drop(permit);

            let result = outcome.unwrap_or_else(|payload| {
                Err(LoadError::TaskPanicked {
                    task: task.name().to_string(),
                    reason: panic_reason(payload.as_ref()),
                })
            });
            let _ = completion_tx.send(TaskCompletion {
                task,
                result,
                duration: started.elapsed(),
            });
        });
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

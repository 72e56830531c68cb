//! FIFO work queue shared by the runner and its producers.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use super::task::ScheduledTask;

/// Unbounded FIFO of scheduled tasks.
///
/// `dequeue` waits for work; it returns `None` only once the queue is closed
/// and empty.
#[derive(Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<ScheduledTask>>,
    notify: Notify,
    closed: AtomicBool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task and wakes one waiter.
    pub fn enqueue(&self, task: ScheduledTask) {
        self.items.lock().push_back(task);
        self.notify.notify_one();
    }

    /// Pops the head without waiting.
    pub fn try_dequeue(&self) -> Option<ScheduledTask> {
        self.items.lock().pop_front()
    }

    /// Pops the head, waiting for work if the queue is empty.
    pub async fn dequeue(&self) -> Option<ScheduledTask> {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.try_dequeue() {
                return Some(task);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Stops waiters once the remaining items are drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

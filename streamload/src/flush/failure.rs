//! First-failure slot shared by flush jobs and the consumer.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::LoadError;

/// Keeps the first failure of a run; later failures are logged and dropped.
///
/// The consumer checks [`FlushFailure::check`] before accepting input so no
/// record is silently accepted after a flush has failed. Producers parked on
/// the memory budget wait on [`FlushFailure::failed`] as well.
#[derive(Debug, Default)]
pub struct FlushFailure {
    failed: AtomicBool,
    error: Mutex<Option<LoadError>>,
    tripped: CancellationToken,
}

impl FlushFailure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure if none is recorded yet.
    pub fn propagate(&self, err: LoadError) {
        let mut slot = self.error.lock();
        if slot.is_some() {
            warn!(error = %err, "Additional failure after the first, dropping");
            return;
        }
        error!(error = %err, "Run failed");
        *slot = Some(err);
        self.failed.store(true, Ordering::SeqCst);
        drop(slot);
        self.tripped.cancel();
    }

    /// Resolves once a failure has been recorded.
    pub async fn failed(&self) {
        self.tripped.cancelled().await
    }

    /// Fast check without taking the lock.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// The first failure, if any.
    pub fn error(&self) -> Option<LoadError> {
        self.error.lock().clone()
    }

    /// Returns the first failure as an error.
    pub fn check(&self) -> Result<(), LoadError> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

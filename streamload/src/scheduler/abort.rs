//! External stop requests for a running task graph.
//!
//! Input runs beside the scheduler. When input fails, the feeding side calls
//! [`AbortSignal::abort`]; the dispatch loop stops handing out work, waits
//! for what is in flight and returns the recorded error, so the lifecycle
//! cleans up with `succeeded = false`.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LoadError;

/// Cloneable handle that fails a run from outside the scheduler.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<LoadError>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the run to stop with `err`. Only the first reason is kept.
    pub fn abort(&self, err: LoadError) {
        {
            let mut reason = self.reason.lock();
            if reason.is_some() {
                debug!(error = %err, "Run already aborted, dropping reason");
                return;
            }
            warn!(error = %err, "Aborting run");
            *reason = Some(err);
        }
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`AbortSignal::abort`] has been called.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    /// The abort reason, if any.
    pub fn reason(&self) -> Option<LoadError> {
        self.reason.lock().clone()
    }
}

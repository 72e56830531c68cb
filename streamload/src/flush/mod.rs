//! Flush orchestration for the buffered path.
//!
//! - [`FlushDetector`]: size/time triggers and stream priority
//! - [`FlushWorkers`]: supervisor tick and flush jobs
//! - [`WorkerPool`]: bounded job capacity
//! - [`RunningFlushWorkers`]: in-flight jobs for penalty estimation
//! - [`FlushFailure`]: the run's first failure

mod detector;
mod failure;
mod pool;
mod running;
mod workers;

pub use detector::FlushDetector;
pub use failure::FlushFailure;
pub use pool::{FlushSlot, WorkerPool};
pub use running::{RunningFlushWorkers, WorkerId};
pub use workers::FlushWorkers;

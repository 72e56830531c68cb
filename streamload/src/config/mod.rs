//! Engine configuration.
//!
//! Settings are grouped by component ([`SchedulerSettings`],
//! [`MemorySettings`], [`FlushSettings`], [`QueueSettings`]) under
//! [`EngineConfig`], and can be loaded from an INI file:
//!
//! ```ini
//! [scheduler]
//! accumulate_concurrency = 2
//!
//! [memory]
//! max_memory = 512MB
//!
//! [queue]
//! shards_per_stream = 2
//! consumer_timeout_ms = 200
//! ```

mod defaults;
mod file;
mod parser;
mod settings;
mod size;
mod writer;

pub use defaults::*;
pub use file::ConfigFileError;
pub use settings::{EngineConfig, FlushSettings, MemorySettings, QueueSettings, SchedulerSettings};
pub use size::{format_size, parse_size, SizeParseError};

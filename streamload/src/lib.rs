//! streamload - destination-side write orchestration for data connectors.
//!
//! This library drives records from an input stream into a destination while
//! bounding concurrency, memory and flush frequency. Two write paths share the
//! same building blocks:
//!
//! - **Task path**: input lines are published into a sharded [`message::MessageQueue`];
//!   the [`scheduler::TaskRunner`] executes the destination lifecycle graph
//!   built by [`lifecycle::DestinationRunner`] (setup → open → accumulate ⇄
//!   process batch → close → teardown).
//!
//! - **Buffered path**: the [`consumer::BufferedConsumer`] appends records to
//!   per-stream [`buffer::StreamBuffers`] under a global [`memory::MemoryManager`]
//!   budget, and [`flush::FlushWorkers`] pick the next stream to flush on a
//!   fixed tick.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use streamload::config::EngineConfig;
//! use streamload::lifecycle::DestinationRunner;
//! use streamload::message::MessageQueue;
//! use streamload::stream::{Catalog, Stream};
//!
//! let config = EngineConfig::default();
//! let catalog = Arc::new(Catalog::new(vec![Stream::new("users")]));
//! let messages = Arc::new(MessageQueue::new(&catalog, &config.queue));
//!
//! let runner = DestinationRunner::new(Arc::new(my_destination), catalog, messages, &config);
//! let stats = runner.run().await?;
//! ```

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod destination;
pub mod error;
pub mod flush;
pub mod input;
pub mod lifecycle;
pub mod logging;
pub mod memory;
pub mod message;
pub mod scheduler;
pub mod state;
pub mod stream;

/// Version of the streamload library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

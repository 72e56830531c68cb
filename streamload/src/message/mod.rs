//! Input messages and the sharded per-stream queue.
//!
//! - [`ProtocolMessage`], [`Record`], [`Message`]: envelope and routed types
//! - [`Deserializer`] / [`JsonDeserializer`]: line decoding
//! - [`MessageQueue`]: sharded channels with timeout-based reads

mod deser;
mod model;
mod queue;

pub use deser::{Deserializer, JsonDeserializer};
pub use model::{
    GlobalStateMessage, Message, ProtocolMessage, Record, RecordMessage, StateMessage,
    StreamDescriptor, TraceMessage,
};
pub use queue::{MessageQueue, MessageQueueWriter, ShardReader};

//! Message types.
//!
//! [`ProtocolMessage`] is the decoded input envelope. [`Record`] is a data
//! record once it has been routed to a stream, and [`Message`] is what a
//! shard read yields to an accumulator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::Stream;

/// Input envelope, tagged by `type`.
///
/// ```json
/// {"type":"RECORD","namespace":"public","stream":"users","data":{"id":1}}
/// {"type":"STATE","stream":"users","data":{"cursor":"2024-01-01"}}
/// {"type":"GLOBAL_STATE","data":{"lsn":42}}
/// {"type":"STREAM_COMPLETE","stream":"users"}
/// {"type":"TRACE","message":"source finished"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolMessage {
    Record(RecordMessage),
    State(StateMessage),
    GlobalState(GlobalStateMessage),
    StreamComplete(StreamDescriptor),
    Trace(TraceMessage),
}

impl ProtocolMessage {
    /// Stream the message refers to, if any.
    pub fn stream(&self) -> Option<Stream> {
        match self {
            ProtocolMessage::Record(r) => Some(Stream::from_parts(r.namespace.clone(), &r.stream)),
            ProtocolMessage::State(s) => Some(Stream::from_parts(s.namespace.clone(), &s.stream)),
            ProtocolMessage::StreamComplete(d) => {
                Some(Stream::from_parts(d.namespace.clone(), &d.stream))
            }
            ProtocolMessage::GlobalState(_) | ProtocolMessage::Trace(_) => None,
        }
    }

    /// Variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Record(_) => "record",
            ProtocolMessage::State(_) => "state",
            ProtocolMessage::GlobalState(_) => "global_state",
            ProtocolMessage::StreamComplete(_) => "stream_complete",
            ProtocolMessage::Trace(_) => "trace",
        }
    }
}

/// A data record as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitted_at: Option<i64>,
}

/// A per-stream checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub data: Value,
}

/// A checkpoint covering every stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStateMessage {
    pub data: Value,
}

/// Names the stream a completion marker refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Diagnostic message from upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMessage {
    #[serde(default)]
    pub message: String,
}

/// A routed data record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub stream: Stream,
    /// Sequence number within the channel that delivered it.
    pub index: u64,
    /// Serialized size, used for memory and chunk accounting.
    pub size_bytes: u64,
    pub data: Value,
    pub emitted_at: Option<i64>,
}

impl Record {
    /// Builds a record from its wire form.
    pub fn from_message(message: RecordMessage, index: u64, size_bytes: u64) -> Self {
        Self {
            stream: Stream::from_parts(message.namespace, message.stream),
            index,
            size_bytes,
            data: message.data,
            emitted_at: message.emitted_at,
        }
    }
}

/// What a shard read yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Record(Record),
    /// The stream's completion marker was read on this shard.
    EndOfStream,
    /// No data arrived within the consumer timeout.
    Timeout,
}

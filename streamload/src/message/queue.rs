//! Sharded per-stream message queue.
//!
//! Each catalog stream owns `N` independent channels (shards). Records are
//! assigned round-robin by the stream's running publish count; a completion
//! marker is broadcast to every shard so each replica observes its own
//! end-of-stream. The stream is complete once every shard has read its
//! marker.
//!
//! ```text
//!             publish()                         open(stream, shard)
//!   line ──► deserialize ──► stream ──► shard = n % N ──► ShardReader ──► Message
//!                                         │
//!                              ┌──────────┴──────────┐
//!                              ▼                     ▼
//!                         [shard 0 FIFO]        [shard 1 FIFO]
//!                         (idx, record)…        (idx, record)…
//!                         (idx, EOS)            (idx, EOS)
//! ```
//!
//! Publishing follows a single-writer discipline: one input loop publishes,
//! many readers consume. Sequence numbers are gap-free per shard.

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::QueueSettings;
use crate::error::LoadError;
use crate::stream::{Catalog, Stream};

use super::deser::{Deserializer, JsonDeserializer};
use super::model::{Message, ProtocolMessage, Record};

/// Sink for decoded messages with their serialized size.
pub trait MessageQueueWriter<T>: Send + Sync {
    fn publish(&self, message: T, size_bytes: u64) -> Result<(), LoadError>;
}

#[derive(Debug)]
enum Entry {
    Record(Record),
    EndOfStream,
}

#[derive(Debug, Default)]
struct ShardChannel {
    entries: Mutex<VecDeque<(u64, Entry)>>,
    next_index: AtomicU64,
    complete: AtomicBool,
}

impl ShardChannel {
    fn push(&self, make: impl FnOnce(u64) -> Entry) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push_back((index, make(index)));
    }

    fn pop(&self) -> Option<(u64, Entry)> {
        self.entries.lock().pop_front()
    }
}

#[derive(Debug)]
struct StreamChannels {
    stream: Stream,
    shards: Vec<ShardChannel>,
    published: AtomicU64,
    ended: AtomicBool,
    complete: AtomicBool,
}

impl StreamChannels {
    fn new(stream: Stream, shard_count: usize) -> Self {
        Self {
            stream,
            shards: (0..shard_count).map(|_| ShardChannel::default()).collect(),
            published: AtomicU64::new(0),
            ended: AtomicBool::new(false),
            complete: AtomicBool::new(false),
        }
    }

    fn mark_shard_complete(&self, shard: usize) {
        if let Some(channel) = self.shards.get(shard) {
            channel.complete.store(true, Ordering::SeqCst);
        }
        let all_done = self.shards.iter().all(|s| s.complete.load(Ordering::SeqCst));
        if all_done && !self.complete.swap(true, Ordering::SeqCst) {
            info!(stream = %self.stream, "Stream complete");
        }
    }
}

/// Per-stream sharded queue between the input loop and accumulators.
pub struct MessageQueue {
    streams: HashMap<Stream, Arc<StreamChannels>>,
    settings: QueueSettings,
    deserializer: JsonDeserializer,
}

impl MessageQueue {
    /// Creates channels for every catalog stream.
    pub fn new(catalog: &Catalog, settings: &QueueSettings) -> Self {
        let shard_count = settings.shards_per_stream.max(1);
        let streams = catalog
            .streams()
            .iter()
            .map(|s| (s.clone(), Arc::new(StreamChannels::new(s.clone(), shard_count))))
            .collect();

        Self {
            streams,
            settings: settings.clone(),
            deserializer: JsonDeserializer,
        }
    }

    /// Number of shards per stream.
    pub fn shard_count(&self) -> usize {
        self.settings.shards_per_stream.max(1)
    }

    /// Decodes a raw line and publishes it.
    pub fn publish_line(&self, line: &str) -> Result<(), LoadError> {
        let message = self.deserializer.deserialize(line)?;
        self.publish(message, line.len() as u64)
    }

    /// Opens a finite read over one shard.
    ///
    /// Each call returns a fresh reader; a reader stops after a chunk, a
    /// timeout, or end-of-stream.
    pub fn open(&self, stream: &Stream, shard: usize) -> Result<ShardReader, LoadError> {
        let channels = self.channels(stream)?;
        if shard >= channels.shards.len() {
            return Err(LoadError::Protocol(format!(
                "shard {} is not registered for stream '{}' ({} shards)",
                shard,
                stream,
                channels.shards.len()
            )));
        }

        Ok(ShardReader {
            channels,
            shard,
            timeout: self.settings.consumer_timeout,
            wait_time: self.settings.wait_time,
            chunk_size_bytes: self.settings.chunk_size_bytes,
            bytes_read: 0,
            started: false,
            finished: false,
        })
    }

    /// True once every shard of the stream has read its completion marker.
    pub fn is_stream_complete(&self, stream: &Stream) -> bool {
        self.streams
            .get(stream)
            .is_some_and(|c| c.complete.load(Ordering::SeqCst))
    }

    /// Entries published to the stream and not yet read.
    pub fn queued(&self, stream: &Stream) -> usize {
        self.streams
            .get(stream)
            .map_or(0, |c| c.shards.iter().map(|s| s.entries.lock().len()).sum())
    }

    /// Publishes a completion marker for every stream that has none yet.
    ///
    /// Used when input ends without markers. Returns the streams ended this
    /// way, in stream order.
    pub fn end_of_input(&self) -> Vec<Stream> {
        let mut ended: Vec<Stream> = self
            .streams
            .values()
            .filter(|channels| !channels.ended.swap(true, Ordering::SeqCst))
            .map(|channels| {
                for shard in &channels.shards {
                    shard.push(|_| Entry::EndOfStream);
                }
                channels.stream.clone()
            })
            .collect();
        ended.sort();
        if !ended.is_empty() {
            warn!(streams = ended.len(), "Input ended before completion markers, ending streams");
        }
        ended
    }

    fn channels(&self, stream: &Stream) -> Result<Arc<StreamChannels>, LoadError> {
        self.streams
            .get(stream)
            .cloned()
            .ok_or_else(|| LoadError::UnknownStream(stream.clone()))
    }
}

impl MessageQueueWriter<ProtocolMessage> for MessageQueue {
    fn publish(&self, message: ProtocolMessage, size_bytes: u64) -> Result<(), LoadError> {
        match message {
            ProtocolMessage::Record(wire) => {
                let stream = Stream::from_parts(wire.namespace.clone(), &wire.stream);
                let channels = self.channels(&stream)?;
                if channels.ended.load(Ordering::SeqCst) {
                    return Err(LoadError::Protocol(format!(
                        "record received for stream '{}' after its completion marker",
                        stream
                    )));
                }
                let n = channels.published.fetch_add(1, Ordering::SeqCst);
                let shard = (n % channels.shards.len() as u64) as usize;
                channels.shards[shard]
                    .push(|index| Entry::Record(Record::from_message(wire, index, size_bytes)));
                Ok(())
            }
            ProtocolMessage::StreamComplete(descriptor) => {
                let stream = Stream::from_parts(descriptor.namespace, descriptor.stream);
                let channels = self.channels(&stream)?;
                if channels.ended.swap(true, Ordering::SeqCst) {
                    debug!(stream = %stream, "Duplicate completion marker ignored");
                    return Ok(());
                }
                debug!(
                    stream = %stream,
                    records = channels.published.load(Ordering::SeqCst),
                    "Completion marker published"
                );
                for shard in &channels.shards {
                    shard.push(|_| Entry::EndOfStream);
                }
                Ok(())
            }
            other @ (ProtocolMessage::State(_)
            | ProtocolMessage::GlobalState(_)
            | ProtocolMessage::Trace(_)) => {
                debug!(kind = other.kind(), "Message not routed on the task path");
                Ok(())
            }
        }
    }
}

/// A finite read over one shard.
///
/// Yields records until the chunk budget is spent, `Timeout` when no data
/// arrives in time, or `EndOfStream` when the shard's marker is read. After
/// that, [`ShardReader::next`] returns `None`.
pub struct ShardReader {
    channels: Arc<StreamChannels>,
    shard: usize,
    timeout: Duration,
    wait_time: Duration,
    chunk_size_bytes: u64,
    bytes_read: u64,
    started: bool,
    finished: bool,
}

impl ShardReader {
    /// Next message, or `None` once the read has stopped.
    pub async fn next(&mut self) -> Option<Message> {
        if self.finished {
            return None;
        }

        if !self.started {
            self.started = true;
            if self.channels.complete.load(Ordering::SeqCst)
                || self.channels.shards[self.shard].complete.load(Ordering::SeqCst)
            {
                self.finished = true;
                return Some(Message::EndOfStream);
            }
        }

        let channel = &self.channels.shards[self.shard];
        let mut waited = Duration::ZERO;
        loop {
            if let Some((_, entry)) = channel.pop() {
                return Some(match entry {
                    Entry::Record(record) => {
                        self.bytes_read += record.size_bytes;
                        if self.bytes_read >= self.chunk_size_bytes {
                            self.finished = true;
                        }
                        Message::Record(record)
                    }
                    Entry::EndOfStream => {
                        self.finished = true;
                        self.channels.mark_shard_complete(self.shard);
                        Message::EndOfStream
                    }
                });
            }

            if waited >= self.timeout {
                self.finished = true;
                return Some(Message::Timeout);
            }
            let step = self.wait_time.min(self.timeout - waited).max(Duration::from_millis(1));
            tokio::time::sleep(step).await;
            waited += step;
        }
    }

    /// Shard index this reader drains.
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Adapts the reader into a stream of messages.
    pub fn into_stream(self) -> BoxStream<'static, Message> {
        stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|message| (message, reader))
        })
        .boxed()
    }
}

//! Line-oriented input for the task path.

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use crate::error::LoadError;
use crate::message::{Deserializer, MessageQueueWriter};

/// Reads newline-delimited messages and publishes them with their byte size.
pub struct LineConsumer<T> {
    deserializer: Arc<dyn Deserializer<T>>,
    writer: Arc<dyn MessageQueueWriter<T>>,
}

impl<T> LineConsumer<T> {
    pub fn new(
        deserializer: Arc<dyn Deserializer<T>>,
        writer: Arc<dyn MessageQueueWriter<T>>,
    ) -> Self {
        Self {
            deserializer,
            writer,
        }
    }

    /// Consumes the reader to EOF. Blank lines are skipped.
    ///
    /// Returns the number of messages published. Stops at the first decode
    /// or publish error.
    pub async fn consume<R>(&self, reader: R) -> Result<u64, LoadError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut published = 0u64;
        let mut line_number = 0u64;

        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let message = self.deserializer.deserialize(&line).map_err(|e| match e {
                LoadError::Deserialize(reason) => {
                    LoadError::Deserialize(format!("input line {}: {}", line_number, reason))
                }
                other => other,
            })?;
            self.writer.publish(message, line.len() as u64)?;
            published += 1;
        }

        debug!(lines = line_number, "Input reached EOF");
        info!(messages = published, "Input consumed");
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::message::{JsonDeserializer, Message, MessageQueue, ProtocolMessage};
    use crate::stream::{Catalog, Stream};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(String, u64)>>);

    impl MessageQueueWriter<ProtocolMessage> for Collect {
        fn publish(&self, message: ProtocolMessage, size_bytes: u64) -> Result<(), LoadError> {
            self.0.lock().push((message.kind().to_string(), size_bytes));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publishes_each_line_with_its_size() {
        let input = "{\"type\":\"RECORD\",\"stream\":\"users\",\"data\":{}}\n\n   \n{\"type\":\"TRACE\",\"message\":\"x\"}\n";
        let writer = Arc::new(Collect::default());
        let consumer =
            LineConsumer::<ProtocolMessage>::new(Arc::new(JsonDeserializer), writer.clone());

        let published = consumer.consume(input.as_bytes()).await.unwrap();
        assert_eq!(published, 2);
        let seen = writer.0.lock().clone();
        assert_eq!(seen[0], ("record".to_string(), 44));
        assert_eq!(seen[1].0, "trace");
    }

    #[tokio::test]
    async fn test_reports_line_number_on_bad_input() {
        let input = "{\"type\":\"TRACE\"}\nnot json\n";
        let consumer = LineConsumer::<ProtocolMessage>::new(
            Arc::new(JsonDeserializer),
            Arc::new(Collect::default()),
        );

        let err = consumer.consume(input.as_bytes()).await.unwrap_err();
        assert!(matches!(err, LoadError::Deserialize(ref m) if m.starts_with("input line 2")));
    }

    #[tokio::test]
    async fn test_feeds_message_queue() {
        let catalog = Catalog::new(vec![Stream::new("users")]);
        let queue = Arc::new(MessageQueue::new(&catalog, &QueueSettings::default()));
        let consumer =
            LineConsumer::<ProtocolMessage>::new(Arc::new(JsonDeserializer), queue.clone());
        let input = "{\"type\":\"RECORD\",\"stream\":\"users\",\"data\":{\"id\":1}}\n{\"type\":\"STREAM_COMPLETE\",\"stream\":\"users\"}\n";

        consumer.consume(input.as_bytes()).await.unwrap();

        let mut reader = queue.open(&Stream::new("users"), 0).unwrap();
        assert!(matches!(reader.next().await, Some(Message::Record(_))));
        assert_eq!(reader.next().await, Some(Message::EndOfStream));
        assert!(queue.is_stream_complete(&Stream::new("users")));
    }

    #[tokio::test]
    async fn test_unknown_stream_aborts() {
        let catalog = Catalog::new(vec![Stream::new("users")]);
        let queue = Arc::new(MessageQueue::new(&catalog, &QueueSettings::default()));
        let consumer = LineConsumer::<ProtocolMessage>::new(Arc::new(JsonDeserializer), queue);

        let err = consumer
            .consume("{\"type\":\"RECORD\",\"stream\":\"ghosts\",\"data\":{}}\n".as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::UnknownStream(_)));
    }
}

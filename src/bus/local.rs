use async_stream::stream;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{BusError, Message, MessageBus, MessageStream};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Message>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        // No subscribers is not an error, the message is simply dropped.
        if self.sender.send(Message::new(topic, payload)).is_err() {
            debug!("no subscribers for topic {topic}");
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<MessageStream, BusError> {
        let mut rx = self.sender.subscribe();
        let prefix = topic.to_string();

        let stream = stream! {
            loop {
                match rx.recv().await {
                    Ok(message) if message.topic.starts_with(&prefix) => yield message,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("subscriber for '{prefix}' lagged, dropped {skipped} messages");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_prefix_subscription() {
        let bus = LocalBus::new();
        let mut frames = bus.subscribe("frame").unwrap();
        let mut everything = bus.subscribe("").unwrap();

        bus.publish_text("scope", "RUN").await.unwrap();
        bus.publish("frame_0", vec![1, 2, 3]).await.unwrap();

        let message = frames.next().await.unwrap();
        assert_eq!(message.topic, "frame_0");
        assert_eq!(message.payload, vec![1, 2, 3]);

        assert_eq!(everything.next().await.unwrap().text(), Some("RUN"));
        assert_eq!(everything.next().await.unwrap().topic, "frame_0");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = LocalBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.publish_text("alignment", "pause").await.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_receiving() {
        let bus = LocalBus::with_capacity(2);
        let mut rx = bus.subscribe("t").unwrap();
        for n in 0..5u8 {
            bus.publish("t", vec![n]).await.unwrap();
        }
        let message = rx.next().await.unwrap();
        assert_eq!(message.payload, vec![3]);
    }
}

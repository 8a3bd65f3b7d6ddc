use std::{sync::Arc, time::Duration};

use futures_util::{FutureExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{Message, MessageBus, MessageStream},
    error::{AlignmentError, Result},
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HandshakeTopics {
    pub alignment: String,
    pub stimulus: String,
    pub pause: String,
    pub unpause: String,
    pub proceed: String,
}

impl Default for HandshakeTopics {
    fn default() -> Self {
        Self {
            alignment: "alignment".to_string(),
            stimulus: "stimbuddy".to_string(),
            pause: "pause".to_string(),
            unpause: "unpause".to_string(),
            proceed: "proceed".to_string(),
        }
    }
}

pub struct PauseHandshake {
    bus: Arc<dyn MessageBus>,
    topics: HandshakeTopics,
    replies: MessageStream,
    timeout: Duration,
}

impl PauseHandshake {
    /// Subscribes immediately so no reply published afterwards is missed.
    pub fn new(bus: Arc<dyn MessageBus>, topics: HandshakeTopics, timeout: Duration) -> Result<Self> {
        let replies = bus.subscribe(&topics.stimulus)?;
        Ok(Self {
            bus,
            topics,
            replies,
            timeout,
        })
    }

    fn is_proceed(&self, message: &Message) -> bool {
        if message.topic != self.topics.stimulus {
            warn!("{}: topic not understood", message.topic);
            return false;
        }
        match message.text() {
            Some(text) if text == self.topics.proceed => true,
            Some(text) => {
                warn!("{text}: message not understood");
                false
            }
            None => {
                warn!("non-text message on {}", message.topic);
                false
            }
        }
    }

    /// Drains replies that arrived before now. Returns true if any of them
    /// was a proceed.
    pub fn take_pending(&mut self) -> bool {
        let mut proceed = false;
        while let Some(Some(message)) = self.replies.next().now_or_never() {
            proceed |= self.is_proceed(&message);
        }
        proceed
    }

    /// Resolves on the next proceed. Never resolves if the bus closes.
    pub async fn next_proceed(&mut self) {
        while let Some(message) = self.replies.next().await {
            if self.is_proceed(&message) {
                return;
            }
        }
        std::future::pending::<()>().await
    }

    pub async fn request(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.take_pending() {
            debug!("discarding stale proceed");
        }
        info!("asking stimulus controller to pause");
        self.bus
            .publish_text(&self.topics.alignment, &self.topics.pause)
            .await?;

        let timeout = self.timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(AlignmentError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(AlignmentError::PauseTimeout(timeout)),
            _ = self.next_proceed() => {
                info!("received pause confirmation");
                Ok(())
            }
        }
    }

    pub async fn release(&self) -> Result<()> {
        info!("asking stimulus controller to unpause");
        self.bus
            .publish_text(&self.topics.alignment, &self.topics.unpause)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    fn handshake(bus: &Arc<LocalBus>) -> PauseHandshake {
        PauseHandshake::new(bus.clone(), HandshakeTopics::default(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_pause_round_trip() {
        let bus = Arc::new(LocalBus::new());
        let mut requests = bus.subscribe("alignment").unwrap();
        let mut handshake = handshake(&bus);

        let controller = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let request = requests.next().await.unwrap();
                assert_eq!(request.text(), Some("pause"));
                bus.publish_text("stimbuddy", "busy").await.unwrap();
                bus.publish_text("stimbuddy", "proceed").await.unwrap();
                let release = requests.next().await.unwrap();
                assert_eq!(release.text(), Some("unpause"));
            })
        };

        handshake.request(&CancellationToken::new()).await.unwrap();
        handshake.release().await.unwrap();
        controller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_proceed_is_not_an_answer() {
        let bus = Arc::new(LocalBus::new());
        let mut handshake = handshake(&bus);
        bus.publish_text("stimbuddy", "proceed").await.unwrap();

        let result = handshake.request(&CancellationToken::new()).await;
        assert!(matches!(result, Err(AlignmentError::PauseTimeout(_))));
    }

    #[tokio::test]
    async fn test_take_pending() {
        let bus = Arc::new(LocalBus::new());
        let mut handshake = handshake(&bus);
        assert!(!handshake.take_pending());

        bus.publish_text("stimbuddy", "hello").await.unwrap();
        assert!(!handshake.take_pending());

        bus.publish_text("stimbuddy", "proceed").await.unwrap();
        assert!(handshake.take_pending());
        assert!(!handshake.take_pending());
    }
}

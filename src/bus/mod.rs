//! Publish/subscribe transport used to talk to the scanner and the stimulus
//! controller. Messages carry a topic and an opaque payload; there is no
//! request/response correlation.

pub mod codec;
pub mod local;

use std::{fmt, pin::Pin};

use async_trait::async_trait;
use futures_core::stream::Stream;
use thiserror::Error;

pub use codec::{decode_frame, encode_frame, FrameHeader, DecodedFrame, FrameEncoding};
pub use local::LocalBus;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("Bus is closed")]
    Closed,

    #[error("Failed to send on topic {topic}: {reason}")]
    Send { topic: String, reason: String },

    #[error("Failed to decode payload: {0}")]
    Decode(String),
}

#[derive(Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

// Payloads can be whole images, keep the debug output short.
impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("payload", &format_args!("<{} bytes>", self.payload.len()))
            .finish()
    }
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Stream of every message whose topic starts with `topic`. Only messages
    /// published after the call are delivered.
    fn subscribe(&self, topic: &str) -> Result<MessageStream, BusError>;

    async fn publish_text(&self, topic: &str, text: &str) -> Result<(), BusError> {
        self.publish(topic, text.as_bytes().to_vec()).await
    }
}

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

pub mod hub;

pub use hub::BroadcastHub;

pub const ENERGY_UPDATE_EVENT: &str = "energy_update";

/// Subscribing to this topic yields every message published on the bus.
pub const ALL_TOPICS: &str = "*";

pub fn device_topic(device_id: &str) -> String {
    format!("device_{device_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl BusMessage {
    pub fn new<T: Serialize>(topic: impl Into<String>, event: impl Into<String>, payload: &T) -> Result<Self, PubSubError> {
        Ok(Self {
            topic: topic.into(),
            event: event.into(),
            payload: serde_json::to_value(payload).map_err(|e| PubSubError::Encode(e.to_string()))?,
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PubSubError {
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

pub type Subscription = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

/// Topic-based fan-out with at-least-once delivery to live subscribers.
///
/// Publishing never waits on subscribers; a subscriber that falls behind
/// misses messages rather than slowing the publisher.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Returns how many subscribers the message was handed to.
    async fn publish(&self, message: BusMessage) -> Result<usize, PubSubError>;

    async fn subscribe(&self, topic: &str) -> Subscription;
}

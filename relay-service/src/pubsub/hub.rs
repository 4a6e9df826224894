use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use super::{BusMessage, PubSub, PubSubError, Subscription, ALL_TOPICS};

/// In-process bus: one bounded broadcast channel per topic plus a firehose.
pub struct BroadcastHub {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    firehose: broadcast::Sender<BusMessage>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            topics: RwLock::new(HashMap::new()),
            firehose,
            capacity,
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

fn into_subscription(rx: broadcast::Receiver<BusMessage>, topic: String) -> Subscription {
    let stream = BroadcastStream::new(rx).filter_map(move |item| {
        let topic = topic.clone();
        async move {
            match item {
                Ok(msg) => Some(msg),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %topic, skipped, "subscriber lagged, messages dropped");
                    metrics::counter!("bus_subscriber_lagged_total").increment(skipped);
                    None
                }
            }
        }
    });
    Box::pin(stream)
}

#[async_trait]
impl PubSub for BroadcastHub {
    async fn publish(&self, message: BusMessage) -> Result<usize, PubSubError> {
        let mut delivered = 0;
        let mut orphaned = false;

        {
            let topics = self.topics.read().await;
            if let Some(tx) = topics.get(&message.topic) {
                // A send error only means nobody is listening right now.
                match tx.send(message.clone()) {
                    Ok(n) => delivered += n,
                    Err(_) => orphaned = true,
                }
            }
        }

        if orphaned {
            let mut topics = self.topics.write().await;
            if topics.get(&message.topic).is_some_and(|tx| tx.receiver_count() == 0) {
                topics.remove(&message.topic);
            }
        }

        delivered += self.firehose.send(message).unwrap_or(0);
        metrics::counter!("bus_messages_published_total").increment(1);
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> Subscription {
        let rx = if topic == ALL_TOPICS {
            self.firehose.subscribe()
        } else {
            let mut topics = self.topics.write().await;
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        into_subscription(rx, topic.to_string())
    }
}

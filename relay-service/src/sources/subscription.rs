use futures::StreamExt;
use serde::de::DeserializeOwned;

use crate::{
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
    pubsub::{PubSub, Subscription},
};

/// Decodes bus messages of one event type into typed envelopes.
///
/// The subscription is taken out at construction so nothing published after
/// that point is missed by the pipeline.
pub struct SubscriptionSource {
    subscription: tokio::sync::Mutex<Option<Subscription>>,
    event: &'static str,
}

impl SubscriptionSource {
    pub async fn new(bus: &dyn PubSub, topic: &str, event: &'static str) -> Self {
        Self {
            subscription: tokio::sync::Mutex::new(Some(bus.subscribe(topic).await)),
            event,
        }
    }
}

#[async_trait::async_trait]
impl<T> Source<T> for SubscriptionSource
where
    T: DeserializeOwned + Send + 'static,
{
    async fn stream(&self) -> EnvelopeStream<T> {
        let Some(subscription) = self.subscription.lock().await.take() else {
            return Box::pin(futures::stream::once(async {
                Err(PipelineError::Source("subscription already consumed".to_string()))
            }));
        };

        let event = self.event;
        let s = subscription
            .filter(move |msg| futures::future::ready(msg.event == event))
            .map(|msg| {
                serde_json::from_value::<T>(msg.payload)
                    .map(Envelope::now)
                    .map_err(|e| PipelineError::Source(format!("undecodable {} payload on {}: {e}", msg.event, msg.topic)))
            });

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{device_topic, BroadcastHub, BusMessage, ALL_TOPICS, ENERGY_UPDATE_EVENT};
    use energy_client::domain::Reading;
    use serde_json::json;

    #[tokio::test]
    async fn decodes_matching_events_and_flags_garbage() {
        let hub = BroadcastHub::new(16);
        let source = SubscriptionSource::new(&hub, ALL_TOPICS, ENERGY_UPDATE_EVENT).await;
        let mut stream = Source::<Reading>::stream(&source).await;

        let publish = |event: &str, payload: serde_json::Value| BusMessage {
            topic: device_topic("D1"),
            event: event.to_string(),
            payload,
        };

        hub.publish(publish("ota_progress", json!({}))).await.unwrap();
        hub.publish(publish(ENERGY_UPDATE_EVENT, json!({ "device_id": "D1" }))).await.unwrap();
        hub.publish(publish(
            ENERGY_UPDATE_EVENT,
            json!({
                "device_id": "D1",
                "channel_number": 3,
                "current": 1.5,
                "power": 345.0,
                "energy_wh": 120.0,
                "cost": 40.0,
                "timestamp": "2024-06-01T12:00:00Z"
            }),
        ))
        .await
        .unwrap();

        assert!(matches!(stream.next().await, Some(Err(PipelineError::Source(_)))));
        let env = stream.next().await.unwrap().unwrap();
        assert_eq!(env.payload.channel_number, 3);
        assert_eq!(env.payload.cost, 40.0);
    }
}

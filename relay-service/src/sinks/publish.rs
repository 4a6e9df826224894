use std::{sync::Arc, time::Duration};

use energy_client::domain::Reading;
use futures::StreamExt;

use crate::{
    pipeline::{Envelope, PipelineError, Sink},
    pubsub::{device_topic, BusMessage, PubSub, PubSubError, ENERGY_UPDATE_EVENT},
};

/// Publishes enriched readings on their device topic.
///
/// A message that still fails after `max_retries` is dropped; later
/// readings carry the full cumulative energy, so subscribers recover on
/// the next sample.
pub struct PublishSink {
    bus: Arc<dyn PubSub>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PublishSink {
    pub fn new(bus: Arc<dyn PubSub>, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            bus,
            max_retries,
            retry_backoff,
        }
    }

    async fn publish(&self, env: &Envelope<Reading>) -> Result<usize, PubSubError> {
        let reading = &env.payload;
        let message = BusMessage::new(device_topic(&reading.device_id), ENERGY_UPDATE_EVENT, reading)?;

        let mut attempt: u32 = 0;
        loop {
            match self.bus.publish(message.clone()).await {
                Ok(delivered) => {
                    if let Ok(dur) = std::time::SystemTime::now().duration_since(env.received_at) {
                        metrics::histogram!("relay_publish_latency_seconds").record(dur.as_secs_f64());
                    }
                    return Ok(delivered);
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    metrics::counter!("relay_publish_retries_total").increment(1);
                    tracing::warn!(
                        device_id = %reading.device_id,
                        error = %e,
                        attempt,
                        "publish failed, retrying with backoff"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl Sink<Reading> for PublishSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send + Unpin + 'static,
    {
        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for PublishSink");
                    continue;
                }
            };

            match self.publish(&env).await {
                Ok(delivered) => {
                    tracing::debug!(
                        device_id = %env.payload.device_id,
                        channel = env.payload.channel_number,
                        delivered,
                        "reading published"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        device_id = %env.payload.device_id,
                        channel = env.payload.channel_number,
                        error = %e,
                        "publish failed, giving up on reading"
                    );
                    metrics::counter!("relay_publish_errors_total").increment(1);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use time::macros::datetime;

    use super::*;
    use crate::pubsub::{BroadcastHub, Subscription};

    /// Fails the first `failures` publishes, then forwards to a real hub.
    struct FlakyBus {
        failures: u32,
        calls: AtomicU32,
        inner: BroadcastHub,
    }

    #[async_trait]
    impl PubSub for FlakyBus {
        async fn publish(&self, message: BusMessage) -> Result<usize, PubSubError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(PubSubError::Unavailable("down".to_string()));
            }
            self.inner.publish(message).await
        }

        async fn subscribe(&self, topic: &str) -> Subscription {
            self.inner.subscribe(topic).await
        }
    }

    fn reading(channel_number: i32) -> Envelope<Reading> {
        Envelope::now(Reading {
            device_id: "D1".to_string(),
            channel_number,
            current: 1.0,
            power: 230.0,
            energy_wh: 100.0,
            cost: 1000.0,
            timestamp: datetime!(2024-06-01 12:00:00 UTC),
        })
    }

    #[tokio::test]
    async fn readings_land_on_their_device_topic() {
        let bus = Arc::new(BroadcastHub::new(8));
        let mut sub = bus.subscribe(&device_topic("D1")).await;

        let sink = PublishSink::new(bus.clone(), 0, Duration::from_millis(1));
        let input = futures::stream::iter(vec![Ok(reading(1))]);
        sink.run(input).await.unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.event, ENERGY_UPDATE_EVENT);
        assert_eq!(msg.payload["channel_number"], 1);
        assert_eq!(msg.payload["cost"], 1000.0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let bus = Arc::new(FlakyBus {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: BroadcastHub::new(8),
        });
        let mut sub = bus.subscribe(&device_topic("D1")).await;

        let sink = PublishSink::new(bus.clone(), 3, Duration::from_millis(1));
        sink.run(futures::stream::iter(vec![Ok(reading(2))])).await.unwrap();

        assert_eq!(bus.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sub.next().await.map(|m| m.payload["channel_number"].clone()), Some(2.into()));
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_reading_and_keep_going() {
        let bus = Arc::new(FlakyBus {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: BroadcastHub::new(8),
        });
        let mut sub = bus.subscribe(&device_topic("D1")).await;

        let sink = PublishSink::new(bus.clone(), 1, Duration::from_millis(1));
        let input = futures::stream::iter(vec![
            Ok(reading(1)),
            Err(PipelineError::Transform("bad".to_string())),
            Ok(reading(3)),
        ]);
        sink.run(input).await.unwrap();

        // First reading used both failing attempts; the next one went through.
        assert_eq!(sub.next().await.map(|m| m.payload["channel_number"].clone()), Some(3.into()));
    }
}

use std::sync::Arc;

use energy_client::domain::Reading;
use futures::StreamExt;

use crate::{
    cache::CacheUpdate,
    monitor::Monitor,
    pipeline::{Envelope, PipelineError, Sink},
};

/// Feeds bus readings into the liveness monitor.
pub struct MonitorSink {
    monitor: Arc<Monitor>,
}

impl MonitorSink {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait::async_trait]
impl Sink<Reading> for MonitorSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send + Unpin + 'static,
    {
        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping bus reading");
                    continue;
                }
            };

            if self.monitor.observe(env.payload).await == CacheUpdate::Stale {
                metrics::counter!("monitor_stale_readings_total").increment(1);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use time::{Duration, OffsetDateTime};

    use super::*;

    #[tokio::test]
    async fn valid_readings_reach_the_monitor() {
        let monitor = Arc::new(Monitor::new(16, Duration::seconds(15), StdDuration::from_secs(2)));
        let sink = MonitorSink::new(monitor.clone());

        let reading = Reading {
            device_id: "D1".to_string(),
            channel_number: 4,
            current: 0.3,
            power: 69.0,
            energy_wh: 12.0,
            cost: 0.0,
            timestamp: OffsetDateTime::now_utc(),
        };
        let input = futures::stream::iter(vec![
            Err(PipelineError::Transform("rejected".to_string())),
            Ok(Envelope::now(reading)),
        ]);
        sink.run(input).await.unwrap();

        assert_eq!(monitor.device_readings("D1").await.len(), 1);
        assert!(monitor.snapshot().await.is_channel_online("D1", 4));
    }
}

use std::sync::Arc;

use energy_client::domain::{split_bill, ChannelEnergy, Reading, Sample};
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};

use crate::{cache::ReadingCache, error::ServiceError, pipeline::Envelope, store::Store, transform};

/// Validates device samples, prices them and hands them to the publisher.
///
/// The relay keeps its own latest-per-channel cache; it is the only
/// energy history used for pricing.
pub struct Relay {
    store: Arc<dyn Store>,
    cache: Mutex<ReadingCache>,
    queue: mpsc::Sender<Envelope<Reading>>,
}

impl Relay {
    pub fn new(store: Arc<dyn Store>, cache_capacity: usize, queue: mpsc::Sender<Envelope<Reading>>) -> Self {
        Self {
            store,
            cache: Mutex::new(ReadingCache::new(cache_capacity)),
            queue,
        }
    }

    pub async fn ingest(&self, sample: Sample, now: OffsetDateTime) -> Result<Reading, ServiceError> {
        transform::validate_sample(&sample)?;

        let device = match self.store.device(&sample.device_id).await? {
            Some(d) => d,
            None => {
                metrics::counter!("relay_ingest_rejected_total", "reason" => "unregistered").increment(1);
                tracing::warn!(device_id = %sample.device_id, "sample from unregistered device");
                return Err(ServiceError::DeviceNotRegistered(sample.device_id));
            }
        };

        if !device.has_channel(sample.channel_number) {
            metrics::counter!("relay_ingest_rejected_total", "reason" => "channel").increment(1);
            return Err(ServiceError::InvalidChannel {
                channel: sample.channel_number,
                channel_count: device.channel_count,
            });
        }

        let total_bill = self
            .store
            .bill_setting(&device.device_id)
            .await?
            .map(|b| b.total_bill_amount)
            .unwrap_or(0.0);

        let reading = {
            let cache = self.cache.lock().await;

            let mut energies: Vec<ChannelEnergy> = cache
                .channel_energies(&device.device_id)
                .into_iter()
                .filter(|e| device.has_channel(e.channel_number) && e.channel_number != sample.channel_number)
                .collect();
            energies.push(ChannelEnergy {
                channel_number: sample.channel_number,
                energy_wh: sample.energy_wh,
            });

            let cost = split_bill(total_bill, &energies)
                .share(sample.channel_number)
                .map(|s| s.cost)
                .unwrap_or(0.0);

            Reading::from_sample(sample, cost, now)
        };

        self.queue
            .send(Envelope::now(reading.clone()))
            .await
            .map_err(|_| ServiceError::QueueClosed)?;
        // Only relayed readings price later samples.
        self.cache.lock().await.insert(reading.clone());

        metrics::counter!("relay_ingested_samples_total").increment(1);
        tracing::debug!(
            device_id = %reading.device_id,
            channel = reading.channel_number,
            cost = reading.cost,
            "sample relayed"
        );
        Ok(reading)
    }

    /// Drops cached energy for a removed device so a re-registration starts clean.
    pub async fn forget_device(&self, device_id: &str) {
        self.cache.lock().await.forget_device(device_id);
    }
}

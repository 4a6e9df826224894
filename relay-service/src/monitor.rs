use std::{collections::BTreeSet, sync::Arc, time::Duration as StdDuration};

use energy_client::domain::{OnlineSnapshot, Reading};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheUpdate, ReadingCache};

/// Subscriber-side view of the bus: the latest reading per channel and the
/// online state derived from it.
///
/// The snapshot is rebuilt on every accepted reading and on a fixed tick, so
/// channels that go quiet age out without a new event.
pub struct Monitor {
    cache: RwLock<ReadingCache>,
    snapshot: RwLock<OnlineSnapshot>,
    threshold: Duration,
    tick: StdDuration,
}

impl Monitor {
    pub fn new(cache_capacity: usize, threshold: Duration, tick: StdDuration) -> Self {
        Self {
            cache: RwLock::new(ReadingCache::new(cache_capacity)),
            snapshot: RwLock::new(OnlineSnapshot::default()),
            threshold,
            tick,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub async fn observe(&self, reading: Reading) -> CacheUpdate {
        let update = self.cache.write().await.insert(reading);
        if update != CacheUpdate::Stale {
            self.recompute(OffsetDateTime::now_utc()).await;
        }
        update
    }

    pub async fn recompute(&self, now: OffsetDateTime) -> OnlineSnapshot {
        let next = {
            let cache = self.cache.read().await;
            OnlineSnapshot::evaluate(cache.readings(), self.threshold, now)
        };

        let mut current = self.snapshot.write().await;
        log_transitions(&current, &next);
        metrics::gauge!("devices_online").set(next.online_devices().count() as f64);
        *current = next.clone();
        next
    }

    pub async fn snapshot(&self) -> OnlineSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn device_readings(&self, device_id: &str) -> Vec<Reading> {
        self.cache.read().await.device_readings(device_id)
    }

    pub async fn forget_device(&self, device_id: &str) {
        let dropped = self.cache.write().await.forget_device(device_id);
        if dropped > 0 {
            self.recompute(OffsetDateTime::now_utc()).await;
        }
    }

    /// Re-evaluate liveness every tick until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("liveness monitor stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.recompute(OffsetDateTime::now_utc()).await;
                }
            }
        }
    }
}

fn log_transitions(previous: &OnlineSnapshot, next: &OnlineSnapshot) {
    let before: BTreeSet<&str> = previous.online_devices().collect();
    let after: BTreeSet<&str> = next.online_devices().collect();

    for device_id in after.difference(&before) {
        tracing::info!(device_id = %device_id, "device online");
    }
    for device_id in before.difference(&after) {
        tracing::info!(device_id = %device_id, "device offline");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device_id: &str, channel_number: i32, at: OffsetDateTime) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            channel_number,
            current: 2.0,
            power: 460.0,
            energy_wh: 75.0,
            cost: 0.0,
            timestamp: at,
        }
    }

    fn monitor() -> Monitor {
        Monitor::new(64, Duration::seconds(15), StdDuration::from_secs(2))
    }

    #[tokio::test]
    async fn fresh_reading_brings_device_online() {
        let m = monitor();
        m.observe(reading("D1", 1, OffsetDateTime::now_utc())).await;

        let snap = m.snapshot().await;
        assert!(snap.is_device_online("D1"));
        assert!(snap.is_channel_online("D1", 1));
    }

    #[tokio::test]
    async fn tick_ages_out_silent_channels() {
        let m = monitor();
        let at = OffsetDateTime::now_utc();
        m.observe(reading("D1", 1, at)).await;

        let later = m.recompute(at + Duration::seconds(16)).await;
        assert!(!later.is_device_online("D1"));
        assert!(!m.snapshot().await.is_device_online("D1"));
    }

    #[tokio::test]
    async fn forgotten_devices_drop_out_of_the_snapshot() {
        let m = monitor();
        m.observe(reading("D1", 1, OffsetDateTime::now_utc())).await;
        m.forget_device("D1").await;

        assert!(m.device_readings("D1").await.is_empty());
        assert!(!m.snapshot().await.is_device_online("D1"));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let m = Arc::new(monitor());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(m.clone().run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(StdDuration::from_secs(1), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}

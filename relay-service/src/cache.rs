use std::collections::HashMap;

use energy_client::domain::{ChannelEnergy, ChannelKey, Reading};

/// Latest reading per (device, channel), bounded by entry count.
///
/// An insert only replaces an entry when it is at least as new as the
/// cached one. At capacity, inserting a new key evicts the entry with the
/// oldest timestamp.
#[derive(Debug)]
pub struct ReadingCache {
    entries: HashMap<ChannelKey, Reading>,
    capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    Inserted,
    Replaced,
    /// The cached reading is newer; the incoming one was dropped.
    Stale,
}

impl ReadingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, reading: Reading) -> CacheUpdate {
        let key = reading.key();

        if let Some(existing) = self.entries.get_mut(&key) {
            if reading.timestamp < existing.timestamp {
                return CacheUpdate::Stale;
            }
            *existing = reading;
            return CacheUpdate::Replaced;
        }

        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(key, reading);
        CacheUpdate::Inserted
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, r)| r.timestamp)
            .map(|(k, _)| k.clone());

        if let Some(key) = oldest {
            tracing::debug!(device_id = %key.device_id, channel = key.channel_number, "evicting stalest cached reading");
            metrics::counter!("reading_cache_evictions_total").increment(1);
            self.entries.remove(&key);
        }
    }

    pub fn get(&self, device_id: &str, channel_number: i32) -> Option<&Reading> {
        self.entries.get(&ChannelKey::new(device_id, channel_number))
    }

    /// Cached readings of one device, ordered by channel.
    pub fn device_readings(&self, device_id: &str) -> Vec<Reading> {
        let mut readings: Vec<Reading> = self
            .entries
            .values()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        readings.sort_by_key(|r| r.channel_number);
        readings
    }

    /// Latest cumulative energy of every cached channel of `device_id`.
    pub fn channel_energies(&self, device_id: &str) -> Vec<ChannelEnergy> {
        self.device_readings(device_id)
            .into_iter()
            .map(|r| ChannelEnergy {
                channel_number: r.channel_number,
                energy_wh: r.energy_wh,
            })
            .collect()
    }

    pub fn forget_device(&mut self, device_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| k.device_id != device_id);
        before - self.entries.len()
    }

    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{macros::datetime, Duration, OffsetDateTime};

    const T0: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    fn reading(device_id: &str, channel_number: i32, energy_wh: f64, at: OffsetDateTime) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            channel_number,
            current: 0.5,
            power: 115.0,
            energy_wh,
            cost: 0.0,
            timestamp: at,
        }
    }

    #[test]
    fn newer_reading_replaces_older() {
        let mut cache = ReadingCache::new(8);
        assert_eq!(cache.insert(reading("D1", 1, 10.0, T0)), CacheUpdate::Inserted);
        assert_eq!(
            cache.insert(reading("D1", 1, 12.0, T0 + Duration::seconds(30))),
            CacheUpdate::Replaced
        );
        assert_eq!(cache.get("D1", 1).map(|r| r.energy_wh), Some(12.0));
    }

    #[test]
    fn out_of_order_reading_is_dropped() {
        let mut cache = ReadingCache::new(8);
        cache.insert(reading("D1", 1, 12.0, T0 + Duration::seconds(30)));
        assert_eq!(cache.insert(reading("D1", 1, 10.0, T0)), CacheUpdate::Stale);
        assert_eq!(cache.get("D1", 1).map(|r| r.energy_wh), Some(12.0));
    }

    #[test]
    fn capacity_evicts_stalest_entry() {
        let mut cache = ReadingCache::new(2);
        cache.insert(reading("D1", 1, 1.0, T0));
        cache.insert(reading("D1", 2, 2.0, T0 + Duration::seconds(5)));
        cache.insert(reading("D2", 1, 3.0, T0 + Duration::seconds(10)));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("D1", 1).is_none());
        assert!(cache.get("D1", 2).is_some());
        assert!(cache.get("D2", 1).is_some());
    }

    #[test]
    fn energies_are_grouped_by_device() {
        let mut cache = ReadingCache::new(8);
        cache.insert(reading("D1", 2, 20.0, T0));
        cache.insert(reading("D1", 1, 10.0, T0));
        cache.insert(reading("D2", 1, 99.0, T0));

        let energies = cache.channel_energies("D1");
        assert_eq!(
            energies,
            vec![
                ChannelEnergy { channel_number: 1, energy_wh: 10.0 },
                ChannelEnergy { channel_number: 2, energy_wh: 20.0 },
            ]
        );

        assert_eq!(cache.forget_device("D1"), 2);
        assert!(cache.channel_energies("D1").is_empty());
    }
}

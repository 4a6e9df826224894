use std::collections::BTreeMap;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use super::reading::Reading;

pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::seconds(15);

/// A reading is fresh while its age is strictly below the threshold.
pub fn is_fresh(now: OffsetDateTime, reading_ts: OffsetDateTime, threshold: Duration) -> bool {
    now - reading_ts < threshold
}

/// Online state per device and channel, derived from reading recency.
///
/// Snapshots are rebuilt from scratch on every evaluation; they hold no
/// memory of previous evaluations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OnlineSnapshot {
    #[serde(with = "time::serde::rfc3339::option")]
    pub evaluated_at: Option<OffsetDateTime>,
    devices: BTreeMap<String, BTreeMap<i32, bool>>,
}

impl OnlineSnapshot {
    pub fn evaluate<'a, I>(readings: I, threshold: Duration, now: OffsetDateTime) -> Self
    where
        I: IntoIterator<Item = &'a Reading>,
    {
        // Latest timestamp per channel, in case the input carries history.
        let mut latest: BTreeMap<(&str, i32), OffsetDateTime> = BTreeMap::new();
        for r in readings {
            latest
                .entry((r.device_id.as_str(), r.channel_number))
                .and_modify(|ts| {
                    if r.timestamp > *ts {
                        *ts = r.timestamp;
                    }
                })
                .or_insert(r.timestamp);
        }

        let mut devices: BTreeMap<String, BTreeMap<i32, bool>> = BTreeMap::new();
        for ((device_id, channel), ts) in latest {
            devices
                .entry(device_id.to_string())
                .or_default()
                .insert(channel, is_fresh(now, ts, threshold));
        }

        Self {
            evaluated_at: Some(now),
            devices,
        }
    }

    pub fn is_channel_online(&self, device_id: &str, channel_number: i32) -> bool {
        self.devices
            .get(device_id)
            .and_then(|channels| channels.get(&channel_number))
            .copied()
            .unwrap_or(false)
    }

    pub fn is_device_online(&self, device_id: &str) -> bool {
        self.devices
            .get(device_id)
            .map(|channels| channels.values().any(|&online| online))
            .unwrap_or(false)
    }

    pub fn online_device_count<'a, I>(&self, device_ids: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        device_ids
            .into_iter()
            .filter(|id| self.is_device_online(id))
            .count()
    }

    /// Every device with at least one online channel.
    pub fn online_devices(&self) -> impl Iterator<Item = &str> {
        self.devices
            .iter()
            .filter(|(_, channels)| channels.values().any(|&online| online))
            .map(|(id, _)| id.as_str())
    }

    pub fn channels(&self, device_id: &str) -> Option<&BTreeMap<i32, bool>> {
        self.devices.get(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    fn reading(device_id: &str, channel_number: i32, age: Duration) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            channel_number,
            current: 1.0,
            power: 230.0,
            energy_wh: 10.0,
            cost: 0.0,
            timestamp: NOW - age,
        }
    }

    #[test]
    fn freshness_boundary_is_strict() {
        let t = Duration::seconds(15);
        assert!(is_fresh(NOW, NOW - Duration::milliseconds(14_999), t));
        assert!(!is_fresh(NOW, NOW - t, t));
        assert!(!is_fresh(NOW, NOW - Duration::seconds(16), t));
    }

    #[test]
    fn device_is_online_when_any_channel_is() {
        let readings = vec![
            reading("D1", 1, Duration::seconds(60)),
            reading("D1", 2, Duration::seconds(3)),
            reading("D2", 1, Duration::seconds(30)),
        ];
        let snap = OnlineSnapshot::evaluate(&readings, Duration::seconds(15), NOW);

        assert!(!snap.is_channel_online("D1", 1));
        assert!(snap.is_channel_online("D1", 2));
        assert!(snap.is_device_online("D1"));
        assert!(!snap.is_device_online("D2"));
        assert!(!snap.is_device_online("unknown"));
        assert_eq!(snap.online_device_count(["D1", "D2", "D3"]), 1);
        assert_eq!(snap.online_devices().collect::<Vec<_>>(), vec!["D1"]);
    }

    #[test]
    fn newest_reading_per_channel_wins() {
        let readings = vec![
            reading("D1", 1, Duration::seconds(2)),
            reading("D1", 1, Duration::seconds(90)),
        ];
        let snap = OnlineSnapshot::evaluate(&readings, Duration::seconds(15), NOW);
        assert!(snap.is_channel_online("D1", 1));
    }

    #[test]
    fn evaluation_is_idempotent() {
        let readings = vec![reading("D1", 1, Duration::seconds(5))];
        let a = OnlineSnapshot::evaluate(&readings, Duration::seconds(15), NOW);
        let b = OnlineSnapshot::evaluate(&readings, Duration::seconds(15), NOW);
        assert_eq!(a, b);
    }

    #[test]
    fn channels_age_out_as_time_passes() {
        let readings = vec![reading("D1", 1, Duration::ZERO)];
        let later = NOW + Duration::seconds(20);
        let snap = OnlineSnapshot::evaluate(&readings, Duration::seconds(15), later);
        assert!(!snap.is_device_online("D1"));
    }
}

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Identifies one sensor input across all devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub device_id: String,
    pub channel_number: i32,
}

impl ChannelKey {
    pub fn new(device_id: impl Into<String>, channel_number: i32) -> Self {
        Self {
            device_id: device_id.into(),
            channel_number,
        }
    }
}

/// A raw measurement as reported by a device, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub device_id: String,
    pub channel_number: i32,
    pub current: f64,
    pub power: f64,
    /// Cumulative energy since the device's last counter reset.
    pub energy_wh: f64,
}

/// A sample enriched with its proportional cost and the server receive time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub channel_number: i32,
    pub current: f64,
    pub power: f64,
    pub energy_wh: f64,
    pub cost: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Reading {
    pub fn from_sample(sample: Sample, cost: f64, timestamp: OffsetDateTime) -> Self {
        Self {
            device_id: sample.device_id,
            channel_number: sample.channel_number,
            current: sample.current,
            power: sample.power,
            energy_wh: sample.energy_wh,
            cost,
            timestamp,
        }
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.device_id.clone(), self.channel_number)
    }
}

use std::collections::HashMap;

use energy_client::domain::{
    device::default_channel_name, split_bill, BillSetting, Channel, ChannelEnergy, Device, OnlineSnapshot, Reading,
};
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelOverview {
    pub channel_number: i32,
    pub name: String,
    pub online: bool,
    pub current: f64,
    pub power: f64,
    pub energy_wh: f64,
    pub consumption_kwh: f64,
    pub percentage: f64,
    pub cost: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

/// Dashboard view of one device: per-channel liveness and bill shares.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceOverview {
    pub device: Device,
    pub online: bool,
    pub bill: BillSetting,
    pub total_energy_wh: f64,
    pub total_kwh: f64,
    pub channels: Vec<ChannelOverview>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    #[serde(flatten)]
    pub device: Device,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceListing {
    pub devices: Vec<DeviceSummary>,
    pub total: usize,
    pub online_count: usize,
}

/// Channels without a cached reading count as zero energy and offline.
pub fn device_overview(
    device: Device,
    channels: &[Channel],
    bill: BillSetting,
    readings: &[Reading],
    snapshot: &OnlineSnapshot,
) -> DeviceOverview {
    let latest: HashMap<i32, &Reading> = readings
        .iter()
        .filter(|r| r.device_id == device.device_id && device.has_channel(r.channel_number))
        .map(|r| (r.channel_number, r))
        .collect();

    let energies: Vec<ChannelEnergy> = device
        .channel_numbers()
        .map(|n| ChannelEnergy {
            channel_number: n,
            energy_wh: latest.get(&n).map_or(0.0, |r| r.energy_wh),
        })
        .collect();
    let split = split_bill(bill.total_bill_amount, &energies);

    let names: HashMap<i32, &str> = channels
        .iter()
        .map(|c| (c.channel_number, c.custom_name.as_str()))
        .collect();

    let channels = device
        .channel_numbers()
        .map(|n| {
            let reading = latest.get(&n);
            let share = split.share(n);
            ChannelOverview {
                channel_number: n,
                name: names
                    .get(&n)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| default_channel_name(n)),
                online: snapshot.is_channel_online(&device.device_id, n),
                current: reading.map_or(0.0, |r| r.current),
                power: reading.map_or(0.0, |r| r.power),
                energy_wh: share.map_or(0.0, |s| s.energy_wh),
                consumption_kwh: share.map_or(0.0, |s| s.consumption_kwh),
                percentage: share.map_or(0.0, |s| s.percentage),
                cost: share.map_or(0.0, |s| s.cost),
                last_seen: reading.map(|r| r.timestamp),
            }
        })
        .collect();

    DeviceOverview {
        online: snapshot.is_device_online(&device.device_id),
        total_energy_wh: split.total_energy_wh,
        total_kwh: split.total_energy_wh / 1000.0,
        bill,
        channels,
        device,
    }
}

pub fn device_listing(devices: Vec<Device>, snapshot: &OnlineSnapshot) -> DeviceListing {
    let devices: Vec<DeviceSummary> = devices
        .into_iter()
        .map(|device| DeviceSummary {
            online: snapshot.is_device_online(&device.device_id),
            device,
        })
        .collect();

    DeviceListing {
        total: devices.len(),
        online_count: devices.iter().filter(|d| d.online).count(),
        devices,
    }
}

#[cfg(test)]
mod tests {
    use energy_client::domain::{BillingPeriod, NewDevice};
    use time::{macros::datetime, Duration};

    use super::*;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    fn device(device_id: &str, channel_count: i32) -> Device {
        NewDevice {
            device_id: device_id.to_string(),
            device_name: "Yard".to_string(),
            channel_count,
            owner_id: "owner".to_string(),
        }
        .into_device(NOW)
    }

    fn bill(amount: f64) -> BillSetting {
        BillSetting {
            device_id: "D1".to_string(),
            total_bill_amount: amount,
            billing_period: BillingPeriod::Monthly,
            updated_at: NOW,
        }
    }

    fn reading(channel_number: i32, energy_wh: f64, at: OffsetDateTime) -> Reading {
        Reading {
            device_id: "D1".to_string(),
            channel_number,
            current: 1.5,
            power: 345.0,
            energy_wh,
            cost: 0.0,
            timestamp: at,
        }
    }

    #[test]
    fn overview_splits_bill_across_all_channels() {
        let readings: Vec<Reading> = (1..=4).map(|n| reading(n, 100.0, NOW)).collect();
        let snapshot = OnlineSnapshot::evaluate(readings.iter(), Duration::seconds(15), NOW);
        let d = device("D1", 4);
        let channels = NewDevice {
            device_id: "D1".to_string(),
            device_name: "Yard".to_string(),
            channel_count: 4,
            owner_id: "owner".to_string(),
        }
        .channels();

        let overview = device_overview(d, &channels, bill(4000.0), &readings, &snapshot);

        assert!(overview.online);
        assert_eq!(overview.channels.len(), 4);
        for ch in &overview.channels {
            assert!((ch.cost - 1000.0).abs() < 1e-9);
            assert!((ch.percentage - 25.0).abs() < 1e-9);
            assert!(ch.online);
        }
        assert!((overview.total_kwh - 0.4).abs() < 1e-9);
    }

    #[test]
    fn silent_channels_are_offline_with_zero_share() {
        let readings = vec![reading(1, 50.0, NOW - Duration::seconds(3))];
        let snapshot = OnlineSnapshot::evaluate(readings.iter(), Duration::seconds(15), NOW);

        let overview = device_overview(device("D1", 4), &[], bill(500.0), &readings, &snapshot);

        let first = &overview.channels[0];
        assert!(first.online);
        assert!((first.cost - 500.0).abs() < 1e-9);
        assert_eq!(first.name, "House1");

        let second = &overview.channels[1];
        assert!(!second.online);
        assert_eq!(second.cost, 0.0);
        assert_eq!(second.last_seen, None);
    }

    #[test]
    fn listing_counts_online_devices() {
        let readings = vec![reading(1, 1.0, NOW)];
        let snapshot = OnlineSnapshot::evaluate(readings.iter(), Duration::seconds(15), NOW);

        let listing = device_listing(vec![device("D1", 4), device("D2", 8)], &snapshot);
        assert_eq!(listing.total, 2);
        assert_eq!(listing.online_count, 1);
        assert!(listing.devices[0].online);
        assert!(!listing.devices[1].online);
    }
}

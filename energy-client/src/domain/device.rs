use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const MIN_CHANNELS: i32 = 4;
pub const MAX_CHANNELS: i32 = 16;
pub const MAX_DEVICE_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub device_id: String,
    pub device_name: String,
    pub channel_count: i32,
    pub owner_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Device {
    /// Whether `channel_number` addresses one of this device's inputs (1-based).
    pub fn has_channel(&self, channel_number: i32) -> bool {
        (1..=self.channel_count).contains(&channel_number)
    }

    pub fn channel_numbers(&self) -> impl Iterator<Item = i32> {
        1..=self.channel_count
    }
}

/// A channel as one assigned user names it; every user keeps their own labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub device_id: String,
    pub channel_number: i32,
    pub custom_name: String,
    pub user_id: String,
}

pub fn default_channel_name(channel_number: i32) -> String {
    format!("House{channel_number}")
}

/// One default-named channel per input, numbered 1..=channel_count.
pub fn default_channels(device_id: &str, channel_count: i32, user_id: &str) -> Vec<Channel> {
    (1..=channel_count)
        .map(|n| Channel {
            device_id: device_id.to_string(),
            channel_number: n,
            custom_name: default_channel_name(n),
            user_id: user_id.to_string(),
        })
        .collect()
}

/// What dropping a user's assignment did to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unassignment {
    NotAssigned,
    /// Other users still share the device.
    Detached,
    /// The last assignment went, taking the device with it.
    Removed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("device_id must not be empty")]
    EmptyDeviceId,
    #[error("device_id may only contain letters, digits, '-', '_', ':' and '.' (max {MAX_DEVICE_ID_LEN} chars)")]
    MalformedDeviceId,
    #[error("device_name must not be empty")]
    EmptyName,
    #[error("channel_count must be between {MIN_CHANNELS} and {MAX_CHANNELS}, got {0}")]
    ChannelCount(i32),
}

/// Device identifiers end up in topic names and firmware paths, so they are
/// restricted to a conservative character set.
pub fn validate_device_id(device_id: &str) -> Result<(), RegistrationError> {
    if device_id.trim().is_empty() {
        return Err(RegistrationError::EmptyDeviceId);
    }

    let well_formed = device_id.len() <= MAX_DEVICE_ID_LEN
        && !device_id.contains("..")
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'));

    if well_formed {
        Ok(())
    } else {
        Err(RegistrationError::MalformedDeviceId)
    }
}

/// A registration request, validated before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDevice {
    pub device_id: String,
    pub device_name: String,
    pub channel_count: i32,
    pub owner_id: String,
}

impl NewDevice {
    pub fn validate(&self) -> Result<(), RegistrationError> {
        validate_device_id(&self.device_id)?;

        if self.device_name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }

        if !(MIN_CHANNELS..=MAX_CHANNELS).contains(&self.channel_count) {
            return Err(RegistrationError::ChannelCount(self.channel_count));
        }

        Ok(())
    }

    /// The registering user's channels.
    pub fn channels(&self) -> Vec<Channel> {
        default_channels(&self.device_id, self.channel_count, &self.owner_id)
    }

    pub fn into_device(self, created_at: OffsetDateTime) -> Device {
        Device {
            device_id: self.device_id,
            device_name: self.device_name,
            channel_count: self.channel_count,
            owner_id: self.owner_id,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_device(channel_count: i32) -> NewDevice {
        NewDevice {
            device_id: "ESP32_A1".to_string(),
            device_name: "Block A".to_string(),
            channel_count,
            owner_id: "user-1".to_string(),
        }
    }

    #[test]
    fn channels_are_numbered_without_gaps() {
        let channels = new_device(8).channels();
        let numbers: Vec<i32> = channels.iter().map(|c| c.channel_number).collect();
        assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
        assert_eq!(channels[2].custom_name, "House3");
        assert!(channels.iter().all(|c| c.user_id == "user-1"));
    }

    #[test]
    fn channel_count_outside_supported_range_is_rejected() {
        assert_eq!(new_device(3).validate(), Err(RegistrationError::ChannelCount(3)));
        assert_eq!(new_device(17).validate(), Err(RegistrationError::ChannelCount(17)));
        assert!(new_device(4).validate().is_ok());
        assert!(new_device(16).validate().is_ok());
    }

    #[test]
    fn device_ids_with_path_characters_are_rejected() {
        assert!(validate_device_id("AA:BB:CC:DD").is_ok());
        assert_eq!(validate_device_id(""), Err(RegistrationError::EmptyDeviceId));
        assert_eq!(validate_device_id("../etc"), Err(RegistrationError::MalformedDeviceId));
        assert_eq!(validate_device_id("a/b"), Err(RegistrationError::MalformedDeviceId));
    }

    #[test]
    fn has_channel_is_one_based_and_inclusive() {
        let device = new_device(4).into_device(time::macros::datetime!(2024-01-01 00:00:00 UTC));
        assert!(!device.has_channel(0));
        assert!(device.has_channel(1));
        assert!(device.has_channel(4));
        assert!(!device.has_channel(5));
    }
}

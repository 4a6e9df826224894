use std::sync::Arc;

use energy_client::domain::{BillSetting, BillingPeriod, Channel, Device, NewDevice, Profile, Unassignment};
use time::OffsetDateTime;

use crate::{error::ServiceError, store::Store};

/// Device management scoped by assignment. A device is shared by every user
/// who added it; each keeps their own device and channel names. Devices not
/// assigned to the caller are reported as not found.
pub struct Registry {
    store: Arc<dyn Store>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Registers a new device, or adds an already registered one to the
    /// caller's account when the channel counts agree.
    pub async fn register(&self, new_device: NewDevice, now: OffsetDateTime) -> Result<Device, ServiceError> {
        new_device.validate()?;

        if let Some(device) = self.store.register_device(&new_device, now).await? {
            metrics::counter!("devices_registered_total").increment(1);
            tracing::info!(
                device_id = %device.device_id,
                channels = device.channel_count,
                "device registered"
            );
            return Ok(device);
        }

        let Some(existing) = self.store.device(&new_device.device_id).await? else {
            return Err(ServiceError::Conflict(format!(
                "device {} changed while registering, retry",
                new_device.device_id
            )));
        };
        if existing.channel_count != new_device.channel_count {
            return Err(ServiceError::Conflict(format!(
                "device {} is registered with {} channels",
                existing.device_id, existing.channel_count
            )));
        }

        let assigned = self
            .store
            .assign_device(&existing, &new_device.owner_id, &new_device.device_name, now)
            .await?;
        if !assigned {
            return Err(ServiceError::Conflict(format!(
                "device {} is already on this account",
                existing.device_id
            )));
        }

        metrics::counter!("devices_assigned_total").increment(1);
        tracing::info!(device_id = %existing.device_id, user_id = %new_device.owner_id, "device assigned");
        Ok(Device {
            device_name: new_device.device_name,
            ..existing
        })
    }

    /// Device-facing lookup used by firmware on boot.
    pub async fn registration(&self, device_id: &str) -> Result<Option<Device>, ServiceError> {
        if device_id.trim().is_empty() {
            return Err(ServiceError::Validation("device_id is required".to_string()));
        }
        Ok(self.store.device(device_id).await?)
    }

    pub async fn devices(&self, user_id: &str) -> Result<Vec<Device>, ServiceError> {
        Ok(self.store.devices_for_user(user_id).await?)
    }

    pub async fn assigned_device(&self, device_id: &str, user_id: &str) -> Result<Device, ServiceError> {
        self.store
            .assigned_device(device_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::DeviceNotFound(device_id.to_string()))
    }

    pub async fn rename(&self, device_id: &str, user_id: &str, name: &str) -> Result<(), ServiceError> {
        let name = non_empty_name(name, "device_name")?;
        if self.store.rename_device(device_id, user_id, name).await? {
            Ok(())
        } else {
            Err(ServiceError::DeviceNotFound(device_id.to_string()))
        }
    }

    /// Drops the device from the caller's account. Returns true when that was
    /// the last assignment and the device itself is gone.
    pub async fn remove(&self, device_id: &str, user_id: &str) -> Result<bool, ServiceError> {
        match self.store.unassign_device(device_id, user_id).await? {
            Unassignment::NotAssigned => Err(ServiceError::DeviceNotFound(device_id.to_string())),
            Unassignment::Detached => {
                tracing::info!(device_id = %device_id, user_id = %user_id, "device unassigned");
                Ok(false)
            }
            Unassignment::Removed => {
                tracing::info!(device_id = %device_id, "device removed");
                Ok(true)
            }
        }
    }

    pub async fn channels(&self, device_id: &str, user_id: &str) -> Result<Vec<Channel>, ServiceError> {
        self.assigned_device(device_id, user_id).await?;
        Ok(self.store.channels(device_id, user_id).await?)
    }

    pub async fn rename_channel(
        &self,
        device_id: &str,
        channel_number: i32,
        user_id: &str,
        name: &str,
    ) -> Result<(), ServiceError> {
        let name = non_empty_name(name, "custom_name")?;
        let device = self.assigned_device(device_id, user_id).await?;
        if !device.has_channel(channel_number) {
            return Err(ServiceError::InvalidChannel {
                channel: channel_number,
                channel_count: device.channel_count,
            });
        }

        if self.store.rename_channel(device_id, channel_number, user_id, name).await? {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("channel {channel_number} of device {device_id}")))
        }
    }

    /// Bill setting shared by everyone on the device; none set bills nothing.
    pub async fn bill(&self, device_id: &str, user_id: &str) -> Result<BillSetting, ServiceError> {
        let device = self.assigned_device(device_id, user_id).await?;
        Ok(self
            .store
            .bill_setting(device_id)
            .await?
            .unwrap_or_else(|| BillSetting {
                device_id: device.device_id,
                total_bill_amount: 0.0,
                billing_period: BillingPeriod::default(),
                updated_at: device.created_at,
            }))
    }

    pub async fn set_bill(
        &self,
        device_id: &str,
        user_id: &str,
        amount: f64,
        period: BillingPeriod,
        now: OffsetDateTime,
    ) -> Result<BillSetting, ServiceError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(ServiceError::Validation(
                "total_bill_amount must be a non-negative number".to_string(),
            ));
        }
        self.assigned_device(device_id, user_id).await?;

        let setting = self.store.upsert_bill_setting(device_id, amount, period, now).await?;
        tracing::info!(device_id = %device_id, amount, period = %period, "bill setting updated");
        Ok(setting)
    }

    pub async fn set_profile(&self, user_id: &str, full_name: Option<String>) -> Result<Profile, ServiceError> {
        let profile = Profile {
            user_id: user_id.to_string(),
            full_name: full_name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
        };
        self.store.upsert_profile(&profile).await?;
        Ok(profile)
    }
}

fn non_empty_name<'a>(name: &'a str, field: &str) -> Result<&'a str, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::Validation(format!("{field} must not be empty")));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::store::MemoryStore;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    fn new_device(device_id: &str, channel_count: i32) -> NewDevice {
        NewDevice {
            device_id: device_id.to_string(),
            device_name: "Block A".to_string(),
            channel_count,
            owner_id: "owner".to_string(),
        }
    }

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn registration_creates_named_channels_and_zero_bill() {
        let reg = registry();
        reg.register(new_device("D1", 4), NOW).await.unwrap();

        let channels = reg.channels("D1", "owner").await.unwrap();
        let names: Vec<&str> = channels.iter().map(|c| c.custom_name.as_str()).collect();
        assert_eq!(names, vec!["House1", "House2", "House3", "House4"]);

        let bill = reg.bill("D1", "owner").await.unwrap();
        assert_eq!(bill.total_bill_amount, 0.0);
        assert_eq!(bill.billing_period, BillingPeriod::Monthly);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let reg = registry();
        reg.register(new_device("D1", 4), NOW).await.unwrap();
        assert!(matches!(
            reg.register(new_device("D1", 4), NOW).await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn second_tenant_shares_the_device() {
        let reg = registry();
        reg.register(new_device("D1", 4), NOW).await.unwrap();

        let mut tenant = new_device("D1", 4);
        tenant.owner_id = "tenant".to_string();
        tenant.device_name = "My flat".to_string();
        let shared = reg.register(tenant, NOW).await.unwrap();
        assert_eq!(shared.device_name, "My flat");
        assert_eq!(shared.owner_id, "owner");

        reg.rename_channel("D1", 1, "tenant", "Me").await.unwrap();
        assert_eq!(reg.channels("D1", "tenant").await.unwrap()[0].custom_name, "Me");
        assert_eq!(reg.channels("D1", "owner").await.unwrap()[0].custom_name, "House1");

        reg.set_bill("D1", "owner", 900.0, BillingPeriod::Monthly, NOW).await.unwrap();
        assert_eq!(reg.bill("D1", "tenant").await.unwrap().total_bill_amount, 900.0);
        assert_eq!(reg.devices("tenant").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sharing_requires_matching_channel_count() {
        let reg = registry();
        reg.register(new_device("D1", 4), NOW).await.unwrap();

        let mut tenant = new_device("D1", 8);
        tenant.owner_id = "tenant".to_string();
        assert!(matches!(reg.register(tenant, NOW).await, Err(ServiceError::Conflict(_))));
        assert!(reg.devices("tenant").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn device_survives_until_last_tenant_leaves() {
        let reg = registry();
        reg.register(new_device("D1", 4), NOW).await.unwrap();
        let mut tenant = new_device("D1", 4);
        tenant.owner_id = "tenant".to_string();
        reg.register(tenant, NOW).await.unwrap();

        assert!(!reg.remove("D1", "owner").await.unwrap());
        assert!(reg.registration("D1").await.unwrap().is_some());
        assert!(matches!(reg.bill("D1", "owner").await, Err(ServiceError::DeviceNotFound(_))));

        assert!(reg.remove("D1", "tenant").await.unwrap());
        assert!(reg.registration("D1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_registration_is_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.register(new_device("D1", 3), NOW).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            reg.register(new_device("bad id/..", 4), NOW).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unassigned_users_cannot_see_or_change_devices() {
        let reg = registry();
        reg.register(new_device("D1", 4), NOW).await.unwrap();

        assert!(matches!(reg.bill("D1", "intruder").await, Err(ServiceError::DeviceNotFound(_))));
        assert!(matches!(
            reg.rename("D1", "intruder", "Mine").await,
            Err(ServiceError::DeviceNotFound(_))
        ));
        assert!(matches!(reg.remove("D1", "intruder").await, Err(ServiceError::DeviceNotFound(_))));
        assert!(reg.devices("intruder").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn channel_rename_checks_range_and_name() {
        let reg = registry();
        reg.register(new_device("D1", 4), NOW).await.unwrap();

        reg.rename_channel("D1", 2, "owner", " Flat 2 ").await.unwrap();
        let channels = reg.channels("D1", "owner").await.unwrap();
        assert_eq!(channels[1].custom_name, "Flat 2");

        assert!(matches!(
            reg.rename_channel("D1", 5, "owner", "x").await,
            Err(ServiceError::InvalidChannel { channel: 5, .. })
        ));
        assert!(matches!(
            reg.rename_channel("D1", 1, "owner", "  ").await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn bill_updates_are_validated() {
        let reg = registry();
        reg.register(new_device("D1", 4), NOW).await.unwrap();

        let bill = reg
            .set_bill("D1", "owner", 4000.0, BillingPeriod::Quarterly, NOW)
            .await
            .unwrap();
        assert_eq!(bill.total_bill_amount, 4000.0);
        assert_eq!(reg.bill("D1", "owner").await.unwrap().billing_period, BillingPeriod::Quarterly);

        assert!(matches!(
            reg.set_bill("D1", "owner", -1.0, BillingPeriod::Monthly, NOW).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn removal_frees_the_device_id() {
        let reg = registry();
        reg.register(new_device("D1", 4), NOW).await.unwrap();
        reg.remove("D1", "owner").await.unwrap();

        assert!(reg.registration("D1").await.unwrap().is_none());
        reg.register(new_device("D1", 8), NOW).await.unwrap();
    }

    #[tokio::test]
    async fn blank_profile_names_are_dropped() {
        let reg = registry();
        let profile = reg.set_profile("u1", Some("   ".to_string())).await.unwrap();
        assert_eq!(profile.full_name, None);
    }
}

use async_trait::async_trait;
use energy_client::domain::{
    BillSetting, BillingPeriod, Channel, Device, NewDevice, OtaStatusUpdate, Profile, ResetSession, ResetVote,
    Unassignment, VoteInsert,
};
use time::{Duration, OffsetDateTime};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        Self::Backend(format!("{e:#}"))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Durable state behind the service: registry, bills, reset quorum, OTA reports.
///
/// Implementations must enforce vote uniqueness per (session, user) at write
/// time, keep at most one voting session per device and never admit more
/// votes into a session than it requires.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates the device and assigns it to its registering user.
    /// `None` when the device id is already registered.
    async fn register_device(&self, device: &NewDevice, now: OffsetDateTime) -> Result<Option<Device>, StoreError>;
    /// Shares a registered device with another user; false when already assigned.
    async fn assign_device(
        &self,
        device: &Device,
        user_id: &str,
        device_name: &str,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError>;
    async fn device(&self, device_id: &str) -> Result<Option<Device>, StoreError>;
    /// The device under the user's own name, when assigned to them.
    async fn assigned_device(&self, device_id: &str, user_id: &str) -> Result<Option<Device>, StoreError>;
    async fn devices_for_user(&self, user_id: &str) -> Result<Vec<Device>, StoreError>;
    async fn rename_device(&self, device_id: &str, user_id: &str, name: &str) -> Result<bool, StoreError>;
    async fn unassign_device(&self, device_id: &str, user_id: &str) -> Result<Unassignment, StoreError>;
    async fn channels(&self, device_id: &str, user_id: &str) -> Result<Vec<Channel>, StoreError>;
    async fn rename_channel(
        &self,
        device_id: &str,
        channel_number: i32,
        user_id: &str,
        name: &str,
    ) -> Result<bool, StoreError>;

    async fn bill_setting(&self, device_id: &str) -> Result<Option<BillSetting>, StoreError>;
    async fn upsert_bill_setting(
        &self,
        device_id: &str,
        amount: f64,
        period: BillingPeriod,
        now: OffsetDateTime,
    ) -> Result<BillSetting, StoreError>;

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError>;
    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>, StoreError>;

    /// `None` while an executing reset is still pending for the device.
    async fn open_voting_session(
        &self,
        device_id: &str,
        required_votes: i32,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<Option<ResetSession>, StoreError>;
    async fn active_voting_session(
        &self,
        device_id: &str,
        now: OffsetDateTime,
    ) -> Result<Option<ResetSession>, StoreError>;
    async fn executing_session(&self, device_id: &str) -> Result<Option<ResetSession>, StoreError>;
    /// Inserts the vote, updates the count and moves the session to
    /// executing on quorum, as one atomic step.
    async fn insert_vote(&self, vote: &ResetVote) -> Result<VoteInsert, StoreError>;
    async fn session_votes(&self, session_id: i64) -> Result<Vec<ResetVote>, StoreError>;
    async fn complete_session(&self, session_id: i64) -> Result<bool, StoreError>;
    async fn expire_stale_sessions(&self, now: OffsetDateTime) -> Result<u64, StoreError>;

    async fn record_ota_status(&self, update: &OtaStatusUpdate) -> Result<(), StoreError>;
}

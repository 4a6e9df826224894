use async_trait::async_trait;
use energy_client::{
    db::{bill_queries, device_queries, ota_queries, reset_queries},
    domain::{
        BillSetting, BillingPeriod, Channel, Device, NewDevice, OtaStatusUpdate, Profile, ResetSession, ResetVote,
        Unassignment, VoteInsert,
    },
};
use sqlx::postgres::PgPool;
use time::{Duration, OffsetDateTime};

use super::{Store, StoreError};

/// `Store` backed by Postgres; schema lives in `sql/schema/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn register_device(&self, device: &NewDevice, now: OffsetDateTime) -> Result<Option<Device>, StoreError> {
        Ok(device_queries::register_device(&self.pool, device, now).await?)
    }

    async fn assign_device(
        &self,
        device: &Device,
        user_id: &str,
        device_name: &str,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        Ok(device_queries::assign_device(&self.pool, device, user_id, device_name, now).await?)
    }

    async fn device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(device_queries::find_device(&self.pool, device_id).await?)
    }

    async fn assigned_device(&self, device_id: &str, user_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(device_queries::assigned_device(&self.pool, device_id, user_id).await?)
    }

    async fn devices_for_user(&self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        Ok(device_queries::devices_for_user(&self.pool, user_id).await?)
    }

    async fn rename_device(&self, device_id: &str, user_id: &str, name: &str) -> Result<bool, StoreError> {
        Ok(device_queries::rename_device(&self.pool, device_id, user_id, name).await?)
    }

    async fn unassign_device(&self, device_id: &str, user_id: &str) -> Result<Unassignment, StoreError> {
        Ok(device_queries::unassign_device(&self.pool, device_id, user_id).await?)
    }

    async fn channels(&self, device_id: &str, user_id: &str) -> Result<Vec<Channel>, StoreError> {
        Ok(device_queries::channels(&self.pool, device_id, user_id).await?)
    }

    async fn rename_channel(
        &self,
        device_id: &str,
        channel_number: i32,
        user_id: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        Ok(device_queries::rename_channel(&self.pool, device_id, channel_number, user_id, name).await?)
    }

    async fn bill_setting(&self, device_id: &str) -> Result<Option<BillSetting>, StoreError> {
        Ok(bill_queries::bill_setting(&self.pool, device_id).await?)
    }

    async fn upsert_bill_setting(
        &self,
        device_id: &str,
        amount: f64,
        period: BillingPeriod,
        now: OffsetDateTime,
    ) -> Result<BillSetting, StoreError> {
        Ok(bill_queries::upsert_bill_setting(&self.pool, device_id, amount, period, now).await?)
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        Ok(reset_queries::upsert_profile(&self.pool, profile).await?)
    }

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>, StoreError> {
        Ok(reset_queries::profiles(&self.pool, user_ids).await?)
    }

    async fn open_voting_session(
        &self,
        device_id: &str,
        required_votes: i32,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<Option<ResetSession>, StoreError> {
        Ok(reset_queries::open_voting_session(&self.pool, device_id, required_votes, now, ttl).await?)
    }

    async fn active_voting_session(
        &self,
        device_id: &str,
        now: OffsetDateTime,
    ) -> Result<Option<ResetSession>, StoreError> {
        Ok(reset_queries::active_voting_session(&self.pool, device_id, now).await?)
    }

    async fn executing_session(&self, device_id: &str) -> Result<Option<ResetSession>, StoreError> {
        Ok(reset_queries::executing_session(&self.pool, device_id).await?)
    }

    async fn insert_vote(&self, vote: &ResetVote) -> Result<VoteInsert, StoreError> {
        Ok(reset_queries::insert_vote(&self.pool, vote).await?)
    }

    async fn session_votes(&self, session_id: i64) -> Result<Vec<ResetVote>, StoreError> {
        Ok(reset_queries::session_votes(&self.pool, session_id).await?)
    }

    async fn complete_session(&self, session_id: i64) -> Result<bool, StoreError> {
        Ok(reset_queries::complete_session(&self.pool, session_id).await?)
    }

    async fn expire_stale_sessions(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        Ok(reset_queries::expire_stale_sessions(&self.pool, now).await?)
    }

    async fn record_ota_status(&self, update: &OtaStatusUpdate) -> Result<(), StoreError> {
        Ok(ota_queries::insert_ota_status(&self.pool, update).await?)
    }
}

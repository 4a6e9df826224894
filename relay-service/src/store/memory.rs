use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use energy_client::domain::{
    device::default_channels, quorum_reached, BillSetting, BillingPeriod, Channel, Device, NewDevice,
    OtaStatusUpdate, Profile, ResetSession, ResetVote, SessionStatus, Unassignment, VoteInsert,
};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use super::{Store, StoreError};

struct Assignment {
    device_name: String,
    created_at: OffsetDateTime,
}

#[derive(Default)]
struct State {
    devices: BTreeMap<String, Device>,
    /// Keyed by (device_id, user_id).
    assignments: BTreeMap<(String, String), Assignment>,
    /// Keyed by (device_id, user_id, channel_number).
    channels: BTreeMap<(String, String, i32), Channel>,
    bills: HashMap<String, BillSetting>,
    profiles: HashMap<String, Profile>,
    sessions: BTreeMap<i64, ResetSession>,
    next_session_id: i64,
    votes: Vec<ResetVote>,
    ota_updates: Vec<OtaStatusUpdate>,
}

impl State {
    fn add_channels(&mut self, channels: Vec<Channel>) {
        for ch in channels {
            self.channels
                .entry((ch.device_id.clone(), ch.user_id.clone(), ch.channel_number))
                .or_insert(ch);
        }
    }

    fn assigned(&self, device_id: &str, user_id: &str) -> Option<Device> {
        let assignment = self.assignments.get(&(device_id.to_string(), user_id.to_string()))?;
        self.devices.get(device_id).map(|d| Device {
            device_name: assignment.device_name.clone(),
            ..d.clone()
        })
    }

    fn voting_session_mut(&mut self, device_id: &str) -> Option<&mut ResetSession> {
        self.sessions
            .values_mut()
            .find(|s| s.device_id == device_id && s.status == SessionStatus::Voting)
    }
}

/// Process-local `Store` for tests and single-node runs without a database.
///
/// One lock guards all tables, so every operation is atomic on its own.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ota_updates(&self, device_id: &str) -> Vec<OtaStatusUpdate> {
        let state = self.state.lock().await;
        state
            .ota_updates
            .iter()
            .filter(|u| u.device_id == device_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_device(&self, device: &NewDevice, now: OffsetDateTime) -> Result<Option<Device>, StoreError> {
        let mut state = self.state.lock().await;
        if state.devices.contains_key(&device.device_id) {
            return Ok(None);
        }

        state.add_channels(device.channels());
        state.assignments.insert(
            (device.device_id.clone(), device.owner_id.clone()),
            Assignment {
                device_name: device.device_name.clone(),
                created_at: now,
            },
        );
        state.bills.entry(device.device_id.clone()).or_insert_with(|| BillSetting {
            device_id: device.device_id.clone(),
            total_bill_amount: 0.0,
            billing_period: BillingPeriod::Monthly,
            updated_at: now,
        });

        let created = device.clone().into_device(now);
        state.devices.insert(created.device_id.clone(), created.clone());
        Ok(Some(created))
    }

    async fn assign_device(
        &self,
        device: &Device,
        user_id: &str,
        device_name: &str,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = (device.device_id.clone(), user_id.to_string());
        if !state.devices.contains_key(&device.device_id) || state.assignments.contains_key(&key) {
            return Ok(false);
        }

        state.assignments.insert(
            key,
            Assignment {
                device_name: device_name.to_string(),
                created_at: now,
            },
        );
        state.add_channels(default_channels(&device.device_id, device.channel_count, user_id));
        Ok(true)
    }

    async fn device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.state.lock().await.devices.get(device_id).cloned())
    }

    async fn assigned_device(&self, device_id: &str, user_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.state.lock().await.assigned(device_id, user_id))
    }

    async fn devices_for_user(&self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        let state = self.state.lock().await;
        let mut assigned: Vec<(OffsetDateTime, Device)> = state
            .assignments
            .iter()
            .filter(|((_, user), _)| user == user_id)
            .filter_map(|((device_id, _), a)| state.assigned(device_id, user_id).map(|d| (a.created_at, d)))
            .collect();
        assigned.sort_by(|(a_at, a), (b_at, b)| (a_at, &a.device_id).cmp(&(b_at, &b.device_id)));
        Ok(assigned.into_iter().map(|(_, d)| d).collect())
    }

    async fn rename_device(&self, device_id: &str, user_id: &str, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.assignments.get_mut(&(device_id.to_string(), user_id.to_string())) {
            Some(a) => {
                a.device_name = name.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn unassign_device(&self, device_id: &str, user_id: &str) -> Result<Unassignment, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .assignments
            .remove(&(device_id.to_string(), user_id.to_string()))
            .is_none()
        {
            return Ok(Unassignment::NotAssigned);
        }
        state
            .channels
            .retain(|(id, user, _), _| !(id == device_id && user == user_id));

        if state.assignments.keys().any(|(id, _)| id == device_id) {
            return Ok(Unassignment::Detached);
        }

        state.devices.remove(device_id);
        state.channels.retain(|(id, _, _), _| id != device_id);
        state.bills.remove(device_id);
        state.sessions.retain(|_, s| s.device_id != device_id);
        state.votes.retain(|v| v.device_id != device_id);
        Ok(Unassignment::Removed)
    }

    async fn channels(&self, device_id: &str, user_id: &str) -> Result<Vec<Channel>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .channels
            .values()
            .filter(|c| c.device_id == device_id && c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn rename_channel(
        &self,
        device_id: &str,
        channel_number: i32,
        user_id: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = (device_id.to_string(), user_id.to_string(), channel_number);
        match state.channels.get_mut(&key) {
            Some(ch) => {
                ch.custom_name = name.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn bill_setting(&self, device_id: &str) -> Result<Option<BillSetting>, StoreError> {
        Ok(self.state.lock().await.bills.get(device_id).cloned())
    }

    async fn upsert_bill_setting(
        &self,
        device_id: &str,
        amount: f64,
        period: BillingPeriod,
        now: OffsetDateTime,
    ) -> Result<BillSetting, StoreError> {
        let setting = BillSetting {
            device_id: device_id.to_string(),
            total_bill_amount: amount,
            billing_period: period,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .bills
            .insert(device_id.to_string(), setting.clone());
        Ok(setting)
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .profiles
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>, StoreError> {
        let state = self.state.lock().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| state.profiles.get(id).cloned())
            .collect())
    }

    async fn open_voting_session(
        &self,
        device_id: &str,
        required_votes: i32,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<Option<ResetSession>, StoreError> {
        let mut state = self.state.lock().await;

        let executing = state
            .sessions
            .values()
            .any(|s| s.device_id == device_id && s.status == SessionStatus::Executing);
        if executing {
            return Ok(None);
        }

        if let Some(session) = state.voting_session_mut(device_id) {
            if !session.is_expired(now) {
                return Ok(Some(session.clone()));
            }
            session.status = SessionStatus::Expired;
        }

        state.next_session_id += 1;
        let session = ResetSession {
            id: state.next_session_id,
            device_id: device_id.to_string(),
            required_votes,
            votes_received: 0,
            status: SessionStatus::Voting,
            created_at: now,
            expires_at: now + ttl,
            reset_executed_at: None,
        };
        state.sessions.insert(session.id, session.clone());
        Ok(Some(session))
    }

    async fn active_voting_session(
        &self,
        device_id: &str,
        now: OffsetDateTime,
    ) -> Result<Option<ResetSession>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .values()
            .find(|s| s.device_id == device_id && s.is_open(now))
            .cloned())
    }

    async fn executing_session(&self, device_id: &str) -> Result<Option<ResetSession>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .values()
            .rev()
            .find(|s| s.device_id == device_id && s.status == SessionStatus::Executing)
            .cloned())
    }

    async fn insert_vote(&self, vote: &ResetVote) -> Result<VoteInsert, StoreError> {
        let mut state = self.state.lock().await;

        let duplicate = state
            .votes
            .iter()
            .any(|v| v.session_id == vote.session_id && v.user_id == vote.user_id);
        if duplicate {
            return Ok(VoteInsert::Duplicate);
        }

        let votes = state.votes.iter().filter(|v| v.session_id == vote.session_id).count() as i64;
        let Some(session) = state.sessions.get_mut(&vote.session_id) else {
            return Ok(VoteInsert::SessionClosed);
        };
        if session.status != SessionStatus::Voting || quorum_reached(votes, session.required_votes) {
            return Ok(VoteInsert::SessionClosed);
        }

        let votes_received = i32::try_from(votes + 1).unwrap_or(i32::MAX);
        let reset_triggered = quorum_reached(votes + 1, session.required_votes);
        session.votes_received = votes_received;
        if reset_triggered {
            session.status = SessionStatus::Executing;
            session.reset_executed_at = Some(vote.voted_at);
        }
        state.votes.push(vote.clone());

        Ok(VoteInsert::Inserted {
            votes_received,
            reset_triggered,
        })
    }

    async fn session_votes(&self, session_id: i64) -> Result<Vec<ResetVote>, StoreError> {
        let state = self.state.lock().await;
        let mut votes: Vec<ResetVote> = state
            .votes
            .iter()
            .filter(|v| v.session_id == session_id)
            .cloned()
            .collect();
        votes.sort_by_key(|v| v.voted_at);
        Ok(votes)
    }

    async fn complete_session(&self, session_id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let completed = match state.sessions.get_mut(&session_id) {
            Some(s) if s.status == SessionStatus::Executing => {
                s.status = SessionStatus::Completed;
                true
            }
            _ => false,
        };
        state.votes.retain(|v| v.session_id != session_id);
        Ok(completed)
    }

    async fn expire_stale_sessions(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for s in state.sessions.values_mut() {
            if s.status == SessionStatus::Voting && s.is_expired(now) {
                s.status = SessionStatus::Expired;
                expired += 1;
            }
        }

        let State { sessions, votes, .. } = &mut *state;
        votes.retain(|v| {
            sessions
                .get(&v.session_id)
                .map_or(true, |s| s.status != SessionStatus::Expired)
        });
        Ok(expired)
    }

    async fn record_ota_status(&self, update: &OtaStatusUpdate) -> Result<(), StoreError> {
        self.state.lock().await.ota_updates.push(update.clone());
        Ok(())
    }
}

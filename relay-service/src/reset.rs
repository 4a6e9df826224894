use std::{collections::HashMap, sync::Arc};

use energy_client::domain::{ResetSession, ResetVote, VoteInsert};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::{error::ServiceError, store::Store};

pub const RESET_DONE_MESSAGE: &str = "Energy counters have been reset successfully!";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoteOutcome {
    pub session_id: i64,
    pub votes_received: i32,
    pub required_votes: i32,
    pub reset_triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoterView {
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub voted_at: OffsetDateTime,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetStatus {
    pub session: Option<ResetSession>,
    pub votes: Vec<VoterView>,
    pub required_votes: i32,
    pub votes_received: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollOutcome {
    pub reset_command: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Energy-reset quorum: every channel's household must agree before the
/// device is told to zero its counters.
pub struct ResetTracker {
    store: Arc<dyn Store>,
    session_ttl: Duration,
}

impl ResetTracker {
    pub fn new(store: Arc<dyn Store>, session_ttl: Duration) -> Self {
        Self { store, session_ttl }
    }

    /// Votes are only accepted from users the device is assigned to.
    pub async fn vote(
        &self,
        device_id: &str,
        user_id: &str,
        now: OffsetDateTime,
    ) -> Result<VoteOutcome, ServiceError> {
        let device = self
            .store
            .assigned_device(device_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::DeviceNotFound(device_id.to_string()))?;

        let Some(session) = self
            .store
            .open_voting_session(device_id, device.channel_count, now, self.session_ttl)
            .await?
        else {
            metrics::counter!("reset_votes_rejected_total", "reason" => "pending").increment(1);
            return Err(ServiceError::ResetPending(device_id.to_string()));
        };

        let vote = ResetVote {
            session_id: session.id,
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            voted_at: now,
        };
        let (votes_received, reset_triggered) = match self.store.insert_vote(&vote).await? {
            VoteInsert::Inserted {
                votes_received,
                reset_triggered,
            } => (votes_received, reset_triggered),
            VoteInsert::Duplicate => {
                metrics::counter!("reset_votes_rejected_total", "reason" => "duplicate").increment(1);
                return Err(ServiceError::DuplicateVote);
            }
            VoteInsert::SessionClosed => {
                metrics::counter!("reset_votes_rejected_total", "reason" => "closed").increment(1);
                return Err(ServiceError::ResetPending(device_id.to_string()));
            }
        };
        metrics::counter!("reset_votes_total").increment(1);

        if reset_triggered {
            metrics::counter!("reset_triggered_total").increment(1);
            tracing::info!(
                device_id = %device_id,
                session_id = session.id,
                votes = votes_received,
                "energy reset triggered"
            );
        }

        tracing::debug!(device_id = %device_id, session_id = session.id, votes = votes_received, "reset vote recorded");
        Ok(VoteOutcome {
            session_id: session.id,
            votes_received,
            required_votes: session.required_votes,
            reset_triggered,
        })
    }

    /// The open voting session (or the reset awaiting pickup) with its voters.
    pub async fn status(
        &self,
        device_id: &str,
        user_id: &str,
        now: OffsetDateTime,
    ) -> Result<ResetStatus, ServiceError> {
        let device = self
            .store
            .assigned_device(device_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::DeviceNotFound(device_id.to_string()))?;

        let session = match self.store.active_voting_session(device_id, now).await? {
            Some(s) => Some(s),
            None => self.store.executing_session(device_id).await?,
        };

        let Some(session) = session else {
            return Ok(ResetStatus {
                session: None,
                votes: Vec::new(),
                required_votes: device.channel_count,
                votes_received: 0,
            });
        };

        let votes = self.store.session_votes(session.id).await?;
        let user_ids: Vec<String> = votes.iter().map(|v| v.user_id.clone()).collect();
        let names: HashMap<String, String> = self
            .store
            .profiles(&user_ids)
            .await?
            .into_iter()
            .filter_map(|p| p.full_name.map(|name| (p.user_id, name)))
            .collect();

        let votes: Vec<VoterView> = votes
            .into_iter()
            .map(|v| VoterView {
                display_name: names.get(&v.user_id).cloned().unwrap_or_else(|| v.user_id.clone()),
                user_id: v.user_id,
                voted_at: v.voted_at,
            })
            .collect();

        Ok(ResetStatus {
            required_votes: session.required_votes,
            votes_received: votes.len() as i32,
            votes,
            session: Some(session),
        })
    }

    /// Device-side poll. A pending reset is delivered until it is marked
    /// complete, so a failed completion only means the device resets twice.
    pub async fn poll(&self, device_id: &str) -> Result<PollOutcome, ServiceError> {
        let Some(session) = self.store.executing_session(device_id).await? else {
            return Ok(PollOutcome {
                reset_command: false,
                message: None,
            });
        };

        match self.store.complete_session(session.id).await {
            Ok(_) => {
                tracing::info!(device_id = %device_id, session_id = session.id, "energy reset delivered");
            }
            Err(e) => {
                tracing::warn!(
                    device_id = %device_id,
                    session_id = session.id,
                    error = %e,
                    "failed to complete reset session, command will be redelivered"
                );
            }
        }

        Ok(PollOutcome {
            reset_command: true,
            message: Some(RESET_DONE_MESSAGE.to_string()),
        })
    }

    pub async fn expire_stale(&self, now: OffsetDateTime) -> Result<u64, ServiceError> {
        let expired = self.store.expire_stale_sessions(now).await?;
        if expired > 0 {
            tracing::info!(expired, "expired stale reset sessions");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use energy_client::domain::{NewDevice, Profile, SessionStatus, DEFAULT_SESSION_TTL};
    use time::macros::datetime;

    use super::*;
    use crate::store::MemoryStore;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);
    const TENANTS: [&str; 8] = ["u1", "u2", "u3", "u4", "u5", "u6", "u7", "u8"];

    async fn tracker(channel_count: i32) -> (ResetTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let device = store
            .register_device(
                &NewDevice {
                    device_id: "D1".to_string(),
                    device_name: "Compound meter".to_string(),
                    channel_count,
                    owner_id: "owner".to_string(),
                },
                NOW,
            )
            .await
            .unwrap()
            .unwrap();
        for user in TENANTS {
            store.assign_device(&device, user, "Compound meter", NOW).await.unwrap();
        }
        (ResetTracker::new(store.clone(), DEFAULT_SESSION_TTL), store)
    }

    #[tokio::test]
    async fn fourth_distinct_vote_triggers_reset() {
        let (resets, _) = tracker(4).await;

        for (i, user) in ["u1", "u2", "u3"].iter().enumerate() {
            let outcome = resets.vote("D1", user, NOW).await.unwrap();
            assert_eq!(outcome.votes_received, i as i32 + 1);
            assert_eq!(outcome.required_votes, 4);
            assert!(!outcome.reset_triggered);
        }

        let last = resets.vote("D1", "u4", NOW).await.unwrap();
        assert_eq!(last.votes_received, 4);
        assert!(last.reset_triggered);
    }

    #[tokio::test]
    async fn repeat_vote_is_a_conflict_and_count_is_unchanged() {
        let (resets, _) = tracker(4).await;
        resets.vote("D1", "u1", NOW).await.unwrap();

        assert!(matches!(resets.vote("D1", "u1", NOW).await, Err(ServiceError::DuplicateVote)));

        let status = resets.status("D1", "u2", NOW).await.unwrap();
        assert_eq!(status.votes_received, 1);
        assert_eq!(status.session.map(|s| s.votes_received), Some(1));
    }

    #[tokio::test]
    async fn only_assigned_users_vote_or_see_status() {
        let (resets, _) = tracker(4).await;
        assert!(matches!(
            resets.vote("nope", "u1", NOW).await,
            Err(ServiceError::DeviceNotFound(_))
        ));
        assert!(matches!(
            resets.vote("D1", "stranger", NOW).await,
            Err(ServiceError::DeviceNotFound(_))
        ));
        assert!(matches!(
            resets.status("D1", "stranger", NOW).await,
            Err(ServiceError::DeviceNotFound(_))
        ));
        assert!(resets.status("D1", "owner", NOW).await.is_ok());
    }

    #[tokio::test]
    async fn votes_during_pending_reset_are_rejected() {
        let (resets, _) = tracker(4).await;
        for user in ["u1", "u2", "u3", "u4"] {
            resets.vote("D1", user, NOW).await.unwrap();
        }
        assert!(matches!(
            resets.vote("D1", "u5", NOW).await,
            Err(ServiceError::ResetPending(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_voters_never_overfill_a_session() {
        let (resets, store) = tracker(4).await;
        let resets = Arc::new(resets);

        for _ in 0..50 {
            let handles: Vec<_> = TENANTS
                .into_iter()
                .map(|user| {
                    let resets = resets.clone();
                    tokio::spawn(async move { resets.vote("D1", user, NOW).await })
                })
                .collect();

            let mut accepted = Vec::new();
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(outcome) => accepted.push(outcome),
                    Err(ServiceError::ResetPending(_)) => {}
                    Err(e) => panic!("unexpected vote error: {e}"),
                }
            }

            assert_eq!(accepted.len(), 4);
            assert!(accepted.iter().all(|o| o.votes_received <= o.required_votes));
            assert_eq!(accepted.iter().filter(|o| o.reset_triggered).count(), 1);

            let session = store.executing_session("D1").await.unwrap().unwrap();
            assert_eq!(session.votes_received, 4);
            assert_eq!(store.session_votes(session.id).await.unwrap().len(), 4);

            assert!(resets.poll("D1").await.unwrap().reset_command);
        }
    }

    #[tokio::test]
    async fn poll_delivers_once_then_clears() {
        let (resets, store) = tracker(4).await;
        assert!(!resets.poll("D1").await.unwrap().reset_command);

        for user in ["u1", "u2", "u3", "u4"] {
            resets.vote("D1", user, NOW).await.unwrap();
        }

        let first = resets.poll("D1").await.unwrap();
        assert!(first.reset_command);
        assert_eq!(first.message.as_deref(), Some(RESET_DONE_MESSAGE));
        assert!(!resets.poll("D1").await.unwrap().reset_command);
        assert!(store.executing_session("D1").await.unwrap().is_none());

        // A fresh round starts from zero.
        let next = resets.vote("D1", "u1", NOW).await.unwrap();
        assert_eq!(next.votes_received, 1);
    }

    #[tokio::test]
    async fn expired_session_is_replaced_by_a_fresh_one() {
        let (resets, store) = tracker(4).await;
        let first = resets.vote("D1", "u1", NOW).await.unwrap();

        let later = NOW + DEFAULT_SESSION_TTL + Duration::minutes(1);
        let second = resets.vote("D1", "u1", later).await.unwrap();

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(second.votes_received, 1);
        assert!(store.active_voting_session("D1", later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expire_stale_closes_old_sessions() {
        let (resets, store) = tracker(4).await;
        resets.vote("D1", "u1", NOW).await.unwrap();

        let later = NOW + DEFAULT_SESSION_TTL;
        assert_eq!(resets.expire_stale(later).await.unwrap(), 1);
        assert!(store.active_voting_session("D1", later).await.unwrap().is_none());

        let status = resets.status("D1", "u1", later).await.unwrap();
        assert!(status.session.is_none());
        assert_eq!(status.required_votes, 4);
    }

    #[tokio::test]
    async fn status_labels_voters_by_profile_name() {
        let (resets, store) = tracker(4).await;
        store
            .upsert_profile(&Profile {
                user_id: "u1".to_string(),
                full_name: Some("Ada Obi".to_string()),
            })
            .await
            .unwrap();
        resets.vote("D1", "u1", NOW).await.unwrap();
        resets.vote("D1", "u2", NOW).await.unwrap();

        let status = resets.status("D1", "u1", NOW).await.unwrap();
        let names: Vec<&str> = status.votes.iter().map(|v| v.display_name.as_str()).collect();
        assert!(names.contains(&"Ada Obi"));
        assert!(names.contains(&"u2"));
        assert_eq!(status.session.map(|s| s.status), Some(SessionStatus::Voting));
    }
}

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

pub const DEFAULT_SESSION_TTL: Duration = Duration::hours(24);

/// Lifecycle of an energy-counter reset.
///
/// `Voting -> Executing` once the quorum is reached, `Executing -> Completed`
/// when the device picks up the command. A voting session past its expiry is
/// moved to `Expired` before a new one is opened for the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Voting,
    Executing,
    Completed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voting => "voting",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voting" => Ok(Self::Voting),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetSession {
    pub id: i64,
    pub device_id: String,
    pub required_votes: i32,
    pub votes_received: i32,
    pub status: SessionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reset_executed_at: Option<OffsetDateTime>,
}

impl ResetSession {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Accepting votes: still voting and not past its expiry.
    pub fn is_open(&self, now: OffsetDateTime) -> bool {
        self.status == SessionStatus::Voting && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResetVote {
    pub session_id: i64,
    pub device_id: String,
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub voted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub user_id: String,
    pub full_name: Option<String>,
}

/// Result of trying to record a vote in a session.
///
/// The insert, the new count and the switch to `Executing` happen as one
/// step, so `votes_received` never exceeds the session's `required_votes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteInsert {
    Inserted { votes_received: i32, reset_triggered: bool },
    /// The user already has a vote in this session.
    Duplicate,
    /// The session stopped accepting votes or already holds its quorum.
    SessionClosed,
}

pub fn quorum_reached(votes_received: i64, required_votes: i32) -> bool {
    votes_received >= i64::from(required_votes)
}

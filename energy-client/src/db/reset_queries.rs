use anyhow::{anyhow, Result};
use sqlx::{postgres::PgRow, PgPool, Row};
use time::{Duration, OffsetDateTime};

use crate::domain::{quorum_reached, Profile, ResetSession, ResetVote, SessionStatus, VoteInsert};

const SESSION_COLUMNS: &str =
    "id, device_id, required_votes, votes_received, status, created_at, expires_at, reset_executed_at";

fn session_from_row(row: &PgRow) -> Result<ResetSession> {
    let status: String = row.try_get("status")?;
    Ok(ResetSession {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        required_votes: row.try_get("required_votes")?,
        votes_received: row.try_get("votes_received")?,
        status: status.parse().map_err(|e: String| anyhow!(e))?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        reset_executed_at: row.try_get("reset_executed_at")?,
    })
}

/// Return the device's open voting session, creating one if needed, or `None`
/// while a reset is still waiting for the device to pick it up.
///
/// The device row is locked for the transaction, which serialises this with
/// vote inserts and keeps at most one voting session per device. A voting
/// session past its expiry is marked `expired` before the replacement opens.
pub async fn open_voting_session(
    pool: &PgPool,
    device_id: &str,
    required_votes: i32,
    now: OffsetDateTime,
    ttl: Duration,
) -> Result<Option<ResetSession>> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT 1 FROM devices WHERE device_id = $1 FOR UPDATE")
        .bind(device_id)
        .execute(&mut *tx)
        .await?;

    let executing: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM reset_sessions WHERE device_id = $1 AND status = 'executing')",
    )
    .bind(device_id)
    .fetch_one(&mut *tx)
    .await?;
    if executing {
        tx.rollback().await?;
        return Ok(None);
    }

    sqlx::query(
        r#"
        UPDATE reset_sessions
        SET status = 'expired'
        WHERE device_id = $1 AND status = 'voting' AND expires_at <= $2
        "#,
    )
    .bind(device_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO reset_sessions (device_id, required_votes, votes_received, status, created_at, expires_at)
        VALUES ($1, $2, 0, 'voting', $3, $4)
        ON CONFLICT (device_id) WHERE status = 'voting' DO NOTHING
        "#,
    )
    .bind(device_id)
    .bind(required_votes)
    .bind(now)
    .bind(now + ttl)
    .execute(&mut *tx)
    .await?;

    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM reset_sessions WHERE device_id = $1 AND status = 'voting'"
    ))
    .bind(device_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    session_from_row(&row).map(Some)
}

pub async fn active_voting_session(
    pool: &PgPool,
    device_id: &str,
    now: OffsetDateTime,
) -> Result<Option<ResetSession>> {
    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM reset_sessions \
         WHERE device_id = $1 AND status = 'voting' AND expires_at > $2"
    ))
    .bind(device_id)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(session_from_row).transpose()
}

pub async fn executing_session(pool: &PgPool, device_id: &str) -> Result<Option<ResetSession>> {
    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM reset_sessions \
         WHERE device_id = $1 AND status = 'executing' \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(session_from_row).transpose()
}

/// Record a vote, refresh the session's count and flip it to `executing` when
/// the quorum is reached, all under the device and session row locks.
///
/// A session that already holds `required_votes` votes admits no more.
pub async fn insert_vote(pool: &PgPool, vote: &ResetVote) -> Result<VoteInsert> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT 1 FROM devices WHERE device_id = $1 FOR UPDATE")
        .bind(&vote.device_id)
        .execute(&mut *tx)
        .await?;

    let session = sqlx::query("SELECT required_votes, status FROM reset_sessions WHERE id = $1 FOR UPDATE")
        .bind(vote.session_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(session) = session else {
        tx.rollback().await?;
        return Ok(VoteInsert::SessionClosed);
    };
    let required_votes: i32 = session.try_get("required_votes")?;
    let status: String = session.try_get("status")?;

    let already_voted: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM reset_votes WHERE session_id = $1 AND user_id = $2)",
    )
    .bind(vote.session_id)
    .bind(&vote.user_id)
    .fetch_one(&mut *tx)
    .await?;
    if already_voted {
        tx.rollback().await?;
        return Ok(VoteInsert::Duplicate);
    }

    let votes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reset_votes WHERE session_id = $1")
        .bind(vote.session_id)
        .fetch_one(&mut *tx)
        .await?;
    if status != SessionStatus::Voting.as_str() || quorum_reached(votes, required_votes) {
        tx.rollback().await?;
        return Ok(VoteInsert::SessionClosed);
    }

    sqlx::query(
        r#"
        INSERT INTO reset_votes (session_id, device_id, user_id, voted_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(vote.session_id)
    .bind(&vote.device_id)
    .bind(&vote.user_id)
    .bind(vote.voted_at)
    .execute(&mut *tx)
    .await?;

    let votes_received = i32::try_from(votes + 1)?;
    let reset_triggered = quorum_reached(votes + 1, required_votes);
    sqlx::query(
        r#"
        UPDATE reset_sessions
        SET votes_received = $2,
            status = CASE WHEN $3 THEN 'executing' ELSE status END,
            reset_executed_at = CASE WHEN $3 THEN $4 ELSE reset_executed_at END
        WHERE id = $1
        "#,
    )
    .bind(vote.session_id)
    .bind(votes_received)
    .bind(reset_triggered)
    .bind(vote.voted_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(VoteInsert::Inserted {
        votes_received,
        reset_triggered,
    })
}

pub async fn session_votes(pool: &PgPool, session_id: i64) -> Result<Vec<ResetVote>> {
    let rows = sqlx::query_as::<_, ResetVote>(
        r#"
        SELECT session_id, device_id, user_id, voted_at
        FROM reset_votes
        WHERE session_id = $1
        ORDER BY voted_at
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Mark an executing session completed and clear its votes in one transaction.
pub async fn complete_session(pool: &PgPool, session_id: i64) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let res = sqlx::query("UPDATE reset_sessions SET status = 'completed' WHERE id = $1 AND status = 'executing'")
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM reset_votes WHERE session_id = $1")
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(res.rows_affected() == 1)
}

/// Expire every voting session past its deadline and drop the votes cast in them.
pub async fn expire_stale_sessions(pool: &PgPool, now: OffsetDateTime) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let expired = sqlx::query(
        r#"
        UPDATE reset_sessions
        SET status = 'expired'
        WHERE status = 'voting' AND expires_at <= $1
        "#,
    )
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    sqlx::query(
        r#"
        DELETE FROM reset_votes v
        USING reset_sessions s
        WHERE v.session_id = s.id AND s.status = 'expired'
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(expired)
}

pub async fn upsert_profile(pool: &PgPool, profile: &Profile) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO profiles (user_id, full_name)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE SET full_name = EXCLUDED.full_name
        "#,
    )
    .bind(&profile.user_id)
    .bind(&profile.full_name)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn profiles(pool: &PgPool, user_ids: &[String]) -> Result<Vec<Profile>> {
    let rows = sqlx::query_as::<_, Profile>("SELECT user_id, full_name FROM profiles WHERE user_id = ANY($1)")
        .bind(user_ids)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

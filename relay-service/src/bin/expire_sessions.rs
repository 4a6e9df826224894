use std::sync::Arc;

use anyhow::Result;
use relay_service::{config::AppConfig, observability, reset::ResetTracker, store::PgStore};
use sqlx::postgres::PgPoolOptions;
use time::{Duration, OffsetDateTime};

/// Marks voting sessions past their expiry as expired and drops their votes.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let db = cfg
        .database
        .ok_or_else(|| anyhow::anyhow!("expire_sessions needs a [database] section"))?;

    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(&db.uri)
        .await?;

    // Schema is expected to be applied out-of-band via `sql/schema/*.sql`.
    let resets = ResetTracker::new(
        Arc::new(PgStore::new(pool)),
        Duration::hours(cfg.reset.session_ttl_hours),
    );
    let expired = resets.expire_stale(OffsetDateTime::now_utc()).await?;

    tracing::info!(expired, "reset session expiry complete");
    Ok(())
}

use anyhow::Result;
use sqlx::PgPool;

use crate::domain::OtaStatusUpdate;

pub async fn insert_ota_status(pool: &PgPool, update: &OtaStatusUpdate) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ota_status_updates
            (device_id, status, progress, message, device_timestamp, firmware_version, received_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&update.device_id)
    .bind(update.status.as_str())
    .bind(update.progress)
    .bind(&update.message)
    .bind(&update.device_timestamp)
    .bind(&update.firmware_version)
    .bind(update.received_at)
    .execute(pool)
    .await?;

    Ok(())
}

use anyhow::{anyhow, Result};
use sqlx::{postgres::PgRow, PgPool, Row};
use time::OffsetDateTime;

use crate::domain::{BillSetting, BillingPeriod};

fn bill_from_row(row: &PgRow) -> Result<BillSetting> {
    let period: String = row.try_get("billing_period")?;
    Ok(BillSetting {
        device_id: row.try_get("device_id")?,
        total_bill_amount: row.try_get("total_bill_amount")?,
        billing_period: period.parse().map_err(|e: String| anyhow!(e))?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn bill_setting(pool: &PgPool, device_id: &str) -> Result<Option<BillSetting>> {
    let row = sqlx::query(
        r#"
        SELECT device_id, total_bill_amount, billing_period, updated_at
        FROM bill_settings
        WHERE device_id = $1
        "#,
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(bill_from_row).transpose()
}

pub async fn upsert_bill_setting(
    pool: &PgPool,
    device_id: &str,
    total_bill_amount: f64,
    billing_period: BillingPeriod,
    updated_at: OffsetDateTime,
) -> Result<BillSetting> {
    let row = sqlx::query(
        r#"
        INSERT INTO bill_settings (device_id, total_bill_amount, billing_period, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (device_id) DO UPDATE
        SET total_bill_amount = EXCLUDED.total_bill_amount,
            billing_period    = EXCLUDED.billing_period,
            updated_at        = EXCLUDED.updated_at
        RETURNING device_id, total_bill_amount, billing_period, updated_at
        "#,
    )
    .bind(device_id)
    .bind(total_bill_amount)
    .bind(billing_period.as_str())
    .bind(updated_at)
    .fetch_one(pool)
    .await?;

    bill_from_row(&row)
}

use anyhow::Result;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{device::default_channels, Channel, Device, NewDevice, Unassignment};

const ASSIGNED_DEVICE_COLUMNS: &str = "d.device_id, a.device_name, d.channel_count, d.owner_id, d.created_at";

async fn insert_channels(conn: &mut PgConnection, channels: &[Channel]) -> Result<()> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO device_channels (device_id, user_id, channel_number, custom_name) ",
    );
    builder.push_values(channels, |mut b, ch| {
        b.push_bind(&ch.device_id)
            .push_bind(&ch.user_id)
            .push_bind(ch.channel_number)
            .push_bind(&ch.custom_name);
    });
    builder.push(" ON CONFLICT DO NOTHING");
    builder.build().execute(&mut *conn).await?;

    Ok(())
}

/// Register a device with the caller's assignment, default channels and a zero bill.
///
/// Returns `None` when the device id is already taken.
pub async fn register_device(
    pool: &PgPool,
    new_device: &NewDevice,
    created_at: OffsetDateTime,
) -> Result<Option<Device>> {
    let mut tx = pool.begin().await?;

    let device = sqlx::query_as::<_, Device>(
        r#"
        INSERT INTO devices (device_id, device_name, channel_count, owner_id, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (device_id) DO NOTHING
        RETURNING device_id, device_name, channel_count, owner_id, created_at
        "#,
    )
    .bind(&new_device.device_id)
    .bind(&new_device.device_name)
    .bind(new_device.channel_count)
    .bind(&new_device.owner_id)
    .bind(created_at)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(device) = device else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query(
        r#"
        INSERT INTO device_assignments (device_id, user_id, device_name, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(&device.device_id)
    .bind(&device.owner_id)
    .bind(&device.device_name)
    .bind(created_at)
    .execute(&mut *tx)
    .await?;

    insert_channels(&mut tx, &new_device.channels()).await?;

    sqlx::query(
        r#"
        INSERT INTO bill_settings (device_id, total_bill_amount, billing_period, updated_at)
        VALUES ($1, 0, 'monthly', $2)
        ON CONFLICT (device_id) DO NOTHING
        "#,
    )
    .bind(&device.device_id)
    .bind(created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(device))
}

/// Attach an already registered device to another user's account.
///
/// Returns false when the user already has it.
pub async fn assign_device(
    pool: &PgPool,
    device: &Device,
    user_id: &str,
    device_name: &str,
    assigned_at: OffsetDateTime,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let res = sqlx::query(
        r#"
        INSERT INTO device_assignments (device_id, user_id, device_name, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (device_id, user_id) DO NOTHING
        "#,
    )
    .bind(&device.device_id)
    .bind(user_id)
    .bind(device_name)
    .bind(assigned_at)
    .execute(&mut *tx)
    .await?;

    if res.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    insert_channels(&mut tx, &default_channels(&device.device_id, device.channel_count, user_id)).await?;

    tx.commit().await?;
    Ok(true)
}

pub async fn find_device(pool: &PgPool, device_id: &str) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>(
        r#"
        SELECT device_id, device_name, channel_count, owner_id, created_at
        FROM devices
        WHERE device_id = $1
        "#,
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    Ok(device)
}

/// The device as `user_id` sees it (their own device name), if assigned.
pub async fn assigned_device(pool: &PgPool, device_id: &str, user_id: &str) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>(&format!(
        "SELECT {ASSIGNED_DEVICE_COLUMNS} \
         FROM device_assignments a JOIN devices d ON d.device_id = a.device_id \
         WHERE a.device_id = $1 AND a.user_id = $2"
    ))
    .bind(device_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(device)
}

pub async fn devices_for_user(pool: &PgPool, user_id: &str) -> Result<Vec<Device>> {
    let rows = sqlx::query_as::<_, Device>(&format!(
        "SELECT {ASSIGNED_DEVICE_COLUMNS} \
         FROM device_assignments a JOIN devices d ON d.device_id = a.device_id \
         WHERE a.user_id = $1 \
         ORDER BY a.created_at, d.device_id"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn rename_device(pool: &PgPool, device_id: &str, user_id: &str, device_name: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE device_assignments SET device_name = $3 WHERE device_id = $1 AND user_id = $2")
        .bind(device_id)
        .bind(user_id)
        .bind(device_name)
        .execute(pool)
        .await?;

    Ok(res.rows_affected() == 1)
}

/// Drop the user's assignment and channel names. The last assignment takes the
/// device with it; bill setting and reset sessions follow by FK cascade.
pub async fn unassign_device(pool: &PgPool, device_id: &str, user_id: &str) -> Result<Unassignment> {
    let mut tx = pool.begin().await?;

    // Serialises concurrent removals of the last two assignments.
    sqlx::query("SELECT 1 FROM devices WHERE device_id = $1 FOR UPDATE")
        .bind(device_id)
        .execute(&mut *tx)
        .await?;

    let res = sqlx::query("DELETE FROM device_assignments WHERE device_id = $1 AND user_id = $2")
        .bind(device_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(Unassignment::NotAssigned);
    }

    sqlx::query("DELETE FROM device_channels WHERE device_id = $1 AND user_id = $2")
        .bind(device_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    let shared: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM device_assignments WHERE device_id = $1)")
        .bind(device_id)
        .fetch_one(&mut *tx)
        .await?;

    let outcome = if shared {
        Unassignment::Detached
    } else {
        sqlx::query("DELETE FROM devices WHERE device_id = $1")
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
        Unassignment::Removed
    };

    tx.commit().await?;
    Ok(outcome)
}

pub async fn channels(pool: &PgPool, device_id: &str, user_id: &str) -> Result<Vec<Channel>> {
    let rows = sqlx::query_as::<_, Channel>(
        r#"
        SELECT device_id, channel_number, custom_name, user_id
        FROM device_channels
        WHERE device_id = $1 AND user_id = $2
        ORDER BY channel_number
        "#,
    )
    .bind(device_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn rename_channel(
    pool: &PgPool,
    device_id: &str,
    channel_number: i32,
    user_id: &str,
    custom_name: &str,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE device_channels
        SET custom_name = $4
        WHERE device_id = $1 AND channel_number = $2 AND user_id = $3
        "#,
    )
    .bind(device_id)
    .bind(channel_number)
    .bind(user_id)
    .bind(custom_name)
    .execute(pool)
    .await?;

    Ok(res.rows_affected() == 1)
}

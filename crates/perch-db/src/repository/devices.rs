//! Device repository — device rows, online flags, ownership.

use perch_common::models::device::Device;

/// Create a new device row.
pub async fn create_device(
    pool: &sqlx::PgPool,
    device_id: &str,
    device_name: Option<&str>,
    device_type: &str,
) -> Result<Device, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        r#"
        INSERT INTO devices (device_id, device_name, device_type)
        VALUES ($1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(device_id)
    .bind(device_name)
    .bind(device_type)
    .fetch_one(pool)
    .await
}

/// Find a device by its database id.
pub async fn find_by_id(pool: &sqlx::PgPool, id: i64) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Find a device by its wire-level string id.
pub async fn find_by_device_id(
    pool: &sqlx::PgPool,
    device_id: &str,
) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE device_id = $1")
        .bind(device_id)
        .fetch_optional(pool)
        .await
}

/// Flip the durable online flag. `last_seen` always moves to now so that an
/// offline device reports when it was last heard from.
pub async fn set_online(
    pool: &sqlx::PgPool,
    device_id: &str,
    online: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE devices
        SET is_online = $2, last_seen = now(), updated_at = now()
        WHERE device_id = $1
        "#,
    )
    .bind(device_id)
    .bind(online)
    .execute(pool)
    .await?;
    Ok(())
}

/// All devices a user owns, through the ownership join.
pub async fn list_owned(pool: &sqlx::PgPool, user_id: i64) -> Result<Vec<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        r#"
        SELECT d.* FROM devices d
        INNER JOIN device_ownership o ON o.device_id = d.id
        WHERE o.user_id = $1
        ORDER BY d.created_at
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Record ownership of a device. Idempotent on the (user, device) pair.
pub async fn insert_ownership(
    pool: &sqlx::PgPool,
    user_id: i64,
    device_db_id: i64,
    role: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO device_ownership (user_id, device_id, role)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id, device_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(device_db_id)
    .bind(role)
    .execute(pool)
    .await?;
    Ok(())
}

//! Pairing-code repository.
//!
//! Redemption is the concurrency-sensitive operation: the UPDATE guarded on
//! `is_used = FALSE` makes consumption atomic, so the same code can never
//! produce two ownership rows.

use chrono::{DateTime, Utc};
use perch_common::models::device::PairingCode;

/// Whether an outstanding row already uses this code (used rows still occupy
/// the code until they age out of the unique index).
pub async fn code_exists(pool: &sqlx::PgPool, code: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM pairing_codes WHERE code = $1")
        .bind(code)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Persist a freshly generated code.
pub async fn insert_code(
    pool: &sqlx::PgPool,
    device_db_id: i64,
    code: &str,
    expires_at: DateTime<Utc>,
) -> Result<PairingCode, sqlx::Error> {
    sqlx::query_as::<_, PairingCode>(
        r#"
        INSERT INTO pairing_codes (device_id, code, expires_at)
        VALUES ($1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(device_db_id)
    .bind(code)
    .bind(expires_at)
    .fetch_one(pool)
    .await
}

/// Consume an unused, unexpired code. Returns `None` when the code is
/// unknown, expired, or was already consumed — including by a concurrent
/// redemption that got there first.
pub async fn consume_code(
    pool: &sqlx::PgPool,
    code: &str,
) -> Result<Option<PairingCode>, sqlx::Error> {
    sqlx::query_as::<_, PairingCode>(
        r#"
        UPDATE pairing_codes
        SET is_used = TRUE
        WHERE code = $1 AND is_used = FALSE AND expires_at > now()
        RETURNING *
        "#,
    )
    .bind(code)
    .fetch_optional(pool)
    .await
}

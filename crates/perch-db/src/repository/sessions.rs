//! Watch-session repository.
//!
//! The session state machine lives in these queries: `pending → active` and
//! `{pending, active} → ended` are single guarded UPDATEs, so the first
//! writer wins and `ended` rows are never mutated again, no matter how many
//! handlers race on the same session.

use perch_common::models::session::{EndReason, SessionStatus, WatchSession};

/// The routing view of a session: enough to forward a signaling message or
/// notify the counterpart, without dragging the full row around.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRoute {
    pub session_id: String,
    pub user_id: i64,
    /// Database id of the device.
    pub device_id: i64,
    /// Wire-level string id of the device.
    pub device_ref: String,
    pub status: SessionStatus,
}

/// Insert a new session in `pending`.
pub async fn insert(
    pool: &sqlx::PgPool,
    session_id: &str,
    user_id: i64,
    device_db_id: i64,
) -> Result<WatchSession, sqlx::Error> {
    sqlx::query_as::<_, WatchSession>(
        r#"
        INSERT INTO watch_sessions (session_id, user_id, device_id)
        VALUES ($1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(session_id)
    .bind(user_id)
    .bind(device_db_id)
    .fetch_one(pool)
    .await
}

/// Look up a session with its device's wire id.
pub async fn find_route(
    pool: &sqlx::PgPool,
    session_id: &str,
) -> Result<Option<SessionRoute>, sqlx::Error> {
    sqlx::query_as::<_, SessionRoute>(
        r#"
        SELECT ws.session_id, ws.user_id, ws.device_id, d.device_id AS device_ref, ws.status
        FROM watch_sessions ws
        INNER JOIN devices d ON d.id = ws.device_id
        WHERE ws.session_id = $1
        "#,
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await
}

/// Promote `pending → active`. Returns false when the session was not in
/// `pending` (already active, already ended, or unknown).
pub async fn activate(pool: &sqlx::PgPool, session_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE watch_sessions
        SET status = 'active'
        WHERE session_id = $1 AND status = 'pending'
        "#,
    )
    .bind(session_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Terminate a live session. Returns the routing view of the row when this
/// call was the one that ended it; `None` when it was already ended or
/// unknown, so callers can skip the notification fanout.
pub async fn end(
    pool: &sqlx::PgPool,
    session_id: &str,
    reason: EndReason,
) -> Result<Option<SessionRoute>, sqlx::Error> {
    sqlx::query_as::<_, SessionRoute>(
        r#"
        UPDATE watch_sessions ws
        SET status = 'ended', ended_at = now(), ended_reason = $2
        FROM devices d
        WHERE ws.session_id = $1
          AND ws.status IN ('pending', 'active')
          AND d.id = ws.device_id
        RETURNING ws.session_id, ws.user_id, ws.device_id, d.device_id AS device_ref, ws.status
        "#,
    )
    .bind(session_id)
    .bind(reason)
    .fetch_optional(pool)
    .await
}

/// Live (`pending` or `active`) sessions attached to a device.
pub async fn live_for_device(
    pool: &sqlx::PgPool,
    device_ref: &str,
) -> Result<Vec<SessionRoute>, sqlx::Error> {
    sqlx::query_as::<_, SessionRoute>(
        r#"
        SELECT ws.session_id, ws.user_id, ws.device_id, d.device_id AS device_ref, ws.status
        FROM watch_sessions ws
        INNER JOIN devices d ON d.id = ws.device_id
        WHERE d.device_id = $1 AND ws.status IN ('pending', 'active')
        "#,
    )
    .bind(device_ref)
    .fetch_all(pool)
    .await
}

/// Live sessions attached to a viewer.
pub async fn live_for_user(
    pool: &sqlx::PgPool,
    user_id: i64,
) -> Result<Vec<SessionRoute>, sqlx::Error> {
    sqlx::query_as::<_, SessionRoute>(
        r#"
        SELECT ws.session_id, ws.user_id, ws.device_id, d.device_id AS device_ref, ws.status
        FROM watch_sessions ws
        INNER JOIN devices d ON d.id = ws.device_id
        WHERE ws.user_id = $1 AND ws.status IN ('pending', 'active')
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Live sessions older than `age_secs`, candidates for the timeout sweep.
pub async fn live_older_than(
    pool: &sqlx::PgPool,
    age_secs: f64,
) -> Result<Vec<SessionRoute>, sqlx::Error> {
    sqlx::query_as::<_, SessionRoute>(
        r#"
        SELECT ws.session_id, ws.user_id, ws.device_id, d.device_id AS device_ref, ws.status
        FROM watch_sessions ws
        INNER JOIN devices d ON d.id = ws.device_id
        WHERE ws.status IN ('pending', 'active')
          AND ws.started_at < now() - make_interval(secs => $1)
        "#,
    )
    .bind(age_secs)
    .fetch_all(pool)
    .await
}

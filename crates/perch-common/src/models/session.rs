//! Watch-session model and its state machine vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single watch interaction between one viewer and one device.
///
/// Status transitions obey `pending → active → ended` (or `pending → ended`);
/// once `ended` the row is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WatchSession {
    pub id: i64,

    /// Opaque session identifier used on the wire.
    pub session_id: String,

    pub user_id: i64,

    /// Database id of the device; the wire-level string id comes from a join.
    pub device_id: i64,

    pub status: SessionStatus,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_reason: Option<EndReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
}

/// Why a session reached `ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserEnded,
    DeviceDisconnected,
    ViewerDisconnected,
    Timeout,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndReason::UserEnded => "user_ended",
            EndReason::DeviceDisconnected => "device_disconnected",
            EndReason::ViewerDisconnected => "viewer_disconnected",
            EndReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

//! Device, ownership, and pairing-code models.
//!
//! A device is an edge camera (or simulator) identified by a stable string
//! `device_id`. The numeric `id` is the database key; the string id is what
//! travels over the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// An edge device.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,

    /// Globally unique device identifier string.
    pub device_id: String,

    pub device_name: Option<String>,

    /// Device kind, default `camera`.
    pub device_type: String,

    /// Set by the hub on connect/disconnect. The in-process registry is the
    /// source of truth for liveness; this flag is the durable shadow.
    pub is_online: bool,

    pub last_seen: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// (user, device, role) ownership triple, unique on (user, device).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceOwnership {
    pub id: i64,
    pub user_id: i64,
    pub device_id: i64,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// Short numeric pairing code, consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PairingCode {
    pub id: i64,
    pub device_id: i64,
    pub code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Device self-registration request.
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterDeviceRequest {
    #[validate(length(min = 1, max = 100, message = "device_id must be 1-100 characters"))]
    pub device_id: String,

    #[validate(length(max = 255))]
    pub device_name: Option<String>,

    #[serde(default = "default_device_type")]
    pub device_type: String,
}

fn default_device_type() -> String {
    "camera".to_string()
}

/// Device representation for API responses.
#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub id: i64,
    pub device_id: String,
    pub device_name: Option<String>,
    pub device_type: String,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<Device> for DeviceResponse {
    fn from(d: Device) -> Self {
        Self {
            id: d.id,
            device_id: d.device_id,
            device_name: d.device_name,
            device_type: d.device_type,
            is_online: d.is_online,
            last_seen: d.last_seen,
        }
    }
}

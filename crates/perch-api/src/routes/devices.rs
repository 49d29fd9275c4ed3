//! Device routes — registration, listing, pairing redemption, status.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Extension, Json, Router,
};
use perch_common::{
    error::{PerchError, PerchResult},
    models::device::{DeviceResponse, RegisterDeviceRequest},
    validation::validate_request,
};
use perch_db::repository::{devices, pairing};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{middleware, AppState};

pub fn router() -> Router<Arc<AppState>> {
    let authed = Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/pair", post(pair_device))
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/devices/register", post(register_device))
        .route("/devices/{device_id}/status", get(device_status))
        .merge(authed)
}

#[derive(Serialize)]
struct RegisterDeviceResponse {
    device_id: String,
    message: &'static str,
}

/// POST /api/devices/register
///
/// Public endpoint for device initial setup. Idempotent on `device_id`.
async fn register_device(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterDeviceRequest>,
) -> PerchResult<Json<RegisterDeviceResponse>> {
    validate_request(&body)?;

    if let Some(existing) = devices::find_by_device_id(&state.db.pool, &body.device_id).await? {
        return Ok(Json(RegisterDeviceResponse {
            device_id: existing.device_id,
            message: "Device already registered",
        }));
    }

    let device = devices::create_device(
        &state.db.pool,
        &body.device_id,
        body.device_name.as_deref(),
        &body.device_type,
    )
    .await?;

    tracing::info!(device = %device.device_id, "Device registered");

    Ok(Json(RegisterDeviceResponse {
        device_id: device.device_id,
        message: "Device registered successfully",
    }))
}

/// GET /api/devices
///
/// Devices owned by the authenticated user.
async fn list_devices(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<middleware::AuthContext>,
) -> PerchResult<Json<Vec<DeviceResponse>>> {
    let owned = devices::list_owned(&state.db.pool, auth.user_id).await?;
    Ok(Json(owned.into_iter().map(DeviceResponse::from).collect()))
}

#[derive(Deserialize)]
struct PairingRequest {
    pairing_code: String,
}

#[derive(Serialize)]
struct PairedDevice {
    device_id: String,
    device_name: Option<String>,
}

#[derive(Serialize)]
struct PairResponse {
    message: &'static str,
    device: PairedDevice,
}

/// POST /api/devices/pair
///
/// Redeem a pairing code. Consumption is atomic: under concurrent redemption
/// of the same code exactly one caller succeeds, the rest see 404.
async fn pair_device(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<middleware::AuthContext>,
    Json(body): Json<PairingRequest>,
) -> PerchResult<Json<PairResponse>> {
    let code = pairing::consume_code(&state.db.pool, &body.pairing_code)
        .await?
        .ok_or(PerchError::NotFound {
            resource: "Pairing code".into(),
        })?;

    devices::insert_ownership(&state.db.pool, auth.user_id, code.device_id, "owner").await?;

    let device = devices::find_by_id(&state.db.pool, code.device_id)
        .await?
        .ok_or(PerchError::NotFound {
            resource: "Device".into(),
        })?;

    tracing::info!(user_id = %auth.user_id, device = %device.device_id, "Device paired");

    Ok(Json(PairResponse {
        message: "Device paired successfully",
        device: PairedDevice {
            device_id: device.device_id,
            device_name: device.device_name,
        },
    }))
}

#[derive(Serialize)]
struct DeviceStatusResponse {
    device_id: String,
    is_online: bool,
    last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

/// GET /api/devices/{device_id}/status
///
/// Liveness comes from the registry; `last_seen` from the durable row.
async fn device_status(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> PerchResult<Json<DeviceStatusResponse>> {
    let device = devices::find_by_device_id(&state.db.pool, &device_id)
        .await?
        .ok_or(PerchError::NotFound {
            resource: "Device".into(),
        })?;

    Ok(Json(DeviceStatusResponse {
        is_online: state.registry.is_device_online(&device.device_id),
        device_id: device.device_id,
        last_seen: device.last_seen,
    }))
}

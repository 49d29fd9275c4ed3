//! Pairing-code generation, called by the device.

use axum::{
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use perch_common::error::{PerchError, PerchResult};
use perch_db::repository::{devices, pairing};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/pairing/generate", post(generate_pairing_code))
}

#[derive(Deserialize)]
struct GenerateQuery {
    device_id: String,
}

#[derive(Serialize)]
struct GenerateResponse {
    code: String,
    expires_at: chrono::DateTime<Utc>,
    ttl: i64,
}

/// POST /api/pairing/generate?device_id=...
async fn generate_pairing_code(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GenerateQuery>,
) -> PerchResult<Json<GenerateResponse>> {
    let device = devices::find_by_device_id(&state.db.pool, &query.device_id)
        .await?
        .ok_or(PerchError::NotFound {
            resource: "Device".into(),
        })?;

    let config = perch_common::config::get();

    // Re-roll until the code is unique among outstanding rows.
    let code = loop {
        let candidate = random_code(config.pairing.code_length);
        if !pairing::code_exists(&state.db.pool, &candidate).await? {
            break candidate;
        }
    };

    let expires_at = Utc::now() + chrono::Duration::seconds(config.pairing.ttl_secs);
    let row = pairing::insert_code(&state.db.pool, device.id, &code, expires_at).await?;

    tracing::info!(device = %device.device_id, "Pairing code generated");

    Ok(Json(GenerateResponse {
        code: row.code,
        expires_at: row.expires_at,
        ttl: config.pairing.ttl_secs,
    }))
}

fn random_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_code_is_numeric_and_sized() {
        for length in [4, 6, 8] {
            let code = random_code(length);
            assert_eq!(code.len(), length);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}

//! Authentication routes — register and login.

use axum::{extract::State, routing::post, Json, Router};
use perch_common::{
    error::{PerchError, PerchResult},
    models::user::{CreateUserRequest, LoginRequest, UserResponse},
    validation::validate_request,
};
use perch_db::repository::users;
use serde::Serialize;
use std::sync::Arc;

use crate::{auth, AppState};

/// Auth router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
}

#[derive(Serialize)]
struct AuthResponse {
    access_token: String,
    token_type: String,
    user: UserResponse,
}

/// POST /api/auth/register
///
/// Create a new account. Returns the user profile plus a bearer token.
async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateUserRequest>,
) -> PerchResult<Json<AuthResponse>> {
    validate_request(&body)?;

    if users::find_by_username(&state.db.pool, &body.username)
        .await?
        .is_some()
    {
        return Err(PerchError::AlreadyExists {
            resource: "Username".into(),
        });
    }

    if users::find_by_email(&state.db.pool, &body.email)
        .await?
        .is_some()
    {
        return Err(PerchError::AlreadyExists {
            resource: "Email".into(),
        });
    }

    let password_hash = auth::hash_password(&body.password)
        .map_err(|e| PerchError::Internal(anyhow::anyhow!("{e}")))?;

    let user = users::create_user(&state.db.pool, &body.username, &body.email, &password_hash)
        .await?;

    let config = perch_common::config::get();
    let access_token = auth::generate_access_token(
        user.id,
        &user.username,
        &config.auth.jwt_secret,
        config.auth.token_ttl_secs,
    )
    .map_err(|e| PerchError::Internal(e.into()))?;

    tracing::info!(user_id = %user.id, username = %user.username, "New user registered");

    Ok(Json(AuthResponse {
        access_token,
        token_type: "bearer".to_string(),
        user: user.into(),
    }))
}

/// POST /api/auth/login
///
/// Authenticate with username + password. Returns a bearer token.
async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> PerchResult<Json<AuthResponse>> {
    validate_request(&body)?;

    let user = users::find_by_username(&state.db.pool, &body.username)
        .await?
        .ok_or(PerchError::InvalidCredentials)?;

    let valid = auth::verify_password(&body.password, &user.password_hash)
        .map_err(|_| PerchError::InvalidCredentials)?;
    if !valid {
        return Err(PerchError::InvalidCredentials);
    }

    if !user.is_active {
        return Err(PerchError::Unauthorized);
    }

    let config = perch_common::config::get();
    let access_token = auth::generate_access_token(
        user.id,
        &user.username,
        &config.auth.jwt_secret,
        config.auth.token_ttl_secs,
    )
    .map_err(|e| PerchError::Internal(e.into()))?;

    tracing::info!(user_id = %user.id, "User logged in");

    Ok(Json(AuthResponse {
        access_token,
        token_type: "bearer".to_string(),
        user: user.into(),
    }))
}

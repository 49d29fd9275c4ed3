//! # perch-api
//!
//! REST API layer for Perch: authentication, device registration and
//! pairing, device status, and the tunnel proxy frontend.

pub mod auth;
pub mod middleware;
pub mod routes;

use axum::Router;
use perch_db::{Database, PresenceStore};
use perch_hub::registry::ConnectionRegistry;
use std::sync::Arc;

/// Shared application state available to all route handlers. Created once at
/// startup and threaded in as a parameter — no module-level globals.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub presence: PresenceStore,
    /// The hub's connection registry — authoritative for device liveness.
    pub registry: Arc<ConnectionRegistry>,
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .merge(routes::auth::router())
        .merge(routes::devices::router())
        .merge(routes::pairing::router())
        .merge(routes::proxy::router());

    Router::new()
        .merge(routes::health::router())
        .nest("/api", api_routes)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

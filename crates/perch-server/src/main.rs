//! # Perch Server
//!
//! Main binary: REST API and the WebSocket signaling hub in one process,
//! sharing a single connection registry and presence store.

use perch_api::AppState;
use perch_db::{Database, PresenceStore};
use perch_hub::registry::ConnectionRegistry;
use perch_hub::{HubState, HubTuning};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = perch_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "perch_server=debug,perch_hub=debug,perch_api=debug,perch_db=debug,tower_http=debug".into()
                }),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting Perch v{}", env!("CARGO_PKG_VERSION"));

    // Connect to stores
    let db = Database::connect(config).await?;
    db.migrate().await?;
    let presence = PresenceStore::connect(config).await;

    // One registry, created here and threaded into both routers.
    let registry = Arc::new(ConnectionRegistry::new());

    let hub_state = Arc::new(HubState {
        db: db.clone(),
        presence: presence.clone(),
        registry: registry.clone(),
        tuning: HubTuning::from_config(config),
    });
    let maintenance = perch_hub::spawn_maintenance(hub_state.clone());

    let app = perch_api::build_router(AppState {
        db,
        presence,
        registry,
    })
    .merge(perch_hub::build_router(hub_state.clone()));

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("Listening on http://{addr} (WebSocket endpoints at /ws/device, /ws/viewer)");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub_state))
        .await?;

    maintenance.abort();
    tracing::info!("Perch stopped");
    Ok(())
}

/// Resolve on Ctrl-C: stop accepting, close live channels with "going away",
/// and give in-flight writes a moment to drain.
async fn shutdown_signal(hub: Arc<HubState>) {
    let _ = tokio::signal::ctrl_c().await;
    perch_hub::begin_shutdown(&hub);
    tokio::time::sleep(Duration::from_millis(500)).await;
}

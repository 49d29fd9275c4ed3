//! # perch-hub
//!
//! The signaling hub: WebSocket endpoints for devices and viewers, the
//! connection registry, and the router that drives the watch-session state
//! machine. The hub never terminates media — SDP and ICE payloads pass
//! through opaque.

pub mod registry;
pub mod router;
pub mod ws;

use axum::{routing::get, Router};
use perch_common::proto::close;
use perch_db::{Database, PresenceStore};
use registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Hub state threaded into the socket handlers and the HTTP layer. Created
/// once at startup; no module-level globals.
pub struct HubState {
    pub db: Database,
    pub presence: PresenceStore,
    pub registry: Arc<ConnectionRegistry>,
    pub tuning: HubTuning,
}

/// Connection-level knobs, resolved from config at startup.
#[derive(Debug, Clone)]
pub struct HubTuning {
    pub write_timeout: Duration,
    pub send_queue_depth: usize,
    pub heartbeat_timeout: Duration,
}

impl HubTuning {
    pub fn from_config(config: &perch_common::config::AppConfig) -> Self {
        Self {
            write_timeout: Duration::from_secs(config.ws.write_timeout_secs),
            send_queue_depth: config.ws.send_queue_depth,
            heartbeat_timeout: Duration::from_secs(config.ws.heartbeat_timeout_secs),
        }
    }
}

/// Build the WebSocket router.
pub fn build_router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws/device", get(ws::device_ws_handler))
        .route("/ws/viewer", get(ws::viewer_ws_handler))
        .with_state(state)
}

/// Spawn the background maintenance loop: evicts connections whose heartbeat
/// went stale and sweeps orphaned sessions to `ended/timeout`.
pub fn spawn_maintenance(state: Arc<HubState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;

            let cutoff = state.tuning.heartbeat_timeout;
            for device_id in state.registry.stale_devices(cutoff) {
                tracing::warn!(device = %device_id, "Heartbeat stale — evicting connection");
                state
                    .registry
                    .evict_device(&device_id, close::INTERNAL_ERROR, "heartbeat timeout");
            }
            for user_id in state.registry.stale_viewers(cutoff) {
                tracing::warn!(user = %user_id, "Heartbeat stale — evicting connection");
                state
                    .registry
                    .evict_viewer(user_id, close::INTERNAL_ERROR, "heartbeat timeout");
            }

            router::sweep_stale_sessions(&state).await;
        }
    })
}

/// Begin shutdown: every live connection is asked to close with "going away".
/// Readers observe the close and run their normal detach path.
pub fn begin_shutdown(state: &HubState) {
    tracing::info!(
        connections = state.registry.connection_count(),
        "Hub shutting down — closing connections"
    );
    state.registry.close_all(close::GOING_AWAY, "going away");
}

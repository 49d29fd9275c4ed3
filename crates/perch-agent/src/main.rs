//! Perch device agent binary.
//!
//! Maintains the signaling connection to the hub, answers tunneled HTTP
//! requests against the local media control plane, and hands watch-session
//! signaling to the media layer. Without a media producer attached it logs
//! session lifecycle events, which is what a headless install wants anyway.

use clap::Parser;
use perch_agent::agent::{Agent, AgentConfig, SessionEvent};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "perch-agent", version, about = "Perch device agent")]
struct Args {
    /// Hub WebSocket URL
    #[arg(long, env = "PERCH_HUB_URL", default_value = "ws://localhost:8000/ws/device")]
    hub_url: String,

    /// Unique device identifier (generated if omitted)
    #[arg(long, env = "PERCH_DEVICE_ID")]
    device_id: Option<String>,

    /// Base URL of the local media control plane
    #[arg(long, env = "PERCH_LOCAL_HTTP", default_value = "http://127.0.0.1:1984")]
    local_http: String,

    /// Shared device secret
    #[arg(long, env = "PERCH_DEVICE_SECRET")]
    device_secret: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "perch_agent=debug"
    } else {
        "perch_agent=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let device_id = args
        .device_id
        .unwrap_or_else(|| format!("device-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

    tracing::info!(device = %device_id, hub = %args.hub_url, local = %args.local_http, "Starting Perch device agent");

    let (agent, mut events, _signals) = Agent::new(AgentConfig {
        hub_url: args.hub_url,
        device_id,
        local_http: args.local_http,
        device_secret: args.device_secret,
    });

    // Default media integration: log the session lifecycle. A real producer
    // consumes these events and answers through the SignalSender.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::WatchRequested { session_id, user_id, .. } => {
                    tracing::info!(session = %session_id, user = %user_id, "No media producer attached — session will idle");
                }
                SessionEvent::OfferReceived { session_id, .. } => {
                    tracing::debug!(session = %session_id, "Offer received");
                }
                SessionEvent::IceReceived { session_id, .. } => {
                    tracing::debug!(session = %session_id, "Candidate received");
                }
                SessionEvent::WatchEnded { session_id, reason } => {
                    tracing::info!(session = %session_id, reason = %reason, "Session ended");
                }
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
        // Keep the sender alive so receivers see the flag, not a closed channel.
        std::future::pending::<()>().await;
    });

    agent.run(shutdown_rx).await;
    tracing::info!("Agent stopped");
}

//! The resilient hub connection.
//!
//! One task owns the socket read loop; writes from every other task are
//! serialized through a single mutex-guarded sink. Heartbeat, capabilities,
//! health-probe, and in-flight proxy tasks all live in a per-connection task
//! set and are cancelled the moment the socket drops. Reconnects use
//! exponential backoff with jitter, reset by a successful `hello_ack`.

use anyhow::Result;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use perch_common::models::session::EndReason;
use perch_common::proto::{
    Capabilities, Empty, Envelope, Hello, IceCandidate, MessageBody, Sdp, SessionIce, SessionSdp,
    WatchRequest,
};
use perch_common::turn::IceServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::local;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CAPABILITIES_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const BACKOFF_CAP_SECS: u64 = 30;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hub WebSocket URL (`ws://host/ws/device`).
    pub hub_url: String,
    pub device_id: String,
    /// Base URL of the local media control plane.
    pub local_http: String,
    pub device_secret: Option<String>,
}

/// Watch-session events surfaced to the media layer. The agent carries
/// signaling; producing frames is someone else's job.
#[derive(Debug)]
pub enum SessionEvent {
    WatchRequested {
        session_id: String,
        user_id: i64,
        ice_servers: Vec<IceServer>,
    },
    OfferReceived {
        session_id: String,
        sdp: Sdp,
    },
    IceReceived {
        session_id: String,
        candidate: IceCandidate,
    },
    WatchEnded {
        session_id: String,
        reason: EndReason,
    },
}

/// Serialized write access to the current socket, if any. Non-essential
/// frames sent while disconnected are dropped.
#[derive(Clone)]
struct OutboundChannel {
    sink: Arc<Mutex<Option<WsSink>>>,
}

impl OutboundChannel {
    fn new() -> Self {
        Self {
            sink: Arc::new(Mutex::new(None)),
        }
    }

    async fn send(&self, env: &Envelope) -> bool {
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => match sink.send(Message::Text(env.encode().into())).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(kind = env.kind(), "Send failed: {e}");
                    false
                }
            },
            None => {
                tracing::debug!(kind = env.kind(), "Not connected — frame dropped");
                false
            }
        }
    }

    async fn install(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    /// Best-effort close, then drop the sink.
    async fn teardown(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }
}

/// Outbound signaling handle for the media layer: answers and trickled ICE
/// flow device → hub through this.
#[derive(Clone)]
pub struct SignalSender {
    outbound: OutboundChannel,
}

impl SignalSender {
    pub async fn send_answer(&self, session_id: &str, sdp: Sdp) {
        let env = Envelope::new(MessageBody::SignalAnswer(SessionSdp {
            session_id: session_id.to_string(),
            sdp,
        }));
        self.outbound.send(&env).await;
    }

    pub async fn send_ice(&self, session_id: &str, candidate: IceCandidate) {
        let env = Envelope::new(MessageBody::SignalIce(SessionIce {
            session_id: session_id.to_string(),
            candidate,
        }));
        self.outbound.send(&env).await;
    }
}

pub struct Agent {
    config: AgentConfig,
    http: reqwest::Client,
    outbound: OutboundChannel,
    state_tx: watch::Sender<ConnState>,
    healthy: Arc<AtomicBool>,
    events: mpsc::Sender<SessionEvent>,
}

impl Agent {
    /// Build an agent plus the media layer's end of the seam: the event
    /// stream and the outbound signaling handle.
    pub fn new(config: AgentConfig) -> (Self, mpsc::Receiver<SessionEvent>, SignalSender) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (state_tx, _) = watch::channel(ConnState::Disconnected);
        let outbound = OutboundChannel::new();
        let signals = SignalSender {
            outbound: outbound.clone(),
        };
        let agent = Self {
            config,
            http: reqwest::Client::new(),
            outbound,
            state_tx,
            healthy: Arc::new(AtomicBool::new(false)),
            events: events_tx,
        };
        (agent, events_rx, signals)
    }

    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    /// Connect-and-reconnect loop. Returns when `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attempts: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state_tx.send_replace(if attempts == 0 {
                ConnState::Connecting
            } else {
                ConnState::Reconnecting
            });

            match self.run_once(&mut attempts, &mut shutdown).await {
                Ok(()) => tracing::info!("Disconnected from hub"),
                Err(e) => tracing::warn!("Connection error: {e}"),
            }
            self.state_tx.send_replace(ConnState::Disconnected);

            if *shutdown.borrow() {
                break;
            }
            attempts += 1;
            let delay = backoff_delay(attempts);
            tracing::info!(attempt = attempts, "Reconnecting in {delay:.2?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.state_tx.send_replace(ConnState::Stopping);
        self.outbound.teardown().await;
    }

    /// One dial-to-disconnect cycle.
    async fn run_once(
        &self,
        attempts: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!(url = %self.config.hub_url, "Connecting to hub");
        let (ws, _) = connect_async(self.config.hub_url.as_str()).await?;
        let (sink, mut stream) = ws.split();
        self.outbound.install(sink).await;

        let hello = Envelope::new(MessageBody::Hello(Hello {
            device_id: Some(self.config.device_id.clone()),
            agent_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            go2rtc_http: Some(self.config.local_http.clone()),
            device_secret: self.config.device_secret.clone(),
            token: None,
        }));
        if !self.outbound.send(&hello).await {
            self.outbound.teardown().await;
            anyhow::bail!("failed to send hello");
        }

        // Per-connection background loops; all torn down with the socket.
        let mut tasks = JoinSet::new();
        tasks.spawn(heartbeat_loop(self.outbound.clone(), self.state()));
        tasks.spawn(capabilities_loop(
            self.outbound.clone(),
            self.http.clone(),
            self.config.local_http.clone(),
            self.state(),
            self.healthy.clone(),
        ));
        tasks.spawn(health_probe_loop(
            self.http.clone(),
            self.config.local_http.clone(),
            self.healthy.clone(),
        ));

        let result = loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(text.as_str(), attempts, &mut tasks).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Hub closed the connection");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                },
                _ = shutdown.changed() => break Ok(()),
            }
        };

        tasks.abort_all();
        self.outbound.teardown().await;
        result
    }

    async fn handle_frame(&self, text: &str, attempts: &mut u32, tasks: &mut JoinSet<()>) {
        let env = match Envelope::decode(text) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Undecodable frame from hub: {e}");
                return;
            }
        };

        match env.body {
            MessageBody::HelloAck(_) => {
                tracing::info!(device = %self.config.device_id, "Hub acknowledged connection");
                self.state_tx.send_replace(ConnState::Connected);
                *attempts = 0;
            }

            MessageBody::HeartbeatAck(_) => {
                tracing::debug!("Heartbeat acknowledged");
            }

            MessageBody::WatchRequest(WatchRequest::Assign {
                session_id,
                user_id,
                ice_servers,
            }) => {
                tracing::info!(session = %session_id, user = %user_id, "Watch request received");
                self.emit(SessionEvent::WatchRequested {
                    session_id,
                    user_id,
                    ice_servers,
                });
            }

            MessageBody::SignalOffer(signal) => {
                tracing::info!(session = %signal.session_id, "SDP offer received");
                self.emit(SessionEvent::OfferReceived {
                    session_id: signal.session_id,
                    sdp: signal.sdp,
                });
            }

            MessageBody::SignalIce(signal) => {
                tracing::debug!(session = %signal.session_id, "ICE candidate received");
                self.emit(SessionEvent::IceReceived {
                    session_id: signal.session_id,
                    candidate: signal.candidate,
                });
            }

            MessageBody::WatchEnded(ended) => {
                tracing::info!(session = %ended.session_id, reason = %ended.reason, "Watch session ended");
                self.emit(SessionEvent::WatchEnded {
                    session_id: ended.session_id,
                    reason: ended.reason,
                });
            }

            MessageBody::ProxyHttp(request) => {
                tracing::debug!(rid = %request.rid, path = %request.path, "Tunneled request received");
                let http = self.http.clone();
                let base = self.config.local_http.clone();
                let outbound = self.outbound.clone();
                tasks.spawn(async move {
                    let response = local::service_proxy_request(&http, &base, request).await;
                    let env = Envelope::new(MessageBody::ProxyHttpResp(response));
                    outbound.send(&env).await;
                });
            }

            MessageBody::Error(err) => {
                tracing::warn!("Hub error: {}", err.message);
            }

            other => {
                tracing::debug!(kind = other.kind(), "Unhandled message from hub");
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            tracing::debug!("Media layer not draining events — event dropped");
        }
    }
}

async fn heartbeat_loop(outbound: OutboundChannel, state: watch::Receiver<ConnState>) {
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tick.tick().await;
        if *state.borrow() != ConnState::Connected {
            continue;
        }
        let env = Envelope::new(MessageBody::Heartbeat(Empty {}));
        outbound.send(&env).await;
        tracing::debug!("Heartbeat sent");
    }
}

async fn capabilities_loop(
    outbound: OutboundChannel,
    http: reqwest::Client,
    local_http: String,
    state: watch::Receiver<ConnState>,
    healthy: Arc<AtomicBool>,
) {
    let mut tick = tokio::time::interval(CAPABILITIES_INTERVAL);
    loop {
        tick.tick().await;
        if *state.borrow() != ConnState::Connected || !healthy.load(Ordering::Relaxed) {
            continue;
        }
        if let Some(streams) = local::fetch_streams(&http, &local_http).await {
            let env = Envelope::new(MessageBody::Capabilities(Capabilities { streams }));
            outbound.send(&env).await;
            tracing::debug!("Capabilities reported");
        }
    }
}

async fn health_probe_loop(http: reqwest::Client, local_http: String, healthy: Arc<AtomicBool>) {
    let mut tick = tokio::time::interval(HEALTH_PROBE_INTERVAL);
    loop {
        tick.tick().await;
        let up = local::probe_health(&http, &local_http).await;
        if up != healthy.swap(up, Ordering::Relaxed) {
            tracing::info!(healthy = up, "Local service health changed");
        }
    }
}

/// Reconnect delay: `min(1·2^(n−1), cap)` seconds plus up to one second of
/// jitter. The attempt counter resets on a successful `hello_ack`.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    let base = (1u64 << exponent).min(BACKOFF_CAP_SECS);
    Duration::from_secs_f64(base as f64 + rand::random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        for (attempt, base) in [(1u32, 1u64), (2, 2), (3, 4), (4, 8), (5, 16), (6, 30), (12, 30)] {
            let delay = backoff_delay(attempt).as_secs_f64();
            assert!(
                delay >= base as f64 && delay < base as f64 + 1.0,
                "attempt {attempt}: delay {delay} outside [{base}, {base}+1)"
            );
        }
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let delay = backoff_delay(u32::MAX).as_secs_f64();
        assert!(delay < BACKOFF_CAP_SECS as f64 + 1.0);
    }
}

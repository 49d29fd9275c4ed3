//! Signaling router — per-message dispatch, the session state machine, and
//! the disconnect fanout.
//!
//! Every handler here is an error boundary: failures are logged and the
//! offending action dropped, never propagated into the read loop. Forwards
//! between endpoints are non-blocking registry sends, so one stalled peer
//! cannot stall the router. Liveness decisions ("is the device online")
//! always come from the registry, never from the presence store.

use chrono::Utc;
use perch_common::models::session::{EndReason, SessionStatus};
use perch_common::proto::{
    Capabilities, Empty, EndWatch, Envelope, ErrorPayload, HelloAck, MessageBody, WatchEnded,
    WatchReady, WatchRequest,
};
use perch_common::turn::{self, TurnAudience};
use perch_db::repository::{devices, sessions};
use std::sync::Arc;

use crate::HubState;

/// How long a tunneled HTTP response stays claimable in the presence store.
pub const PROXY_RESPONSE_TTL_SECS: u64 = 30;

/// Presence key for a tunneled HTTP response envelope.
pub fn proxy_response_key(rid: &str) -> String {
    format!("proxy:response:{rid}")
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

// === Device messages ===

pub async fn handle_device_message(state: &Arc<HubState>, device_id: &str, env: Envelope) {
    let Envelope {
        request_id, body, ..
    } = env;

    match body {
        MessageBody::Hello(_) => {
            // Re-sent hello after attach: acknowledge again.
            state.registry.send_to_device(
                device_id,
                Envelope::reply(
                    MessageBody::HelloAck(HelloAck {
                        device_id: Some(device_id.to_string()),
                        user_id: None,
                        server_time: Utc::now(),
                    }),
                    request_id,
                ),
            );
        }

        MessageBody::Heartbeat(_) => {
            state.registry.touch_device(device_id);
            state
                .presence
                .hset_json(
                    "devices:online",
                    device_id,
                    &serde_json::json!({ "last_heartbeat": Utc::now() }),
                )
                .await;
            state.registry.send_to_device(
                device_id,
                Envelope::reply(MessageBody::HeartbeatAck(Empty {}), request_id),
            );
        }

        MessageBody::Capabilities(Capabilities { streams }) => {
            state
                .presence
                .set_json(
                    &format!("device:capabilities:{device_id}"),
                    &serde_json::json!({ "streams": streams, "last_updated": Utc::now() }),
                    None,
                )
                .await;
        }

        MessageBody::SignalAnswer(signal) => {
            let session_id = signal.session_id.clone();
            forward_to_session_viewer(state, device_id, &session_id, MessageBody::SignalAnswer(signal))
                .await;
        }

        MessageBody::SignalIce(signal) => {
            let session_id = signal.session_id.clone();
            forward_to_session_viewer(state, device_id, &session_id, MessageBody::SignalIce(signal))
                .await;
        }

        MessageBody::ProxyHttpResp(resp) => {
            if resp.rid.is_empty() {
                tracing::warn!(device = %device_id, "proxy_http_resp without rid — dropped");
                return;
            }
            match serde_json::to_value(&resp) {
                Ok(value) => {
                    state
                        .presence
                        .set_json(
                            &proxy_response_key(&resp.rid),
                            &value,
                            Some(PROXY_RESPONSE_TTL_SECS),
                        )
                        .await;
                    tracing::debug!(device = %device_id, rid = %resp.rid, status = resp.status, "Proxy response stored");
                }
                Err(e) => {
                    tracing::warn!(device = %device_id, rid = %resp.rid, "Failed to encode proxy response: {e}");
                }
            }
        }

        other => {
            tracing::warn!(device = %device_id, kind = other.kind(), "Unexpected message from device — dropped");
        }
    }
}

/// Forward a device-originated signal to the session's viewer. Unknown,
/// ended, or mismatched sessions are a silent drop with a warning.
async fn forward_to_session_viewer(
    state: &Arc<HubState>,
    device_id: &str,
    session_id: &str,
    body: MessageBody,
) {
    let route = match sessions::find_route(&state.db.pool, session_id).await {
        Ok(Some(route)) => route,
        Ok(None) => {
            tracing::warn!(device = %device_id, session = %session_id, "Signal for unknown session — dropped");
            return;
        }
        Err(e) => {
            tracing::warn!(session = %session_id, "Session lookup failed: {e}");
            return;
        }
    };

    if route.status == SessionStatus::Ended {
        tracing::warn!(device = %device_id, session = %session_id, "Signal for ended session — dropped");
        return;
    }
    if route.device_ref != device_id {
        tracing::warn!(device = %device_id, session = %session_id, "Signal from device that does not own the session — dropped");
        return;
    }

    state.registry.send_to_viewer(route.user_id, Envelope::new(body));
}

// === Viewer messages ===

pub async fn handle_viewer_message(state: &Arc<HubState>, user_id: i64, env: Envelope) {
    let Envelope {
        request_id, body, ..
    } = env;

    match body {
        MessageBody::Hello(_) => {
            state.registry.send_to_viewer(
                user_id,
                Envelope::reply(
                    MessageBody::HelloAck(HelloAck {
                        device_id: None,
                        user_id: Some(user_id),
                        server_time: Utc::now(),
                    }),
                    request_id,
                ),
            );
        }

        MessageBody::Heartbeat(_) => {
            state.registry.touch_viewer(user_id);
            state.registry.send_to_viewer(
                user_id,
                Envelope::reply(MessageBody::HeartbeatAck(Empty {}), request_id),
            );
        }

        MessageBody::WatchRequest(WatchRequest::Open { device_id }) => {
            open_watch(state, user_id, request_id, device_id).await;
        }

        MessageBody::SignalOffer(signal) => {
            let route = match lookup_viewer_session(state, user_id, &signal.session_id).await {
                Some(route) => route,
                None => return,
            };
            // First offer promotes the session; repeats are a no-op.
            if route.status == SessionStatus::Pending {
                if let Err(e) = sessions::activate(&state.db.pool, &signal.session_id).await {
                    tracing::warn!(session = %signal.session_id, "Failed to activate session: {e}");
                    return;
                }
            }
            state
                .registry
                .send_to_device(&route.device_ref, Envelope::new(MessageBody::SignalOffer(signal)));
        }

        MessageBody::SignalIce(signal) => {
            let route = match lookup_viewer_session(state, user_id, &signal.session_id).await {
                Some(route) => route,
                None => return,
            };
            state
                .registry
                .send_to_device(&route.device_ref, Envelope::new(MessageBody::SignalIce(signal)));
        }

        MessageBody::EndWatch(EndWatch { session_id }) => {
            end_watch(state, user_id, &session_id).await;
        }

        other => {
            tracing::warn!(user = %user_id, kind = other.kind(), "Unexpected message from viewer — dropped");
        }
    }
}

/// Open a new watch session: verify the device, create the `pending` row,
/// mint per-endpoint ICE servers, and notify both ends.
async fn open_watch(
    state: &Arc<HubState>,
    user_id: i64,
    request_id: Option<String>,
    device_id: String,
) {
    let device = match devices::find_by_device_id(&state.db.pool, &device_id).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            reply_error(state, user_id, request_id, "Device not found");
            return;
        }
        Err(e) => {
            tracing::warn!(device = %device_id, "Device lookup failed: {e}");
            reply_error(state, user_id, request_id, "Internal error");
            return;
        }
    };

    // Liveness comes from the registry, not from `devices.is_online`.
    if !state.registry.is_device_online(&device_id) {
        reply_error(state, user_id, request_id, "Device is offline");
        return;
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = sessions::insert(&state.db.pool, &session_id, user_id, device.id).await {
        tracing::warn!(device = %device_id, "Failed to create watch session: {e}");
        reply_error(state, user_id, request_id, "Internal error");
        return;
    }

    state
        .presence
        .set_json(
            &session_key(&session_id),
            &serde_json::json!({
                "user_id": user_id,
                "device_id": device_id,
                "started_at": Utc::now(),
            }),
            None,
        )
        .await;
    state.registry.track_viewer_session(user_id, &session_id);
    state.registry.track_device_session(&device_id, &session_id);

    let turn_cfg = &perch_common::config::get().turn;
    let viewer_ice = turn::ice_servers(
        turn_cfg,
        &format!("viewer_{user_id}_{session_id}"),
        TurnAudience::Public,
    );
    let device_ice = turn::ice_servers(
        turn_cfg,
        &format!("device_{device_id}_{session_id}"),
        TurnAudience::Internal,
    );

    state.registry.send_to_viewer(
        user_id,
        Envelope::reply(
            MessageBody::WatchReady(WatchReady {
                session_id: session_id.clone(),
                ice_servers: viewer_ice,
            }),
            request_id,
        ),
    );
    state.registry.send_to_device(
        &device_id,
        Envelope::new(MessageBody::WatchRequest(WatchRequest::Assign {
            session_id: session_id.clone(),
            user_id,
            ice_servers: device_ice,
        })),
    );

    tracing::info!(session = %session_id, user = %user_id, device = %device_id, "Watch session opened");
}

/// End a session on the viewer's request and notify the device.
async fn end_watch(state: &Arc<HubState>, user_id: i64, session_id: &str) {
    let route = match lookup_viewer_session(state, user_id, session_id).await {
        Some(route) => route,
        None => return,
    };

    match sessions::end(&state.db.pool, session_id, EndReason::UserEnded).await {
        Ok(Some(ended)) => {
            state.registry.send_to_device(
                &ended.device_ref,
                Envelope::new(MessageBody::WatchEnded(WatchEnded {
                    session_id: session_id.to_string(),
                    reason: EndReason::UserEnded,
                })),
            );
            cleanup_session(state, session_id, user_id, &route.device_ref).await;
            tracing::info!(session = %session_id, user = %user_id, "Watch session ended by viewer");
        }
        Ok(None) => {} // already ended elsewhere
        Err(e) => {
            tracing::warn!(session = %session_id, "Failed to end session: {e}");
        }
    }
}

/// Look up a session on behalf of a viewer message. Unknown, ended, or
/// foreign sessions drop the action with a warning.
async fn lookup_viewer_session(
    state: &Arc<HubState>,
    user_id: i64,
    session_id: &str,
) -> Option<sessions::SessionRoute> {
    let route = match sessions::find_route(&state.db.pool, session_id).await {
        Ok(Some(route)) => route,
        Ok(None) => {
            tracing::warn!(user = %user_id, session = %session_id, "Signal for unknown session — dropped");
            return None;
        }
        Err(e) => {
            tracing::warn!(session = %session_id, "Session lookup failed: {e}");
            return None;
        }
    };

    if route.status == SessionStatus::Ended {
        tracing::warn!(user = %user_id, session = %session_id, "Signal for ended session — dropped");
        return None;
    }
    if route.user_id != user_id {
        tracing::warn!(user = %user_id, session = %session_id, "Signal from viewer that does not own the session — dropped");
        return None;
    }
    Some(route)
}

fn reply_error(state: &HubState, user_id: i64, request_id: Option<String>, message: &str) {
    state.registry.send_to_viewer(
        user_id,
        Envelope::reply(
            MessageBody::Error(ErrorPayload {
                message: message.to_string(),
            }),
            request_id,
        ),
    );
}

async fn cleanup_session(state: &HubState, session_id: &str, user_id: i64, device_ref: &str) {
    state.presence.delete(&session_key(session_id)).await;
    state.registry.untrack_viewer_session(user_id, session_id);
    state.registry.untrack_device_session(device_ref, session_id);
}

// === Disconnect fanout ===

/// End every live session touching a disconnected device and notify each
/// session's viewer. The persistence store is the primary session index; if
/// it cannot be queried the registry-tracked session set and the presence
/// soft state fill in, so peers still learn the session is gone.
pub async fn end_sessions_for_device(state: &Arc<HubState>, device_id: &str, tracked: Vec<String>) {
    let candidates: Vec<(String, Option<i64>)> =
        match sessions::live_for_device(&state.db.pool, device_id).await {
            Ok(routes) => routes
                .into_iter()
                .map(|r| (r.session_id, Some(r.user_id)))
                .collect(),
            Err(e) => {
                tracing::warn!(device = %device_id, "Session query failed during disconnect — falling back to tracked sessions: {e}");
                tracked.into_iter().map(|sid| (sid, None)).collect()
            }
        };

    for (session_id, known_viewer) in candidates {
        let viewer =
            match sessions::end(&state.db.pool, &session_id, EndReason::DeviceDisconnected).await {
                Ok(Some(route)) => Some(route.user_id),
                Ok(None) => None, // already ended; no duplicate notification
                Err(e) => {
                    tracing::warn!(session = %session_id, "Failed to persist session end: {e}");
                    match known_viewer {
                        Some(user_id) => Some(user_id),
                        None => session_peer_from_presence(state, &session_id)
                            .await
                            .and_then(|(user_id, _)| user_id),
                    }
                }
            };

        if let Some(user_id) = viewer {
            state.registry.send_to_viewer(
                user_id,
                Envelope::new(MessageBody::WatchEnded(WatchEnded {
                    session_id: session_id.clone(),
                    reason: EndReason::DeviceDisconnected,
                })),
            );
            state.registry.untrack_viewer_session(user_id, &session_id);
            tracing::info!(session = %session_id, user = %user_id, "Session ended: device disconnected");
        }
        state.presence.delete(&session_key(&session_id)).await;
    }
}

/// Symmetric fanout for a disconnected viewer: notify each session's device.
pub async fn end_sessions_for_viewer(state: &Arc<HubState>, user_id: i64, tracked: Vec<String>) {
    let candidates: Vec<(String, Option<String>)> =
        match sessions::live_for_user(&state.db.pool, user_id).await {
            Ok(routes) => routes
                .into_iter()
                .map(|r| (r.session_id, Some(r.device_ref)))
                .collect(),
            Err(e) => {
                tracing::warn!(user = %user_id, "Session query failed during disconnect — falling back to tracked sessions: {e}");
                tracked.into_iter().map(|sid| (sid, None)).collect()
            }
        };

    for (session_id, known_device) in candidates {
        let device =
            match sessions::end(&state.db.pool, &session_id, EndReason::ViewerDisconnected).await {
                Ok(Some(route)) => Some(route.device_ref),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(session = %session_id, "Failed to persist session end: {e}");
                    match known_device {
                        Some(device_ref) => Some(device_ref),
                        None => session_peer_from_presence(state, &session_id)
                            .await
                            .and_then(|(_, device_ref)| device_ref),
                    }
                }
            };

        if let Some(device_ref) = device {
            state.registry.send_to_device(
                &device_ref,
                Envelope::new(MessageBody::WatchEnded(WatchEnded {
                    session_id: session_id.clone(),
                    reason: EndReason::ViewerDisconnected,
                })),
            );
            state.registry.untrack_device_session(&device_ref, &session_id);
            tracing::info!(session = %session_id, device = %device_ref, "Session ended: viewer disconnected");
        }
        state.presence.delete(&session_key(&session_id)).await;
    }
}

/// Counterpart identities from the `session:{id}` soft state.
async fn session_peer_from_presence(
    state: &HubState,
    session_id: &str,
) -> Option<(Option<i64>, Option<String>)> {
    let value = state.presence.get_json(&session_key(session_id)).await?;
    let user_id = value.get("user_id").and_then(|v| v.as_i64());
    let device_ref = value
        .get("device_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some((user_id, device_ref))
}

// === Timeout sweep ===

/// Backstop for sessions that outlived their participants (hub restart,
/// missed fanout): anything live past the heartbeat horizon whose device or
/// viewer has no channel is swept to `ended/timeout`.
pub async fn sweep_stale_sessions(state: &Arc<HubState>) {
    let horizon = state.tuning.heartbeat_timeout.as_secs_f64();
    let routes = match sessions::live_older_than(&state.db.pool, horizon).await {
        Ok(routes) => routes,
        Err(e) => {
            tracing::warn!("Session sweep query failed: {e}");
            return;
        }
    };

    for route in routes {
        let device_live = state.registry.is_device_online(&route.device_ref);
        let viewer_live = state.registry.is_viewer_online(route.user_id);
        if device_live && viewer_live {
            continue;
        }

        match sessions::end(&state.db.pool, &route.session_id, EndReason::Timeout).await {
            Ok(Some(ended)) => {
                let notice = MessageBody::WatchEnded(WatchEnded {
                    session_id: ended.session_id.clone(),
                    reason: EndReason::Timeout,
                });
                if viewer_live {
                    state
                        .registry
                        .send_to_viewer(ended.user_id, Envelope::new(notice.clone()));
                    state
                        .registry
                        .untrack_viewer_session(ended.user_id, &ended.session_id);
                }
                if device_live {
                    state
                        .registry
                        .send_to_device(&ended.device_ref, Envelope::new(notice));
                    state
                        .registry
                        .untrack_device_session(&ended.device_ref, &ended.session_id);
                }
                state.presence.delete(&session_key(&ended.session_id)).await;
                tracing::info!(session = %ended.session_id, "Session swept to ended: participant lost");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(session = %route.session_id, "Failed to sweep session: {e}");
            }
        }
    }
}

//! WebSocket endpoints — connection lifecycle for devices and viewers.
//!
//! Each accepted socket runs two tasks: this reader loop, and a writer pump
//! that drains the connection's bounded outbound queue with a per-frame
//! deadline. The reader never writes to the socket directly after attach;
//! everything outbound goes through the registry so sends never block the
//! router.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use perch_common::proto::{
    close, Envelope, Hello, HelloAck, MessageBody, ProtocolError, MAX_FRAME_BYTES,
};
use perch_db::repository::{devices, users};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::registry::{ConnHandle, Outbound};
use crate::{router, HubState};

/// WebSocket upgrade for device connections.
pub async fn device_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_device_socket(socket, state))
}

/// WebSocket upgrade for viewer connections.
pub async fn viewer_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_viewer_socket(socket, state))
}

async fn handle_device_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut sink, mut stream) = socket.split();

    let (hello, request_id) = match read_hello(&mut stream).await {
        Ok(pair) => pair,
        Err(reason) => {
            close_now(&mut sink, close::POLICY_VIOLATION, reason).await;
            return;
        }
    };
    let Some(device_id) = hello.device_id.clone() else {
        close_now(&mut sink, close::POLICY_VIOLATION, "missing device_id").await;
        return;
    };

    match devices::find_by_device_id(&state.db.pool, &device_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            close_now(&mut sink, close::POLICY_VIOLATION, "device not found").await;
            return;
        }
        Err(e) => {
            tracing::error!(device = %device_id, "Device lookup failed: {e}");
            close_now(&mut sink, close::INTERNAL_ERROR, "internal error").await;
            return;
        }
    }

    let (tx, rx) = mpsc::channel(state.tuning.send_queue_depth);
    let kill = Arc::new(Notify::new());
    tokio::spawn(write_pump(sink, rx, kill.clone(), state.tuning.write_timeout));

    let generation = state.registry.attach_device(
        &device_id,
        ConnHandle {
            tx: tx.clone(),
            kill: kill.clone(),
        },
    );
    tracing::info!(device = %device_id, "Device connected");

    // Durable + soft online state. The registry is already authoritative;
    // failures here degrade reporting, not routing.
    let now = Utc::now();
    if let Err(e) = devices::set_online(&state.db.pool, &device_id, true).await {
        tracing::warn!(device = %device_id, "Failed to mark device online: {e}");
    }
    state
        .presence
        .hset_json(
            "devices:online",
            &device_id,
            &serde_json::json!({ "connected_at": now, "last_heartbeat": now }),
        )
        .await;
    state
        .presence
        .set_json(
            &format!("device:presence:{device_id}"),
            &serde_json::json!({
                "agent_version": hello.agent_version,
                "go2rtc_http": hello.go2rtc_http,
                "connected_at": now,
            }),
            None,
        )
        .await;

    state.registry.send_to_device(
        &device_id,
        Envelope::reply(
            MessageBody::HelloAck(HelloAck {
                device_id: Some(device_id.clone()),
                user_id: None,
                server_time: Utc::now(),
            }),
            request_id,
        ),
    );

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match Envelope::decode(text.as_str()) {
                    Ok(env) => router::handle_device_message(&state, &device_id, env).await,
                    Err(ProtocolError::TooLarge(_)) => {
                        let _ = tx.try_send(Outbound::Close {
                            code: close::MESSAGE_TOO_LARGE,
                            reason: "message too large",
                        });
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(device = %device_id, "Protocol violation: {e}");
                        let _ = tx.try_send(Outbound::Close {
                            code: close::POLICY_VIOLATION,
                            reason: "malformed message",
                        });
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(device = %device_id, "Socket error: {e}");
                    break;
                }
            },
            _ = kill.notified() => break,
        }
    }

    drop(tx);
    if let Some(detached) = state.registry.detach_device(&device_id, generation) {
        if let Err(e) = devices::set_online(&state.db.pool, &device_id, false).await {
            tracing::warn!(device = %device_id, "Failed to mark device offline: {e}");
        }
        state.presence.hdel("devices:online", &device_id).await;
        state
            .presence
            .delete(&format!("device:presence:{device_id}"))
            .await;

        // End-of-session fanout must not block this detach.
        let state = state.clone();
        let id = device_id.clone();
        tokio::spawn(async move {
            router::end_sessions_for_device(&state, &id, detached.sessions).await;
        });
    }
    tracing::info!(device = %device_id, "Device disconnected");
}

async fn handle_viewer_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut sink, mut stream) = socket.split();

    let (hello, request_id) = match read_hello(&mut stream).await {
        Ok(pair) => pair,
        Err(reason) => {
            close_now(&mut sink, close::POLICY_VIOLATION, reason).await;
            return;
        }
    };
    let Some(token) = hello.token else {
        close_now(&mut sink, close::POLICY_VIOLATION, "missing token").await;
        return;
    };

    let config = perch_common::config::get();
    let user_id = match perch_common::auth::validate_token(&token, &config.auth.jwt_secret) {
        Ok(claims) => match claims.user_id() {
            Some(id) => id,
            None => {
                close_now(&mut sink, close::POLICY_VIOLATION, "invalid token").await;
                return;
            }
        },
        Err(_) => {
            close_now(&mut sink, close::POLICY_VIOLATION, "invalid token").await;
            return;
        }
    };

    match users::find_by_id(&state.db.pool, user_id).await {
        Ok(Some(user)) if user.is_active => {}
        Ok(_) => {
            close_now(&mut sink, close::POLICY_VIOLATION, "invalid token").await;
            return;
        }
        Err(e) => {
            tracing::error!(user = %user_id, "User lookup failed: {e}");
            close_now(&mut sink, close::INTERNAL_ERROR, "internal error").await;
            return;
        }
    }

    let (tx, rx) = mpsc::channel(state.tuning.send_queue_depth);
    let kill = Arc::new(Notify::new());
    tokio::spawn(write_pump(sink, rx, kill.clone(), state.tuning.write_timeout));

    let generation = state.registry.attach_viewer(
        user_id,
        ConnHandle {
            tx: tx.clone(),
            kill: kill.clone(),
        },
    );
    tracing::info!(user = %user_id, "Viewer connected");

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

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match Envelope::decode(text.as_str()) {
                    Ok(env) => router::handle_viewer_message(&state, user_id, env).await,
                    Err(ProtocolError::TooLarge(_)) => {
                        let _ = tx.try_send(Outbound::Close {
                            code: close::MESSAGE_TOO_LARGE,
                            reason: "message too large",
                        });
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(user = %user_id, "Protocol violation: {e}");
                        let _ = tx.try_send(Outbound::Close {
                            code: close::POLICY_VIOLATION,
                            reason: "malformed message",
                        });
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(user = %user_id, "Socket error: {e}");
                    break;
                }
            },
            _ = kill.notified() => break,
        }
    }

    drop(tx);
    if let Some(detached) = state.registry.detach_viewer(user_id, generation) {
        let state = state.clone();
        tokio::spawn(async move {
            router::end_sessions_for_viewer(&state, user_id, detached.sessions).await;
        });
    }
    tracing::info!(user = %user_id, "Viewer disconnected");
}

/// Read frames until the first `hello`. Ping/pong is tolerated; anything
/// else is a protocol violation.
async fn read_hello(
    stream: &mut SplitStream<WebSocket>,
) -> Result<(Hello, Option<String>), &'static str> {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let env =
                    Envelope::decode(text.as_str()).map_err(|_| "expected hello message")?;
                return match env.body {
                    MessageBody::Hello(hello) => Ok((hello, env.request_id)),
                    _ => Err("expected hello message"),
                };
            }
            Message::Close(_) => return Err("closed before hello"),
            _ => {}
        }
    }
    Err("closed before hello")
}

/// Drain a connection's outbound queue onto the socket. Every send carries
/// the write deadline; a peer that stalls past it is closed as a slow
/// consumer and the reader is told to stop.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    kill: Arc<Notify>,
    write_timeout: Duration,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Frame(env) => {
                let text = env.encode();
                if text.is_empty() {
                    continue;
                }
                match tokio::time::timeout(write_timeout, sink.send(Message::Text(text.into())))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!("Write failed: {e}");
                        kill.notify_one();
                        return;
                    }
                    Err(_) => {
                        tracing::warn!("Write deadline exceeded — closing slow consumer");
                        send_close(&mut sink, close::SLOW_CONSUMER, "slow consumer", write_timeout)
                            .await;
                        kill.notify_one();
                        return;
                    }
                }
            }
            Outbound::Close { code, reason } => {
                send_close(&mut sink, code, reason, write_timeout).await;
                kill.notify_one();
                return;
            }
        }
    }
}

async fn send_close(
    sink: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &'static str,
    deadline: Duration,
) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }));
    let _ = tokio::time::timeout(deadline, sink.send(frame)).await;
}

/// Close before a connection is attached (handshake failures).
async fn close_now(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }));
    let _ = sink.send(frame).await;
}

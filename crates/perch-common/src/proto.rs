//! Wire protocol for the hub's bidirectional channels.
//!
//! Every frame is a JSON object `{type, ts, request_id?, payload}`. The
//! `type` string selects a payload shape; decoders reject unknown types and
//! ill-shaped payloads instead of passing free-form maps around. SDP and ICE
//! payloads are opaque to the hub — they are carried, never interpreted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::session::EndReason;
use crate::turn::IceServer;

/// Upper bound on a single frame. Oversize frames close the connection.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// WebSocket close codes used by the hub and the agent.
pub mod close {
    /// Server shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol or authorization violation (bad hello, bad token, unknown device).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Frame exceeded [`super::MAX_FRAME_BYTES`].
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
    /// Unexpected server-side failure.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// A newer connection for the same identity replaced this one.
    pub const SUPERSEDED: u16 = 4000;
    /// Peer stalled past the write deadline.
    pub const SLOW_CONSUMER: u16 = 4002;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// A single protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender timestamp, ISO-8601 UTC.
    pub ts: DateTime<Utc>,

    /// Client correlation id, echoed verbatim on direct replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(flatten)]
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(body: MessageBody) -> Self {
        Self {
            ts: Utc::now(),
            request_id: None,
            body,
        }
    }

    /// Build a reply carrying the originating frame's `request_id`.
    pub fn reply(body: MessageBody, request_id: Option<String>) -> Self {
        Self {
            ts: Utc::now(),
            request_id,
            body,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::TooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Message type string, for logging.
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

/// Typed message bodies, tagged by the wire `type` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    Hello(Hello),
    HelloAck(HelloAck),
    Heartbeat(Empty),
    HeartbeatAck(Empty),
    Capabilities(Capabilities),
    WatchRequest(WatchRequest),
    WatchReady(WatchReady),
    SignalOffer(SessionSdp),
    SignalAnswer(SessionSdp),
    SignalIce(SessionIce),
    EndWatch(EndWatch),
    WatchEnded(WatchEnded),
    ProxyHttp(ProxyHttp),
    ProxyHttpResp(ProxyHttpResp),
    Error(ErrorPayload),
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Hello(_) => "hello",
            MessageBody::HelloAck(_) => "hello_ack",
            MessageBody::Heartbeat(_) => "heartbeat",
            MessageBody::HeartbeatAck(_) => "heartbeat_ack",
            MessageBody::Capabilities(_) => "capabilities",
            MessageBody::WatchRequest(_) => "watch_request",
            MessageBody::WatchReady(_) => "watch_ready",
            MessageBody::SignalOffer(_) => "signal_offer",
            MessageBody::SignalAnswer(_) => "signal_answer",
            MessageBody::SignalIce(_) => "signal_ice",
            MessageBody::EndWatch(_) => "end_watch",
            MessageBody::WatchEnded(_) => "watch_ended",
            MessageBody::ProxyHttp(_) => "proxy_http",
            MessageBody::ProxyHttpResp(_) => "proxy_http_resp",
            MessageBody::Error(_) => "error",
        }
    }
}

/// Payload for messages that carry none (`heartbeat`, `heartbeat_ack`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

/// First frame after accept. Devices identify with `device_id`; viewers
/// authenticate with `token`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,

    /// Base URL of the device-local media control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go2rtc_http: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,

    pub server_time: DateTime<Utc>,
}

/// Periodic stream inventory reported by the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub streams: serde_json::Value,
}

/// `watch_request` has two directions with distinct shapes: the viewer opens
/// a session naming a device; the hub assigns the session to the device with
/// the minted ICE servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatchRequest {
    Open {
        device_id: String,
    },
    Assign {
        session_id: String,
        user_id: i64,
        ice_servers: Vec<IceServer>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchReady {
    pub session_id: String,
    pub ice_servers: Vec<IceServer>,
}

/// SDP description, opaque to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sdp {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// `signal_offer` / `signal_answer` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSdp {
    pub session_id: String,
    pub sdp: Sdp,
}

/// Trickled ICE candidate, opaque to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIce {
    pub session_id: String,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndWatch {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEnded {
    pub session_id: String,
    pub reason: EndReason,
}

/// Tunneled HTTP request, hub → device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHttp {
    /// Opaque per-request correlation id.
    pub rid: String,
    pub method: String,
    /// Path plus query string, passed through as-is.
    pub path: String,
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
    pub timeout_ms: u64,
}

/// Tunneled HTTP response, device → hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHttpResp {
    pub rid: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::reply(
            MessageBody::HeartbeatAck(Empty {}),
            Some("req-7".to_string()),
        );
        let value: serde_json::Value = serde_json::from_str(&env.encode()).unwrap();
        assert_eq!(value["type"], "heartbeat_ack");
        assert_eq!(value["request_id"], "req-7");
        assert!(value["payload"].is_object());
        assert!(value["ts"].is_string());
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let text = r#"{"type":"frobnicate","ts":"2024-01-01T00:00:00Z","payload":{}}"#;
        assert!(Envelope::decode(text).is_err());
    }

    #[test]
    fn decode_rejects_ill_shaped_payload() {
        // signal_offer without an sdp object
        let text = r#"{"type":"signal_offer","ts":"2024-01-01T00:00:00Z","payload":{"session_id":"s1"}}"#;
        assert!(Envelope::decode(text).is_err());
    }

    #[test]
    fn decode_rejects_oversize_frame() {
        let padding = "x".repeat(MAX_FRAME_BYTES);
        let text = format!(
            r#"{{"type":"heartbeat","ts":"2024-01-01T00:00:00Z","payload":{{"pad":"{padding}"}}}}"#
        );
        assert!(matches!(
            Envelope::decode(&text),
            Err(ProtocolError::TooLarge(_))
        ));
    }

    #[test]
    fn watch_request_open_and_assign_shapes() {
        let open = r#"{"type":"watch_request","ts":"2024-01-01T00:00:00Z","payload":{"device_id":"cam-1"}}"#;
        let env = Envelope::decode(open).unwrap();
        match env.body {
            MessageBody::WatchRequest(WatchRequest::Open { device_id }) => {
                assert_eq!(device_id, "cam-1");
            }
            other => panic!("expected Open, got {other:?}"),
        }

        let assign = r#"{"type":"watch_request","ts":"2024-01-01T00:00:00Z","payload":{"session_id":"s1","user_id":42,"ice_servers":[]}}"#;
        let env = Envelope::decode(assign).unwrap();
        match env.body {
            MessageBody::WatchRequest(WatchRequest::Assign {
                session_id,
                user_id,
                ..
            }) => {
                assert_eq!(session_id, "s1");
                assert_eq!(user_id, 42);
            }
            other => panic!("expected Assign, got {other:?}"),
        }
    }

    #[test]
    fn ice_candidate_field_names_are_webrtc_spelled() {
        let env = Envelope::new(MessageBody::SignalIce(SessionIce {
            session_id: "s1".into(),
            candidate: IceCandidate {
                candidate: "candidate:0 1 UDP 1 10.0.0.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
        }));
        let value: serde_json::Value = serde_json::from_str(&env.encode()).unwrap();
        assert_eq!(value["payload"]["candidate"]["sdpMid"], "0");
        assert_eq!(value["payload"]["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn watch_ended_reason_is_snake_case() {
        let env = Envelope::new(MessageBody::WatchEnded(WatchEnded {
            session_id: "s1".into(),
            reason: EndReason::DeviceDisconnected,
        }));
        let value: serde_json::Value = serde_json::from_str(&env.encode()).unwrap();
        assert_eq!(value["payload"]["reason"], "device_disconnected");
    }
}

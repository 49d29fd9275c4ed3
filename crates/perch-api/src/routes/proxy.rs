//! Tunnel proxy frontend.
//!
//! Accepts any HTTP method on `/api/devices/{device_id}/proxy/{tail}`,
//! serializes the request into a `proxy_http` envelope, ships it over the
//! device's signaling channel, and polls the presence store for the matching
//! `proxy_http_resp`. The presence store plus a single `rid` is the whole
//! correlator, so hubs sharing the store can answer each other's requests.

use axum::{
    body::{Body, Bytes},
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
    routing::any,
    Router,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use perch_common::{
    error::{PerchError, PerchResult},
    proto::{Envelope, MessageBody, ProxyHttp, ProxyHttpResp},
};
use perch_hub::registry::SendOutcome;
use perch_hub::router::proxy_response_key;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::AppState;

/// Headers that must not be copied verbatim across the tunnel.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/devices/{device_id}/proxy/{*tail}", any(proxy_to_device))
}

/// {GET,POST,PUT,DELETE,...} /api/devices/{device_id}/proxy/{tail}
async fn proxy_to_device(
    State(state): State<Arc<AppState>>,
    Path((device_id, tail)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> PerchResult<Response> {
    if !state.registry.is_device_online(&device_id) {
        return Err(PerchError::DeviceOffline);
    }

    let rid = uuid::Uuid::new_v4().to_string();
    let config = perch_common::config::get();

    let mut path = format!("/{tail}");
    if let Some(query) = query {
        path = format!("{path}?{query}");
    }

    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let envelope = Envelope::new(MessageBody::ProxyHttp(ProxyHttp {
        rid: rid.clone(),
        method: method.to_string(),
        path: path.clone(),
        headers: header_map,
        body_b64: (!body.is_empty()).then(|| B64.encode(&body)),
        timeout_ms: config.proxy.deadline_secs * 1000,
    }));

    tracing::debug!(device = %device_id, rid = %rid, path = %path, "Tunneling HTTP request to device");

    match state.registry.send_to_device(&device_id, envelope) {
        SendOutcome::Sent => {}
        SendOutcome::NotConnected | SendOutcome::Dropped => {
            return Err(PerchError::DeviceOffline);
        }
    }

    // Poll the store until the device's response lands or the deadline hits.
    let key = proxy_response_key(&rid);
    let poll = Duration::from_millis(config.proxy.poll_interval_ms.max(1));
    let attempts = (config.proxy.deadline_secs * 1000 / config.proxy.poll_interval_ms.max(1)).max(1);

    for _ in 0..attempts {
        if let Some(value) = state.presence.get_json(&key).await {
            state.presence.delete(&key).await;
            let resp: ProxyHttpResp = serde_json::from_value(value)
                .map_err(|e| PerchError::Internal(anyhow::anyhow!("bad proxy response: {e}")))?;
            tracing::debug!(device = %device_id, rid = %rid, status = resp.status, "Proxy response received");
            return build_response(resp);
        }
        tokio::time::sleep(poll).await;
    }

    tracing::warn!(device = %device_id, rid = %rid, "Proxy deadline expired");
    Err(PerchError::ProxyTimeout)
}

/// Reconstruct the upstream response: exact status, headers, decoded body.
fn build_response(resp: ProxyHttpResp) -> PerchResult<Response> {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    for (name, value) in &resp.headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }

    let body = B64.decode(&resp.body_b64).unwrap_or_default();
    builder
        .body(Body::from(body))
        .map_err(|e| PerchError::Internal(anyhow::anyhow!(e)))
}

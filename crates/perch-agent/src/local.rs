//! Local HTTP service client — the device-side end of the tunnel.
//!
//! Tunneled requests are replayed against the media control plane running
//! next to the agent; its responses travel back verbatim (status, headers,
//! base64 body). Failures become synthesized 5xx responses so the viewer
//! always gets an answer within the deadline.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use perch_common::proto::{ProxyHttp, ProxyHttpResp};
use std::collections::HashMap;
use std::time::Duration;

/// How long the capabilities fetch may take.
pub const STREAMS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Request headers owned by the local HTTP stack, not the tunnel.
const SKIP_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "accept-encoding",
];

/// Replay a tunneled request against the local service and package the
/// outcome. Local timeout yields 504, any other failure 500 with the error
/// text as the body.
pub async fn service_proxy_request(
    http: &reqwest::Client,
    base_url: &str,
    request: ProxyHttp,
) -> ProxyHttpResp {
    let url = format!("{}{}", base_url.trim_end_matches('/'), request.path);
    let method =
        reqwest::Method::from_bytes(request.method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let timeout = Duration::from_millis(request.timeout_ms.max(1));

    let mut builder = http.request(method, &url).timeout(timeout);
    for (name, value) in &request.headers {
        if SKIP_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(body_b64) = &request.body_b64 {
        match B64.decode(body_b64) {
            Ok(body) => builder = builder.body(body),
            Err(e) => {
                return error_response(&request.rid, 400, format!("bad request body: {e}"));
            }
        }
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            match response.bytes().await {
                Ok(bytes) => ProxyHttpResp {
                    rid: request.rid,
                    status,
                    headers,
                    body_b64: B64.encode(&bytes),
                },
                Err(e) => error_response(&request.rid, 500, e.to_string()),
            }
        }
        Err(e) if e.is_timeout() => {
            error_response(&request.rid, 504, "local service timeout".to_string())
        }
        Err(e) => error_response(&request.rid, 500, e.to_string()),
    }
}

fn error_response(rid: &str, status: u16, message: String) -> ProxyHttpResp {
    ProxyHttpResp {
        rid: rid.to_string(),
        status,
        headers: HashMap::new(),
        body_b64: B64.encode(message.as_bytes()),
    }
}

/// Fetch the stream inventory for the capabilities report. `None` when the
/// service is down, slow, or answering with anything but 200.
pub async fn fetch_streams(http: &reqwest::Client, base_url: &str) -> Option<serde_json::Value> {
    let url = format!("{}/api/streams", base_url.trim_end_matches('/'));
    let response = http
        .get(&url)
        .timeout(STREAMS_FETCH_TIMEOUT)
        .send()
        .await
        .ok()?;
    if response.status() != reqwest::StatusCode::OK {
        return None;
    }
    response.json().await.ok()
}

/// One health probe against the local service.
pub async fn probe_health(http: &reqwest::Client, base_url: &str) -> bool {
    http.get(base_url)
        .timeout(STREAMS_FETCH_TIMEOUT)
        .send()
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_message_in_body() {
        let resp = error_response("r1", 504, "local service timeout".to_string());
        assert_eq!(resp.rid, "r1");
        assert_eq!(resp.status, 504);
        assert_eq!(
            B64.decode(&resp.body_b64).unwrap(),
            b"local service timeout"
        );
    }
}

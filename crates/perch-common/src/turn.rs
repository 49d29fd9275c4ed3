//! TURN REST credential minting (draft-uberti-behave-turn-rest).
//!
//! Credentials are derived, not stored: `username` is `{unix_expiry}:{principal}`
//! and `credential` is `base64(HMAC-SHA1(secret, username))`. The relay
//! recomputes the same MAC to validate, so the hub and relay only share the
//! secret. Two host variants exist: the internal hostname for devices on the
//! backend network, and the public hostname handed to browsers.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::config::TurnConfig;

type HmacSha1 = Hmac<Sha1>;

/// Public STUN servers prepended to every ICE set.
pub const STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// ICE server entry handed to WebRTC endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(
        rename = "credentialType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub credential_type: Option<String>,
}

/// Which hostname the client should dial the relay on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAudience {
    /// Devices on the backend network.
    Internal,
    /// Browsers on the public internet.
    Public,
}

/// Mint a time-limited TURN entry for `principal`, expiring `ttl_secs` from now.
pub fn turn_credentials(cfg: &TurnConfig, principal: &str, audience: TurnAudience) -> IceServer {
    turn_credentials_at(cfg, principal, audience, chrono::Utc::now().timestamp())
}

/// Deterministic core of [`turn_credentials`]: everything but the clock.
pub fn turn_credentials_at(
    cfg: &TurnConfig,
    principal: &str,
    audience: TurnAudience,
    now_unix: i64,
) -> IceServer {
    let username = format!("{}:{}", now_unix + cfg.ttl_secs, principal);

    let mut mac =
        HmacSha1::new_from_slice(cfg.secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(username.as_bytes());
    let credential = B64.encode(mac.finalize().into_bytes());

    let host = match audience {
        TurnAudience::Internal => &cfg.host,
        TurnAudience::Public => &cfg.public_host,
    };

    IceServer {
        urls: vec![
            format!("turn:{host}:{}?transport=udp", cfg.port),
            format!("turn:{host}:{}?transport=tcp", cfg.port),
        ],
        username: Some(username),
        credential: Some(credential),
        credential_type: Some("password".to_string()),
    }
}

/// Full ICE configuration: STUN constants plus a freshly minted TURN entry.
pub fn ice_servers(cfg: &TurnConfig, principal: &str, audience: TurnAudience) -> Vec<IceServer> {
    let mut servers: Vec<IceServer> = STUN_SERVERS
        .iter()
        .map(|url| IceServer {
            urls: vec![(*url).to_string()],
            username: None,
            credential: None,
            credential_type: None,
        })
        .collect();
    servers.push(turn_credentials(cfg, principal, audience));
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TurnConfig {
        TurnConfig {
            host: "coturn".into(),
            public_host: "turn.example.org".into(),
            port: 3478,
            secret: "north-of-the-wall".into(),
            ttl_secs: 86_400,
        }
    }

    #[test]
    fn username_embeds_expiry_and_principal() {
        let cfg = test_config();
        let entry = turn_credentials_at(&cfg, "viewer_7_s1", TurnAudience::Public, 1_700_000_000);
        assert_eq!(entry.username.as_deref(), Some("1700086400:viewer_7_s1"));
        assert_eq!(entry.credential_type.as_deref(), Some("password"));
        assert_eq!(
            entry.urls,
            vec![
                "turn:turn.example.org:3478?transport=udp",
                "turn:turn.example.org:3478?transport=tcp",
            ]
        );
    }

    #[test]
    fn credential_is_hmac_sha1_of_username() {
        let cfg = test_config();
        let entry = turn_credentials_at(&cfg, "device_cam-1_s1", TurnAudience::Internal, 1_700_000_000);

        let mut mac = HmacSha1::new_from_slice(cfg.secret.as_bytes()).unwrap();
        mac.update(entry.username.as_deref().unwrap().as_bytes());
        let expected = B64.encode(mac.finalize().into_bytes());

        assert_eq!(entry.credential.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn minting_is_deterministic_for_fixed_clock() {
        let cfg = test_config();
        let a = turn_credentials_at(&cfg, "p", TurnAudience::Internal, 42);
        let b = turn_credentials_at(&cfg, "p", TurnAudience::Internal, 42);
        assert_eq!(a.username, b.username);
        assert_eq!(a.credential, b.credential);
    }

    #[test]
    fn internal_and_public_hosts_differ() {
        let cfg = test_config();
        let device = turn_credentials_at(&cfg, "p", TurnAudience::Internal, 0);
        let browser = turn_credentials_at(&cfg, "p", TurnAudience::Public, 0);
        assert!(device.urls[0].contains("coturn"));
        assert!(browser.urls[0].contains("turn.example.org"));
    }

    #[test]
    fn ice_set_is_stun_constants_plus_turn() {
        let cfg = test_config();
        let servers = ice_servers(&cfg, "p", TurnAudience::Public);
        assert_eq!(servers.len(), 3);
        assert!(servers[0].urls[0].starts_with("stun:"));
        assert!(servers[1].urls[0].starts_with("stun:"));
        assert!(servers[2].username.is_some());
    }
}

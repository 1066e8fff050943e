//! Pairing-code encoding and session configuration.
//!
//! A pairing code is base64 of a JSON object carrying the overlay network
//! identity plus the rendezvous peer pool. Optional expiry fields are
//! validated on decode but never re-encoded, so legacy codes round-trip.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::peer_pool;

/// Decoded pairing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub network_name: String,
    pub network_secret: String,
    pub peers: Vec<String>,
}

impl SessionConfig {
    /// Encode to a pairing code.
    pub fn encode(&self) -> CoreResult<String> {
        let raw = serde_json::to_vec(self)?;
        Ok(BASE64.encode(raw))
    }
}

/// Decode a pairing code without expiry validation.
pub fn decode_config(encoded: &str) -> CoreResult<SessionConfig> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|e| CoreError::InvalidConfig(format!("invalid config string: {e}")))?;
    let cfg: SessionConfig = serde_json::from_slice(&raw)
        .map_err(|e| CoreError::InvalidConfig(format!("invalid config format: {e}")))?;
    if cfg.network_name.is_empty() || cfg.network_secret.is_empty() || cfg.peers.is_empty() {
        return Err(CoreError::InvalidConfig(
            "config missing required fields: network_name, network_secret, peers".into(),
        ));
    }
    Ok(cfg)
}

/// Decode a pairing code, rejecting expired ones.
///
/// Recognized expiry keys: `expires_at`, `expire_at`, `exp`; values may be
/// unix seconds (integer or numeric string) or an RFC3339 timestamp.
pub fn decode_config_with_validation(encoded: &str) -> CoreResult<SessionConfig> {
    let code = encoded.trim();
    if code.is_empty() {
        return Err(CoreError::InvalidConfig("config code is required".into()));
    }

    let raw = BASE64
        .decode(code)
        .map_err(|e| CoreError::InvalidConfig(format!("invalid config string: {e}")))?;
    let envelope: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| CoreError::InvalidConfig(format!("invalid config format: {e}")))?;
    validate_expiry(&envelope)?;

    decode_config(code)
}

fn validate_expiry(envelope: &serde_json::Value) -> CoreResult<()> {
    let Some(map) = envelope.as_object() else {
        return Ok(());
    };
    for key in ["expires_at", "expire_at", "exp"] {
        let Some(value) = map.get(key) else { continue };
        let Some(expiry) = parse_expiry_value(value) else {
            return Err(CoreError::InvalidConfig(format!("invalid {key} in config")));
        };
        if Utc::now() > expiry {
            return Err(CoreError::coded(
                ErrorCode::ConfigExpired,
                "config code has expired",
            ));
        }
    }
    Ok(())
}

fn parse_expiry_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => {
            let unix = n.as_i64()?;
            Utc.timestamp_opt(unix, 0).single()
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(unix) = s.parse::<i64>() {
                return Utc.timestamp_opt(unix, 0).single();
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        }
        _ => None,
    }
}

/// Build a config from explicit inputs, validating each.
pub fn build_config_from_inputs(
    network_name: &str,
    network_secret: &str,
    peers: &str,
) -> CoreResult<SessionConfig> {
    let name = network_name.trim();
    let secret = network_secret.trim();
    let peer_list = peer_pool::parse_peers(peers);

    if name.is_empty() {
        return Err(CoreError::InvalidConfig("network name is required".into()));
    }
    if secret.is_empty() {
        return Err(CoreError::InvalidConfig("network secret is required".into()));
    }
    if peer_list.is_empty() {
        return Err(CoreError::InvalidConfig("at least one peer is required".into()));
    }

    Ok(SessionConfig {
        network_name: name.to_string(),
        network_secret: secret.to_string(),
        peers: peer_list,
    })
}

/// Build an encoded pairing code from inputs, generating defaults for any
/// blank field: the network identity derives from the local hostname and
/// the peer pool merges in the default rendezvous servers.
pub fn build_encoded_config_with_defaults(
    network_name: &str,
    network_secret: &str,
    peers: &str,
) -> CoreResult<(String, SessionConfig)> {
    let host = detect_host_identity();
    let name = if network_name.trim().is_empty() {
        format!("telehand:{host}")
    } else {
        network_name.trim().to_string()
    };
    let secret = if network_secret.trim().is_empty() {
        format!("telehand:{host}{}", random_four_digits())
    } else {
        network_secret.trim().to_string()
    };

    let user_pool = peer_pool::parse_peers(peers);
    let merged = peer_pool::merge_peer_pools(
        &user_pool,
        &peer_pool::default_peer_pool(),
        peer_pool::MAX_PEER_COUNT,
    );

    let cfg = build_config_from_inputs(&name, &secret, &peer_pool::peer_csv(&merged))?;
    let encoded = cfg.encode()?;
    Ok((encoded, cfg))
}

fn detect_host_identity() -> String {
    match hostname::get() {
        Ok(host) => {
            let token = sanitize_host_token(&host.to_string_lossy());
            if token.is_empty() {
                format!("host-{}", random_four_digits())
            } else {
                token
            }
        }
        Err(_) => format!("host-{}", random_four_digits()),
    }
}

fn sanitize_host_token(host: &str) -> String {
    let cleaned: String = host
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches('-').to_string()
}

fn random_four_digits() -> String {
    format!("{:04}", rand::thread_rng().gen_range(0..10000))
}

/// Derive the display owner from a `prefix:owner` network name.
pub fn network_owner_from_name(network_name: &str) -> String {
    let name = network_name.trim();
    if name.is_empty() {
        return String::new();
    }
    match name.rsplit(':').next() {
        Some(owner) if !owner.trim().is_empty() => owner.trim().to_string(),
        _ => name.to_string(),
    }
}

/// Mask a secret for display: first/last two characters kept.
pub fn mask_secret(secret: &str) -> String {
    let s = secret.trim();
    if s.is_empty() {
        return String::new();
    }
    if s.len() <= 4 {
        return "*".repeat(s.len());
    }
    format!("{}{}{}", &s[..2], "*".repeat(s.len() - 4), &s[s.len() - 2..])
}

/// Replace every occurrence of each secret in a log line with its mask.
pub fn sanitize_sensitive_log(line: &str, secrets: &[&str]) -> String {
    let mut out = line.to_string();
    for secret in secrets {
        if secret.trim().is_empty() {
            continue;
        }
        out = out.replace(secret, &mask_secret(secret));
    }
    out
}

//! Rendezvous peer pool: normalization, dedup, and merging.
//!
//! Peers are canonicalized to `scheme://host:port` with scheme restricted
//! to tcp/udp. Everything downstream (ranking, supervisor config, logs)
//! only ever sees canonical form, so duplicates are impossible past this
//! module.

/// Hard cap on the merged peer pool.
pub const MAX_PEER_COUNT: usize = 32;

/// Cap applied to the built-in fallback pool.
pub const DEFAULT_PEER_COUNT: usize = 8;

/// Built-in rendezvous servers used when the pairing code brings none.
pub const DEFAULT_PEERS: &[&str] = &[
    "tcp://43.139.65.49:11010",
    "tcp://39.108.52.138:11010",
];

/// Parse a comma-separated peer list into a normalized pool.
pub fn parse_peers(peers: &str) -> Vec<String> {
    let raw: Vec<String> = peers.split(',').map(|s| s.trim().to_string()).collect();
    normalize_peer_pool(&raw, MAX_PEER_COUNT)
}

/// The built-in pool, normalized and capped.
pub fn default_peer_pool() -> Vec<String> {
    let raw: Vec<String> = DEFAULT_PEERS.iter().map(|s| s.to_string()).collect();
    normalize_peer_pool(&raw, DEFAULT_PEER_COUNT)
}

/// Merge two pools, caller's order first, then normalize/dedupe/cap.
pub fn merge_peer_pools(preferred: &[String], fallback: &[String], max_count: usize) -> Vec<String> {
    let mut combined = Vec::with_capacity(preferred.len() + fallback.len());
    combined.extend_from_slice(preferred);
    combined.extend_from_slice(fallback);
    normalize_peer_pool(&combined, max_count)
}

/// The pool a session actually connects with: config peers first, default
/// rendezvous servers appended.
pub fn runtime_peer_pool(config_peers: &[String]) -> Vec<String> {
    merge_peer_pools(config_peers, &default_peer_pool(), MAX_PEER_COUNT)
}

/// Join a pool back into CSV form.
pub fn peer_csv(peers: &[String]) -> String {
    peers.join(",")
}

fn normalize_peer_pool(raw: &[String], max_count: usize) -> Vec<String> {
    let limit = if max_count == 0 || max_count > MAX_PEER_COUNT {
        MAX_PEER_COUNT
    } else {
        max_count
    };

    let mut out = Vec::with_capacity(raw.len().min(limit));
    let mut seen = std::collections::HashSet::with_capacity(raw.len());
    for item in raw {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let Some(normalized) = normalize_peer_address(item) else {
            continue;
        };
        if !seen.insert(normalized.clone()) {
            continue;
        }
        out.push(normalized);
        if out.len() >= limit {
            break;
        }
    }
    out
}

/// Canonicalize one peer URI. Returns `None` for anything that is not a
/// well-formed `tcp://host:port` or `udp://host:port`.
pub fn normalize_peer_address(peer: &str) -> Option<String> {
    let value = peer.trim();
    let (scheme, rest) = value.split_once("://")?;
    let scheme = scheme.trim().to_ascii_lowercase();
    if scheme != "tcp" && scheme != "udp" {
        return None;
    }
    // Tolerate a bare trailing slash, reject any real path component.
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.contains('/') {
        return None;
    }

    let (host, port) = split_host_port(rest)?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }

    Some(format!("{scheme}://{}:{port}", join_host(host)))
}

/// Split `host:port`, handling `[v6]:port` bracket form.
fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    let idx = addr.rfind(':')?;
    let (host, port) = addr.split_at(idx);
    // A second colon in the host means an unbracketed IPv6 literal.
    if host.contains(':') {
        return None;
    }
    Some((host, &port[1..]))
}

fn join_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Mask a peer address for log output: `tcp://1.2.*.*:11010`.
pub fn mask_peer_address(peer: &str) -> String {
    let Some(normalized) = normalize_peer_address(peer) else {
        return "***".to_string();
    };
    let Some((scheme, rest)) = normalized.split_once("://") else {
        return "***".to_string();
    };
    let Some((host, port)) = split_host_port(rest) else {
        return "***".to_string();
    };
    format!("{scheme}://{}:{port}", mask_host_token(host))
}

/// Mask a host: IPv4 keeps the first two octets, names keep a short prefix.
pub fn mask_host_token(host: &str) -> String {
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        let octets = ip.octets();
        return format!("{}.{}.*.*", octets[0], octets[1]);
    }
    let value = host.trim();
    if value.is_empty() {
        return "***".to_string();
    }
    if value.len() <= 3 {
        return format!("{}{}", &value[..1], "*".repeat(value.len() - 1));
    }
    format!("{}{}", &value[..2], "*".repeat(value.len() - 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_dedupes_and_drops_invalid() {
        let got = parse_peers(
            " tcp://1.1.1.1:11010, udp://2.2.2.2:22020, tcp://1.1.1.1:11010, http://bad:80, bad , tcp://3.3.3.3:abc ",
        );
        assert_eq!(
            got,
            vec![
                "tcp://1.1.1.1:11010".to_string(),
                "udp://2.2.2.2:22020".to_string(),
            ]
        );
    }

    #[test]
    fn parse_is_idempotent_through_csv() {
        let first = parse_peers("tcp://1.1.1.1:11010,udp://2.2.2.2:22020");
        let second = parse_peers(&peer_csv(&first));
        assert_eq!(first, second);
    }

    #[test]
    fn merge_prefers_caller_order() {
        let preferred = vec![
            "tcp://10.0.0.1:11010".to_string(),
            "tcp://10.0.0.2:11010".to_string(),
        ];
        let fallback = vec![
            "tcp://10.0.0.2:11010".to_string(),
            "tcp://10.0.0.3:11010".to_string(),
        ];
        let got = merge_peer_pools(&preferred, &fallback, 3);
        assert_eq!(
            got,
            vec![
                "tcp://10.0.0.1:11010".to_string(),
                "tcp://10.0.0.2:11010".to_string(),
                "tcp://10.0.0.3:11010".to_string(),
            ]
        );
    }

    #[test]
    fn runtime_pool_keeps_user_priority_and_adds_defaults() {
        let got = runtime_peer_pool(&["tcp://8.8.8.8:11010".to_string()]);
        assert!(got.len() >= 3);
        assert_eq!(got[0], "tcp://8.8.8.8:11010");
    }

    #[test]
    fn rejects_invalid_scheme_port_and_path() {
        assert!(normalize_peer_address("http://1.1.1.1:80").is_none());
        assert!(normalize_peer_address("tcp://1.1.1.1:0").is_none());
        assert!(normalize_peer_address("tcp://1.1.1.1:70000").is_none());
        assert!(normalize_peer_address("tcp://1.1.1.1").is_none());
        assert!(normalize_peer_address("tcp://1.1.1.1:11010/path").is_none());
    }

    #[test]
    fn accepts_trailing_slash_and_lowercases_scheme() {
        assert_eq!(
            normalize_peer_address("TCP://host.example:11010/"),
            Some("tcp://host.example:11010".to_string())
        );
    }

    #[test]
    fn masks_ipv4_and_hostnames() {
        assert_eq!(mask_peer_address("tcp://1.2.3.4:11010"), "tcp://1.2.*.*:11010");
        assert_eq!(mask_host_token("example.com"), "ex*********");
        assert_eq!(mask_peer_address("garbage"), "***");
    }
}

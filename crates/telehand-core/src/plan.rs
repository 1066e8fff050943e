//! Virtual subnet planning.
//!
//! The network hash seeds a deterministic walk over `10.x.y.0/24` subnets
//! so both endpoints derive the same candidate list independently.
//! Candidates colliding with anything already routable on this host are
//! filtered out before the connect round starts.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::timing::SUBNET_CANDIDATE_COUNT;

/// Which end of the session this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The operator's machine; owns `.1` in each candidate subnet.
    Client,
    /// The assisted machine; owns `.2`.
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }

    /// Lenient parse; anything that is not `client` is the server side.
    pub fn parse(value: &str) -> Role {
        if value.trim().eq_ignore_ascii_case("client") {
            Role::Client
        } else {
            Role::Server
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One subnet candidate for the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Candidate {
    /// Local address in CIDR form, e.g. `10.12.34.1/24`.
    pub local_cidr: String,
    /// Local address without the prefix.
    pub local_ip: String,
    /// The /24 subnet, e.g. `10.12.34.0/24`.
    pub subnet_cidr: String,
    /// Address the remote end is expected to take.
    pub expected_peer_ip: String,
}

/// Facts pinned when the session enters running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBaseline {
    pub tun_device: String,
    pub virtual_cidr: String,
    pub network_hash: String,
}

/// Stable 10-character lowercase identifier for `(name, secret)`.
pub fn compute_network_hash(network_name: &str, network_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(network_name.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(network_secret.trim().as_bytes());
    let digest = hasher.finalize();
    let encoded = base32_lowercase(&digest);
    encoded.chars().take(10).collect()
}

/// RFC 4648 base32, lowercase, no padding. The network hash format is
/// fixed; no pack crate ships this alphabet so it lives here.
fn base32_lowercase(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Derive `count` deterministic /24 candidates for the hash and role.
pub fn build_ipv4_candidates(network_hash: &str, role: Role, count: usize) -> Vec<Ipv4Candidate> {
    let count = if count == 0 { SUBNET_CANDIDATE_COUNT } else { count };

    let (host_local, host_peer) = match role {
        Role::Client => (1u8, 2u8),
        Role::Server => (2u8, 1u8),
    };

    let digest = Sha256::digest(network_hash.trim().as_bytes());
    let seed = ((digest[0] as usize) << 8) | digest[1] as usize;

    let mut out = Vec::with_capacity(count);
    let mut seen = std::collections::HashSet::with_capacity(count);
    let mut i = 0usize;
    while out.len() < count && i < 65536 {
        let idx = (seed + i) % 65536;
        i += 1;
        let oct2 = (idx / 256) as u8;
        let oct3 = (idx % 256) as u8;

        let subnet = format!("10.{oct2}.{oct3}.0/24");
        if !seen.insert(subnet.clone()) {
            continue;
        }

        let local_ip = format!("10.{oct2}.{oct3}.{host_local}");
        out.push(Ipv4Candidate {
            local_cidr: format!("{local_ip}/24"),
            local_ip,
            subnet_cidr: subnet,
            expected_peer_ip: format!("10.{oct2}.{oct3}.{host_peer}"),
        });
    }
    out
}

/// Drop candidates whose /24 overlaps any in-use network. An empty filter
/// result is returned as-is; the caller decides whether to fall back.
pub fn filter_non_conflicting(
    candidates: &[Ipv4Candidate],
    used_nets: &[Ipv4Net],
) -> Vec<Ipv4Candidate> {
    if candidates.is_empty() {
        return Vec::new();
    }
    if used_nets.is_empty() {
        return candidates.to_vec();
    }

    candidates
        .iter()
        .filter(|c| match c.subnet_cidr.parse::<Ipv4Net>() {
            Ok(net) => !overlaps_any(&net, used_nets),
            Err(_) => false,
        })
        .cloned()
        .collect()
}

fn overlaps_any(candidate: &Ipv4Net, others: &[Ipv4Net]) -> bool {
    others.iter().any(|other| {
        candidate.contains(&other.network()) || other.contains(&candidate.network())
    })
}

/// Candidate list for a connect round: derived, then filtered against the
/// supplied in-use networks. If filtering empties the list the unfiltered
/// candidates are returned — trying beats giving up.
pub fn choose_candidates(
    network_hash: &str,
    role: Role,
    used_nets: &[Ipv4Net],
) -> Vec<Ipv4Candidate> {
    let candidates = build_ipv4_candidates(network_hash, role, SUBNET_CANDIDATE_COUNT);
    let filtered = filter_non_conflicting(&candidates, used_nets);
    if filtered.is_empty() {
        candidates
    } else {
        filtered
    }
}

/// Move the preferred subnet (if present) to the front, keeping the rest
/// in order. Used on reconnect to retry the last-successful subnet first.
pub fn reorder_by_preferred_subnet(
    mut candidates: Vec<Ipv4Candidate>,
    preferred: &str,
) -> Vec<Ipv4Candidate> {
    let target = preferred.trim();
    if target.is_empty() || candidates.len() <= 1 {
        return candidates;
    }
    let Some(idx) = candidates
        .iter()
        .position(|c| c.subnet_cidr.trim().eq_ignore_ascii_case(target))
    else {
        return candidates;
    };
    if idx == 0 {
        return candidates;
    }
    let preferred = candidates.remove(idx);
    candidates.insert(0, preferred);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_hash_is_stable_lowercase_and_ten_chars() {
        let h1 = compute_network_hash("telehand:abc", "telehand:abc1234");
        let h2 = compute_network_hash("telehand:abc", "telehand:abc1234");
        let h3 = compute_network_hash("telehand:abc", "telehand:abc5678");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 10);
        assert_eq!(h1.to_lowercase(), h1);
    }

    #[test]
    fn role_asymmetry() {
        let client = build_ipv4_candidates("aaaaaaaaaa", Role::Client, 2);
        let server = build_ipv4_candidates("aaaaaaaaaa", Role::Server, 2);
        assert!(client[0].local_cidr.ends_with(".1/24"), "{:?}", client[0]);
        assert!(client[0].expected_peer_ip.ends_with(".2"));
        assert!(server[0].local_cidr.ends_with(".2/24"), "{:?}", server[0]);
        assert!(server[0].expected_peer_ip.ends_with(".1"));
        // Both roles walk the same subnets.
        assert_eq!(client[0].subnet_cidr, server[0].subnet_cidr);
    }

    #[test]
    fn candidates_are_deterministic_and_distinct() {
        let a = build_ipv4_candidates("hash", Role::Client, 8);
        let b = build_ipv4_candidates("hash", Role::Client, 8);
        assert_eq!(a, b);
        let subnets: std::collections::HashSet<_> =
            a.iter().map(|c| c.subnet_cidr.clone()).collect();
        assert_eq!(subnets.len(), 8);
    }

    #[test]
    fn conflict_filter_drops_overlaps() {
        let candidates = vec![
            Ipv4Candidate {
                local_cidr: "10.1.2.1/24".into(),
                local_ip: "10.1.2.1".into(),
                subnet_cidr: "10.1.2.0/24".into(),
                expected_peer_ip: "10.1.2.2".into(),
            },
            Ipv4Candidate {
                local_cidr: "10.3.4.1/24".into(),
                local_ip: "10.3.4.1".into(),
                subnet_cidr: "10.3.4.0/24".into(),
                expected_peer_ip: "10.3.4.2".into(),
            },
        ];
        let used = vec![
            "10.1.0.0/16".parse::<Ipv4Net>().unwrap(),
            "192.168.1.0/24".parse::<Ipv4Net>().unwrap(),
        ];
        let filtered = filter_non_conflicting(&candidates, &used);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].subnet_cidr, "10.3.4.0/24");
    }

    #[test]
    fn choose_falls_back_to_unfiltered_when_everything_conflicts() {
        let used = vec!["10.0.0.0/8".parse::<Ipv4Net>().unwrap()];
        let got = choose_candidates("hash", Role::Server, &used);
        assert_eq!(got.len(), SUBNET_CANDIDATE_COUNT);
    }

    #[test]
    fn preferred_subnet_moves_to_front() {
        let candidates = build_ipv4_candidates("hash", Role::Client, 4);
        let preferred = candidates[2].subnet_cidr.clone();
        let reordered = reorder_by_preferred_subnet(candidates.clone(), &preferred);
        assert_eq!(reordered[0].subnet_cidr, preferred);
        assert_eq!(reordered.len(), candidates.len());
        // Unknown subnet leaves the order untouched.
        let untouched = reorder_by_preferred_subnet(candidates.clone(), "10.255.255.0/24");
        assert_eq!(untouched, candidates);
    }
}

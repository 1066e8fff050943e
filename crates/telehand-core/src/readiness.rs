//! Overlay snapshot model and the peer-readiness classifier.
//!
//! Classification is a pure function of one snapshot: the overlay CLI's
//! node info plus its peer list. Rendezvous servers announce hostnames
//! prefixed `PublicServer_` and never carry a business virtual IP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hostname prefix that marks a rendezvous (bootstrap) server.
pub const BOOTSTRAP_HOSTNAME_PREFIX: &str = "PublicServer_";

/// Node info as reported by `easytier-cli node info -o json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    /// CIDR form, e.g. `10.126.126.2/24`; strip before use.
    #[serde(default)]
    pub ipv4_addr: String,
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub version: String,
}

/// One peer row from `easytier-cli peer list -o json`.
///
/// Field names vary a little across overlay versions, so everything is
/// defaulted and the interesting ones carry aliases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerEntry {
    #[serde(default, alias = "peer_id")]
    pub id: String,
    #[serde(default, alias = "virtual_ipv4")]
    pub ipv4: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub cost: String,
    #[serde(default, alias = "latency")]
    pub lat_ms: String,
    #[serde(default)]
    pub loss_rate: String,
    #[serde(default, alias = "upload")]
    pub tx_bytes: String,
    #[serde(default, alias = "download")]
    pub rx_bytes: String,
    #[serde(default, alias = "protocol")]
    pub tunnel_proto: String,
    #[serde(default)]
    pub version: String,
}

/// How ready the business endpoint looks in one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerClass {
    /// No non-self peers at all.
    #[default]
    None,
    /// Only rendezvous servers are connected.
    BootstrapOnly,
    /// A business peer exists but has no virtual IP yet.
    BusinessPeerWaitingIp,
    /// A business peer with a virtual IP is present.
    EndpointReady,
}

impl PeerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerClass::None => "none",
            PeerClass::BootstrapOnly => "bootstrap_only",
            PeerClass::BusinessPeerWaitingIp => "business_peer_waiting_ip",
            PeerClass::EndpointReady => "endpoint_ready",
        }
    }
}

impl std::fmt::Display for PeerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerReadiness {
    /// True iff the class is `endpoint_ready`.
    pub ready: bool,
    /// Some entry differs from the node's own id or hostname.
    pub non_self_present: bool,
    pub class: PeerClass,
    /// Virtual IP of the ready business peer, when `ready`.
    pub target_ip: String,
    /// Id/hostname of the most relevant non-self peer, for logs.
    pub peer_id: String,
    pub peer_hostname: String,
    /// All non-self peer ids seen in this snapshot.
    pub peer_ids: Vec<String>,
}

/// One pull from the overlay: node info, raw peers, classification.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub at: DateTime<Utc>,
    pub node: Option<NodeInfo>,
    pub peers: Vec<PeerEntry>,
    pub readiness: PeerReadiness,
}

impl Snapshot {
    /// Whether the node reports a usable virtual IP.
    pub fn has_node_ip(&self) -> bool {
        match &self.node {
            Some(node) => {
                let ip = strip_cidr(&node.ipv4_addr);
                !ip.is_empty() && ip != "0.0.0.0"
            }
            None => false,
        }
    }
}

/// Strip the prefix length from a CIDR-form address.
pub fn strip_cidr(addr: &str) -> &str {
    addr.trim().split('/').next().unwrap_or("").trim()
}

fn is_bootstrap_hostname(hostname: &str) -> bool {
    hostname.trim().starts_with(BOOTSTRAP_HOSTNAME_PREFIX)
}

fn is_zero_ip(ip: &str) -> bool {
    let ip = strip_cidr(ip);
    ip.is_empty() || ip == "0.0.0.0"
}

/// Classify a peer list against the node's own identity.
pub fn classify_peers(node: Option<&NodeInfo>, peers: &[PeerEntry]) -> PeerReadiness {
    let self_id = node.map(|n| n.peer_id.trim()).unwrap_or("");
    let self_hostname = node.map(|n| n.hostname.trim()).unwrap_or("");

    let mut readiness = PeerReadiness::default();
    let mut saw_business_peer = false;
    let mut saw_bootstrap = false;

    for peer in peers {
        let id = peer.id.trim();
        let hostname = peer.hostname.trim();

        // Non-self: the peer-id differs from our own, or the hostname does.
        let id_differs = !id.is_empty() && id != self_id;
        let hostname_differs = !hostname.is_empty() && hostname != self_hostname;
        if !id_differs && !hostname_differs {
            continue;
        }

        readiness.non_self_present = true;
        if !id.is_empty() && !readiness.peer_ids.iter().any(|existing| existing == id) {
            readiness.peer_ids.push(id.to_string());
        }

        if is_bootstrap_hostname(hostname) {
            saw_bootstrap = true;
            if readiness.peer_id.is_empty() {
                readiness.peer_id = id.to_string();
                readiness.peer_hostname = hostname.to_string();
            }
            continue;
        }

        saw_business_peer = true;
        if !is_zero_ip(&peer.ipv4) && !readiness.ready {
            readiness.ready = true;
            readiness.target_ip = strip_cidr(&peer.ipv4).to_string();
            readiness.peer_id = id.to_string();
            readiness.peer_hostname = hostname.to_string();
        } else if readiness.peer_id.is_empty() || is_bootstrap_hostname(&readiness.peer_hostname) {
            readiness.peer_id = id.to_string();
            readiness.peer_hostname = hostname.to_string();
        }
    }

    readiness.class = if readiness.ready {
        PeerClass::EndpointReady
    } else if saw_business_peer {
        PeerClass::BusinessPeerWaitingIp
    } else if saw_bootstrap {
        PeerClass::BootstrapOnly
    } else {
        PeerClass::None
    };

    readiness
}

/// Build a full snapshot from one node + peer-list read.
pub fn build_snapshot(node: Option<NodeInfo>, peers: Vec<PeerEntry>) -> Snapshot {
    let readiness = classify_peers(node.as_ref(), &peers);
    Snapshot {
        at: Utc::now(),
        node,
        peers,
        readiness,
    }
}

//! Latency-based peer ranking.
//!
//! Each peer is probed with a bounded connect-and-close of its declared
//! scheme. Ranking never fails: unreachable peers get a sentinel RTT and
//! sort after reachable ones, preserving input order on ties.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

use crate::peer_pool::{mask_peer_address, normalize_peer_address};
use crate::timing::{
    PEER_PROBE_CONCURRENCY, PEER_PROBE_SAMPLE_COUNT, PEER_PROBE_TIMEOUT,
    PEER_PROBE_UNREACHABLE_RTT,
};

/// Outcome of probing a single peer.
#[derive(Debug, Clone)]
pub struct PeerProbeResult {
    pub peer: String,
    pub latency: Duration,
    pub reachable: bool,
    pub err: Option<String>,
}

/// Ranked pool plus per-peer probe detail.
#[derive(Debug, Clone, Default)]
pub struct PeerSelection {
    pub ordered: Vec<String>,
    pub results: Vec<PeerProbeResult>,
}

/// Probe function signature; injectable for tests.
pub type ProbeFn = Arc<
    dyn Fn(String, Duration, usize) -> Pin<Box<dyn Future<Output = Result<Duration, String>> + Send>>
        + Send
        + Sync,
>;

/// Default probe: real connect-and-close of the peer's declared scheme.
pub fn default_probe() -> ProbeFn {
    Arc::new(|peer, probe_timeout, samples| {
        Box::pin(async move { probe_peer_latency(&peer, probe_timeout, samples).await })
    })
}

/// Rank a pool with the default probe and timing constants.
pub async fn rank_peers_by_latency(peers: &[String]) -> PeerSelection {
    rank_peers_with_probe(
        peers,
        PEER_PROBE_TIMEOUT,
        PEER_PROBE_CONCURRENCY,
        PEER_PROBE_SAMPLE_COUNT,
        default_probe(),
    )
    .await
}

/// Rank a pool with an explicit probe, timeout, and worker budget.
pub async fn rank_peers_with_probe(
    peers: &[String],
    probe_timeout: Duration,
    concurrency: usize,
    sample_count: usize,
    probe: ProbeFn,
) -> PeerSelection {
    if peers.is_empty() {
        return PeerSelection::default();
    }
    let probe_timeout = if probe_timeout.is_zero() {
        PEER_PROBE_TIMEOUT
    } else {
        probe_timeout
    };
    let concurrency = concurrency.max(1);
    let sample_count = sample_count.max(1);

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut handles = Vec::with_capacity(peers.len());
    for peer in peers {
        let peer = peer.clone();
        let probe = Arc::clone(&probe);
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            match probe(peer.clone(), probe_timeout, sample_count).await {
                Ok(latency) => PeerProbeResult {
                    peer,
                    latency,
                    reachable: true,
                    err: None,
                },
                Err(err) => PeerProbeResult {
                    peer,
                    latency: PEER_PROBE_UNREACHABLE_RTT,
                    reachable: false,
                    err: Some(err),
                },
            }
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(join_err) => debug!(error = %join_err, "peer probe task panicked"),
        }
    }

    // Stable sort: reachable first, then ascending latency; ties keep
    // input order.
    results.sort_by(|a, b| {
        b.reachable
            .cmp(&a.reachable)
            .then(a.latency.cmp(&b.latency))
    });

    let ordered = results.iter().map(|r| r.peer.clone()).collect();
    PeerSelection { ordered, results }
}

/// Average connect latency over `sample_count` probes.
async fn probe_peer_latency(
    peer: &str,
    probe_timeout: Duration,
    sample_count: usize,
) -> Result<Duration, String> {
    let (scheme, address) = peer_dial_target(peer)?;
    let mut total = Duration::ZERO;
    for _ in 0..sample_count.max(1) {
        let start = Instant::now();
        match scheme {
            ProbeScheme::Tcp => {
                let connect = TcpStream::connect(&address);
                timeout(probe_timeout, connect)
                    .await
                    .map_err(|_| format!("connect to {} timed out", mask_peer_address(peer)))?
                    .map_err(|e| e.to_string())?;
            }
            ProbeScheme::Udp => {
                // A UDP connect only binds the remote address; treat socket
                // setup time as the latency estimate.
                let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| e.to_string())?;
                timeout(probe_timeout, socket.connect(&address))
                    .await
                    .map_err(|_| format!("connect to {} timed out", mask_peer_address(peer)))?
                    .map_err(|e| e.to_string())?;
            }
        }
        total += start.elapsed();
    }
    Ok(total / sample_count.max(1) as u32)
}

#[derive(Clone, Copy)]
enum ProbeScheme {
    Tcp,
    Udp,
}

fn peer_dial_target(peer: &str) -> Result<(ProbeScheme, String), String> {
    let normalized = normalize_peer_address(peer).ok_or("invalid peer address")?;
    let (scheme, rest) = normalized.split_once("://").ok_or("invalid peer address")?;
    let scheme = match scheme {
        "tcp" => ProbeScheme::Tcp,
        "udp" => ProbeScheme::Udp,
        other => return Err(format!("unsupported peer scheme: {other}")),
    };
    Ok((scheme, rest.to_string()))
}

/// One-line summary of a ranking for the debug log, hosts masked.
pub fn format_selection_for_log(results: &[PeerProbeResult]) -> String {
    if results.is_empty() {
        return "-".to_string();
    }
    let items: Vec<String> = results
        .iter()
        .map(|res| {
            let peer = mask_peer_address(&res.peer);
            if res.reachable {
                format!("{peer}({}ms)", res.latency.as_millis())
            } else {
                format!("{peer}(unreachable)")
            }
        })
        .collect();
    items.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_probe(table: Vec<(&'static str, Result<u64, &'static str>)>) -> ProbeFn {
        let table: std::collections::HashMap<String, Result<u64, String>> = table
            .into_iter()
            .map(|(peer, res)| {
                (
                    peer.to_string(),
                    res.map_err(|e| e.to_string()),
                )
            })
            .collect();
        Arc::new(move |peer, _timeout, _samples| {
            let res = table.get(&peer).cloned().unwrap_or(Err("unknown".into()));
            Box::pin(async move { res.map(Duration::from_millis) })
        })
    }

    #[tokio::test]
    async fn reachable_peers_sort_before_unreachable() {
        let peers = vec![
            "tcp://1.1.1.1:1".to_string(),
            "tcp://2.2.2.2:1".to_string(),
            "tcp://3.3.3.3:1".to_string(),
        ];
        let probe = fixed_probe(vec![
            ("tcp://1.1.1.1:1", Err("refused")),
            ("tcp://2.2.2.2:1", Ok(50)),
            ("tcp://3.3.3.3:1", Ok(10)),
        ]);
        let selection =
            rank_peers_with_probe(&peers, Duration::from_millis(10), 2, 1, probe).await;
        assert_eq!(
            selection.ordered,
            vec![
                "tcp://3.3.3.3:1".to_string(),
                "tcp://2.2.2.2:1".to_string(),
                "tcp://1.1.1.1:1".to_string(),
            ]
        );
        assert!(!selection.results[2].reachable);
        assert_eq!(selection.results[2].latency, PEER_PROBE_UNREACHABLE_RTT);
    }

    #[tokio::test]
    async fn all_unreachable_preserves_input_order() {
        let peers = vec![
            "tcp://1.1.1.1:1".to_string(),
            "tcp://2.2.2.2:1".to_string(),
        ];
        let probe = fixed_probe(vec![
            ("tcp://1.1.1.1:1", Err("down")),
            ("tcp://2.2.2.2:1", Err("down")),
        ]);
        let selection =
            rank_peers_with_probe(&peers, Duration::from_millis(10), 4, 1, probe).await;
        assert_eq!(selection.ordered, peers);
    }

    #[tokio::test]
    async fn equal_latency_keeps_input_order() {
        let peers = vec![
            "tcp://9.9.9.9:1".to_string(),
            "tcp://8.8.8.8:1".to_string(),
        ];
        let probe = fixed_probe(vec![
            ("tcp://9.9.9.9:1", Ok(25)),
            ("tcp://8.8.8.8:1", Ok(25)),
        ]);
        let selection =
            rank_peers_with_probe(&peers, Duration::from_millis(10), 4, 1, probe).await;
        assert_eq!(selection.ordered, peers);
    }

    #[tokio::test]
    async fn empty_pool_yields_empty_selection() {
        let selection = rank_peers_by_latency(&[]).await;
        assert!(selection.ordered.is_empty());
        assert!(selection.results.is_empty());
    }

    #[test]
    fn log_line_masks_hosts() {
        let results = vec![
            PeerProbeResult {
                peer: "tcp://1.2.3.4:11010".into(),
                latency: Duration::from_millis(12),
                reachable: true,
                err: None,
            },
            PeerProbeResult {
                peer: "tcp://5.6.7.8:11010".into(),
                latency: PEER_PROBE_UNREACHABLE_RTT,
                reachable: false,
                err: Some("refused".into()),
            },
        ];
        let line = format_selection_for_log(&results);
        assert_eq!(line, "tcp://1.2.*.*:11010(12ms), tcp://5.6.*.*:11010(unreachable)");
    }
}

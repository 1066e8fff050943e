//! Session state machine: the connect round.
//!
//! One connect round walks the subnet candidates (outer loop) and the
//! ranked peers (inner loop), spawning a fresh supervisor per attempt and
//! judging each candidate through the poller's snapshot/event stream.
//! Peer-level failures rotate the peer; route-conflict evidence forces the
//! next subnet; TUN-permission and auth failures abort the whole session.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::error::{classify_error, CoreError, CoreResult, ErrorCode};
use crate::overlay::{EasyTier, LogSink, OverlayBundle, StartOptions};
use crate::peer_pool::{self, mask_peer_address};
use crate::plan::{self, Ipv4Candidate, Role, SessionBaseline};
use crate::poller::{Event, EventKind, StatePoller};
use crate::readiness::{PeerClass, PeerReadiness, Snapshot};
use crate::selector::{self, PeerSelection};
use crate::status::{Phase, SharedStatus};
use crate::timing::{
    BOOTSTRAP_WAIT_TIMEOUT, CANDIDATE_LOG_LIMITER_TTL, CANDIDATE_MAX_CHECKS, PEER_PROBE_TIMEOUT,
    STATE_POLL_INTERVAL, WAIT_IP_TIMEOUT,
};

/// Boxed future alias for the injectable dependency record.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Budgets for judging one candidate.
#[derive(Debug, Clone)]
pub struct CandidateCheckConfig {
    pub max_checks: usize,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Return from evaluation as soon as any non-self peer shows up,
    /// instead of waiting out the bootstrap timeout. Off by default.
    pub return_on_bootstrap: bool,
}

impl Default for CandidateCheckConfig {
    fn default() -> Self {
        Self {
            max_checks: CANDIDATE_MAX_CHECKS,
            poll_interval: STATE_POLL_INTERVAL,
            probe_timeout: PEER_PROBE_TIMEOUT,
            return_on_bootstrap: false,
        }
    }
}

/// Outcome of one candidate evaluation pass.
#[derive(Debug, Default)]
pub struct CandidateCheckResult {
    pub peer_ready: bool,
    pub non_self_present: bool,
    pub peer_class: PeerClass,
    pub target_ip: String,
    pub probe_success: bool,
    pub peer_query_failures: usize,
    pub route_mismatch_detail: String,
    pub last_probe_err: Option<String>,
    pub host_route_installed: bool,
    pub interrupted: bool,
}

/// Result of a successful connect round.
#[derive(Debug)]
pub struct ConnectRoundResult {
    pub et: Arc<EasyTier>,
    pub virt_ip: String,
    pub baseline: SessionBaseline,
    /// Target the host route was pinned for; removed on teardown.
    pub active_host_route_peer: String,
    pub selected_peer: String,
    pub ordered_peers: Vec<String>,
}

/// Why a connect round ended without a running session.
#[derive(Debug)]
pub enum ConnectFailure {
    /// User stop or signal.
    Interrupted,
    /// Terminal failure with its taxonomy code.
    Failed { code: ErrorCode, error: CoreError },
}

impl ConnectFailure {
    fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        ConnectFailure::Failed {
            code,
            error: CoreError::coded(code, message),
        }
    }
}

/// Everything a candidate evaluation needs, bundled so the evaluation
/// itself is swappable in tests.
pub struct EvalRequest {
    pub et: Arc<EasyTier>,
    pub tun_device: String,
    pub api_port: u16,
    pub check_cfg: CandidateCheckConfig,
    pub deps: SessionDeps,
    pub stop: CancellationToken,
    pub log: DecisionLogFn,
}

/// Candidate-decision logger: `(result, reason, detail)`.
pub type DecisionLogFn = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

pub type EvalFn = Arc<dyn Fn(EvalRequest) -> BoxFuture<CandidateCheckResult> + Send + Sync>;

/// Injected platform and process seams.
///
/// Defaults wire the real implementations; tests substitute the pieces
/// they need. Cloning shares the same underlying functions.
#[derive(Clone)]
pub struct SessionDeps {
    pub new_overlay: Arc<dyn Fn(Option<LogSink>) -> Arc<EasyTier> + Send + Sync>,
    pub start_overlay:
        Arc<dyn Fn(Arc<EasyTier>, SessionConfig, StartOptions) -> BoxFuture<CoreResult<()>> + Send + Sync>,
    pub wait_for_ip: Arc<dyn Fn(Arc<EasyTier>, Duration) -> BoxFuture<CoreResult<String>> + Send + Sync>,
    pub interface_by_ipv4: Arc<dyn Fn(String) -> BoxFuture<CoreResult<String>> + Send + Sync>,
    pub collect_local_nets: Arc<dyn Fn() -> BoxFuture<CoreResult<Vec<Ipv4Net>>> + Send + Sync>,
    pub collect_route_nets: Arc<dyn Fn() -> BoxFuture<CoreResult<Vec<Ipv4Net>>> + Send + Sync>,
    pub rank_peers: Arc<dyn Fn(Vec<String>) -> BoxFuture<PeerSelection> + Send + Sync>,
    pub route_interface_for_target: Arc<dyn Fn(String) -> BoxFuture<CoreResult<String>> + Send + Sync>,
    pub add_host_route: Arc<dyn Fn(String, String) -> BoxFuture<CoreResult<()>> + Send + Sync>,
    pub remove_host_route: Arc<dyn Fn(String, String) -> BoxFuture<CoreResult<()>> + Send + Sync>,
    pub probe_peer_virtual_ip:
        Arc<dyn Fn(String, u16, Duration) -> BoxFuture<CoreResult<()>> + Send + Sync>,
    pub should_check_route_owner: Arc<dyn Fn() -> bool + Send + Sync>,
    pub start_poller: Arc<
        dyn Fn(
                Arc<EasyTier>,
                Duration,
                CancellationToken,
            ) -> (mpsc::Receiver<Snapshot>, mpsc::Receiver<Event>)
            + Send
            + Sync,
    >,
    pub evaluate_candidate: EvalFn,
}

impl SessionDeps {
    /// Production wiring around a concrete overlay bundle.
    pub fn new(bundle: OverlayBundle) -> Self {
        Self {
            new_overlay: Arc::new(move |sink| Arc::new(EasyTier::new(bundle.clone(), sink))),
            start_overlay: Arc::new(|et, cfg, opts| {
                Box::pin(async move { et.start(&cfg, opts).await })
            }),
            wait_for_ip: Arc::new(|et, timeout| {
                Box::pin(async move { et.wait_for_ip(timeout).await })
            }),
            interface_by_ipv4: Arc::new(|ip| {
                Box::pin(async move { crate::platform::interface_by_ipv4(&ip).await })
            }),
            collect_local_nets: Arc::new(|| {
                Box::pin(crate::platform::collect_local_ipv4_nets())
            }),
            collect_route_nets: Arc::new(|| {
                Box::pin(crate::platform::collect_route_ipv4_nets())
            }),
            rank_peers: Arc::new(|peers| {
                Box::pin(async move { selector::rank_peers_by_latency(&peers).await })
            }),
            route_interface_for_target: Arc::new(|ip| {
                Box::pin(async move { crate::platform::route_interface_for_target(&ip).await })
            }),
            add_host_route: Arc::new(|ip, dev| {
                Box::pin(async move { crate::platform::add_host_route(&ip, &dev).await })
            }),
            remove_host_route: Arc::new(|ip, dev| {
                Box::pin(async move { crate::platform::remove_host_route(&ip, &dev).await })
            }),
            probe_peer_virtual_ip: Arc::new(|ip, port, timeout| {
                Box::pin(async move { probe_peer_virtual_ip(&ip, port, timeout).await })
            }),
            should_check_route_owner: Arc::new(crate::platform::should_check_route_ownership),
            start_poller: Arc::new(|et, interval, cancel| {
                StatePoller::new(et, interval).start(cancel)
            }),
            evaluate_candidate: Arc::new(|req| Box::pin(evaluate_candidate_connectivity(req))),
        }
    }
}

/// TCP reachability probe against a peer's virtual IP and the control-API
/// port it should be serving.
pub async fn probe_peer_virtual_ip(ip: &str, port: u16, timeout: Duration) -> CoreResult<()> {
    let target: std::net::Ipv4Addr = ip
        .trim()
        .parse()
        .map_err(|_| CoreError::Overlay(format!("invalid peer ip: {ip:?}")))?;
    let addr = format!("{target}:{port}");
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
        .await
        .map_err(|_| CoreError::Overlay(format!("probe {addr} timed out")))?
        .map_err(|e| CoreError::Overlay(format!("probe {addr}: {e}")))?;
    drop(stream);
    Ok(())
}

/// TTL-deduplicated candidate-decision logging.
///
/// Reasons prefixed `event_` bypass the limiter: event-sourced lines are
/// rare and each occurrence matters.
#[derive(Clone)]
pub struct DecisionLogLimiter {
    seen: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: Duration,
}

impl DecisionLogLimiter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    fn should_log(&self, key: &str, reason: &str) -> bool {
        if reason.trim().starts_with("event_") {
            return true;
        }
        let mut seen = self.seen.lock().expect("limiter lock");
        let now = Instant::now();
        match seen.get(key) {
            Some(last) if now.duration_since(*last) < self.ttl => false,
            _ => {
                seen.insert(key.to_string(), now);
                true
            }
        }
    }
}

impl Default for DecisionLogLimiter {
    fn default() -> Self {
        Self::new(CANDIDATE_LOG_LIMITER_TTL)
    }
}

/// Emit one candidate decision to the debug ring and the log stream.
pub fn log_candidate_decision(
    status: &SharedStatus,
    limiter: &DecisionLogLimiter,
    attempt: usize,
    total: usize,
    subnet: &str,
    result: &str,
    reason: &str,
    detail: &str,
) {
    let key = format!("{}|{}|{}|{}", subnet.trim(), result.trim(), reason.trim(), detail.trim());
    if !limiter.should_log(&key, reason) {
        return;
    }
    let line = format!(
        "[telehand] candidate={attempt}/{total} subnet={subnet} result={result} reason={reason} detail={detail}"
    );
    status.add_debug_log(&line);
    info!("{line}");
}

/// Progress line shown on the pairing page for a switch reason.
fn connecting_status_from_reason(reason: &str) -> Option<&'static str> {
    match reason.trim() {
        "bootstrap_connected" | "peer_wait_business_endpoint" => {
            Some("Bootstrap connected; holding current peer while waiting for the business endpoint...")
        }
        "business_endpoint_waiting" => Some("Business endpoint not connected yet (waiting for the remote side)"),
        "peer_not_ready" => Some("Waiting for the remote business endpoint..."),
        "peer_fallback_next" => Some("Current peer unavailable, switching to the next..."),
        "peer_all_failed_switch_subnet" => Some("No usable peer on this subnet, switching subnet..."),
        "route_conflict_detected" => Some("Route conflict detected, switching subnet..."),
        "peer_ready" => Some("Business endpoint connected"),
        _ => None,
    }
}

fn update_connecting_reason(status: &SharedStatus, reason: &str) {
    let Some(line) = connecting_status_from_reason(reason) else {
        return;
    };
    let reason = reason.trim().to_string();
    status.update_state_in_phase(Phase::Connecting, |state| {
        state.last_switch_reason = reason;
        state.endpoint_status = line.to_string();
    });
}

/// Total snapshot budget for one evaluation pass.
pub fn candidate_eval_window(cfg: &CandidateCheckConfig) -> Duration {
    let checks = cfg.max_checks.max(1) as u32;
    let interval = if cfg.poll_interval.is_zero() {
        STATE_POLL_INTERVAL
    } else {
        cfg.poll_interval
    };
    let mut window = interval * checks;
    if !cfg.probe_timeout.is_zero() {
        window += cfg.probe_timeout * checks;
    }
    window
}

/// One connect round: subnet candidates outer, ranked peers inner.
#[allow(clippy::too_many_arguments)]
pub async fn connect_with_peer_fallback(
    status: &Arc<SharedStatus>,
    cfg: &SessionConfig,
    role: Role,
    network_hash: &str,
    api_port: u16,
    check_cfg: &CandidateCheckConfig,
    deps: &SessionDeps,
    set_runtime_overlay: &(dyn Fn(Option<Arc<EasyTier>>) + Send + Sync),
    preferred_subnet: &str,
    stop: &CancellationToken,
    limiter: &DecisionLogLimiter,
) -> Result<ConnectRoundResult, ConnectFailure> {
    if stop.is_cancelled() {
        return Err(ConnectFailure::Interrupted);
    }

    let peer_pool = peer_pool::runtime_peer_pool(&cfg.peers);
    if peer_pool.is_empty() {
        return Err(ConnectFailure::failed(
            ErrorCode::PeerUnreachable,
            "no available peers after normalization",
        ));
    }

    status.update_state_in_phase(Phase::Connecting, |state| {
        state.endpoint_status = "Probing available peers...".into();
    });
    let selection = (deps.rank_peers)(peer_pool).await;
    let ordered_peers = selection.ordered.clone();
    if ordered_peers.is_empty() {
        return Err(ConnectFailure::failed(
            ErrorCode::PeerUnreachable,
            "all peers unavailable after probe",
        ));
    }

    let peer_order_line = format!(
        "[telehand] peer_order={}",
        selector::format_selection_for_log(&selection.results)
    );
    status.add_debug_log(&peer_order_line);
    info!("{peer_order_line}");

    let mut used_nets = match (deps.collect_local_nets)().await {
        Ok(nets) => nets,
        Err(err) => {
            let msg = format!("[telehand] startup precheck warning: collect local networks failed: {err}");
            status.add_debug_log(&msg);
            warn!("{msg}");
            Vec::new()
        }
    };
    if let Ok(route_nets) = (deps.collect_route_nets)().await {
        used_nets.extend(route_nets);
    }

    let candidates = plan::choose_candidates(network_hash, role, &used_nets);
    if candidates.is_empty() {
        return Err(ConnectFailure::failed(
            ErrorCode::RouteConflictDetected,
            "no available subnet candidates",
        ));
    }
    let candidates = plan::reorder_by_preferred_subnet(candidates, preferred_subnet);
    let total = candidates.len();

    let mut last_err: Option<CoreError> = None;
    let mut last_code = ErrorCode::PeerUnreachable;

    for (idx, candidate) in candidates.iter().enumerate() {
        let attempt = idx + 1;
        if stop.is_cancelled() {
            return Err(ConnectFailure::Interrupted);
        }
        let candidate_msg = format!(
            "[telehand] startup candidate {attempt}/{total} subnet={} local={}",
            candidate.subnet_cidr, candidate.local_cidr
        );
        status.add_debug_log(&candidate_msg);
        info!("{candidate_msg}");
        status.update_state_in_phase(Phase::Connecting, |state| {
            state.virtual_subnet = candidate.subnet_cidr.clone();
            state.endpoint_status = "Business endpoint not connected, still probing...".into();
        });

        for (peer_idx, peer) in ordered_peers.iter().enumerate() {
            if stop.is_cancelled() {
                return Err(ConnectFailure::Interrupted);
            }
            let peer_attempt_msg = format!(
                "[telehand] peer attempt={}/{} peer={} subnet={}",
                peer_idx + 1,
                ordered_peers.len(),
                mask_peer_address(peer),
                candidate.subnet_cidr
            );
            status.add_debug_log(&peer_attempt_msg);
            info!("{peer_attempt_msg}");
            status.update_state_in_phase(Phase::Connecting, |state| {
                state.current_peer = peer.clone();
                state.virtual_subnet = candidate.subnet_cidr.clone();
                state.endpoint_status =
                    format!("Connecting to peer {}/{}...", peer_idx + 1, ordered_peers.len());
            });

            let mut peer_cfg = cfg.clone();
            peer_cfg.peers = vec![peer.clone()];

            let et = (deps.new_overlay)(Some(overlay_log_sink(status)));
            set_runtime_overlay(Some(Arc::clone(&et)));

            match attempt_peer(
                status,
                &peer_cfg,
                candidate,
                peer,
                api_port,
                check_cfg,
                deps,
                stop,
                limiter,
                attempt,
                total,
                Arc::clone(&et),
            )
            .await
            {
                PeerAttemptOutcome::Success {
                    virt_ip,
                    tun_device,
                    target_ip,
                } => {
                    status.update_state_in_phase(Phase::Connecting, |state| {
                        state.endpoint_status =
                            "Business endpoint connected, entering running...".into();
                        state.last_switch_reason = "peer_ready".into();
                    });
                    return Ok(ConnectRoundResult {
                        et,
                        virt_ip,
                        baseline: SessionBaseline {
                            tun_device,
                            virtual_cidr: candidate.subnet_cidr.clone(),
                            network_hash: network_hash.to_string(),
                        },
                        active_host_route_peer: target_ip,
                        selected_peer: peer.clone(),
                        ordered_peers,
                    });
                }
                PeerAttemptOutcome::Interrupted => {
                    set_runtime_overlay(None);
                    return Err(ConnectFailure::Interrupted);
                }
                PeerAttemptOutcome::Fatal { code, error } => {
                    set_runtime_overlay(None);
                    return Err(ConnectFailure::Failed { code, error });
                }
                PeerAttemptOutcome::NextPeer { code, error } => {
                    last_code = code;
                    last_err = Some(error);
                    set_runtime_overlay(None);
                }
                PeerAttemptOutcome::NextSubnet { code, error } => {
                    last_code = code;
                    last_err = Some(error);
                    set_runtime_overlay(None);
                    break;
                }
            }
        }

        // Whether the peers ran out or a conflict forced the switch, the
        // next step is the same: advance to the following subnet.
        log_candidate_decision(
            status,
            limiter,
            attempt,
            total,
            &candidate.subnet_cidr,
            "warn",
            "peer_all_failed_switch_subnet",
            &format!("peer_count={}", ordered_peers.len()),
        );
        update_connecting_reason(status, "peer_all_failed_switch_subnet");
    }

    let error = last_err.unwrap_or_else(|| CoreError::coded(last_code, "subnet candidate exhausted"));
    Err(ConnectFailure::Failed {
        code: last_code,
        error,
    })
}

enum PeerAttemptOutcome {
    Success {
        virt_ip: String,
        tun_device: String,
        target_ip: String,
    },
    Interrupted,
    Fatal { code: ErrorCode, error: CoreError },
    NextPeer { code: ErrorCode, error: CoreError },
    NextSubnet { code: ErrorCode, error: CoreError },
}

/// Drive one (candidate, peer) attempt through start, IP wait, and the
/// evaluation loop. The supervisor is stopped on every non-success path.
#[allow(clippy::too_many_arguments)]
async fn attempt_peer(
    status: &Arc<SharedStatus>,
    peer_cfg: &SessionConfig,
    candidate: &Ipv4Candidate,
    peer: &str,
    api_port: u16,
    check_cfg: &CandidateCheckConfig,
    deps: &SessionDeps,
    stop: &CancellationToken,
    limiter: &DecisionLogLimiter,
    attempt: usize,
    total: usize,
    et: Arc<EasyTier>,
) -> PeerAttemptOutcome {
    let masked = mask_peer_address(peer);
    let subnet = candidate.subnet_cidr.as_str();
    let decision = |result: &str, reason: &str, detail: &str| {
        log_candidate_decision(status, limiter, attempt, total, subnet, result, reason, detail);
        update_connecting_reason(status, reason);
    };

    let start_opts = StartOptions {
        ipv4_cidr: Some(candidate.local_cidr.clone()),
    };
    if let Err(start_err) = (deps.start_overlay)(Arc::clone(&et), peer_cfg.clone(), start_opts).await
    {
        let code = classify_error(Some(&start_err), &et.logs(), ErrorCode::EasytierStartFailed);
        et.stop().await;
        if matches!(code, ErrorCode::TunPermissionDenied | ErrorCode::AuthFailed) {
            return PeerAttemptOutcome::Fatal {
                code,
                error: start_err,
            };
        }
        decision("warn", "peer_fallback_next", &format!("peer={masked} start failed: {start_err}"));
        return PeerAttemptOutcome::NextPeer {
            code,
            error: start_err,
        };
    }

    let virt_ip = tokio::select! {
        _ = stop.cancelled() => {
            et.stop().await;
            return PeerAttemptOutcome::Interrupted;
        }
        res = (deps.wait_for_ip)(Arc::clone(&et), WAIT_IP_TIMEOUT) => match res {
            Ok(ip) => ip,
            Err(wait_err) => {
                let code = classify_error(Some(&wait_err), &et.logs(), ErrorCode::EasytierIpTimeout);
                et.stop().await;
                if !code.is_retryable() {
                    return PeerAttemptOutcome::Fatal { code, error: wait_err };
                }
                decision(
                    "warn",
                    "peer_fallback_next",
                    &format!("peer={masked} wait ip failed: {wait_err}"),
                );
                return PeerAttemptOutcome::NextPeer { code, error: wait_err };
            }
        }
    };

    let tun_device = match (deps.interface_by_ipv4)(virt_ip.clone()).await {
        Ok(dev) => dev,
        Err(dev_err) => {
            et.stop().await;
            decision(
                "warn",
                "peer_fallback_next",
                &format!("peer={masked} tun detect failed: {dev_err}"),
            );
            return PeerAttemptOutcome::NextPeer {
                code: ErrorCode::RouteConflictDetected,
                error: dev_err,
            };
        }
    };

    let wait_deadline = Instant::now() + BOOTSTRAP_WAIT_TIMEOUT;
    loop {
        let check = (deps.evaluate_candidate)(EvalRequest {
            et: Arc::clone(&et),
            tun_device: tun_device.clone(),
            api_port,
            check_cfg: check_cfg.clone(),
            deps: deps.clone(),
            stop: stop.clone(),
            log: {
                let status = Arc::clone(status);
                let limiter = limiter.clone();
                let subnet = subnet.to_string();
                Arc::new(move |result, reason, detail| {
                    log_candidate_decision(
                        &status, &limiter, attempt, total, &subnet, result, reason, detail,
                    );
                    update_connecting_reason(&status, reason);
                })
            },
        })
        .await;

        let teardown = |check: &CandidateCheckResult| {
            let remove = Arc::clone(&deps.remove_host_route);
            let installed = check.host_route_installed;
            let target = check.target_ip.clone();
            let dev = tun_device.clone();
            async move {
                if installed && !target.is_empty() {
                    let _ = remove(target, dev).await;
                }
            }
        };

        if check.interrupted {
            teardown(&check).await;
            et.stop().await;
            return PeerAttemptOutcome::Interrupted;
        }

        decision(
            "warn",
            "candidate_eval",
            &format!(
                "peer={masked} peer_ready={} probe_success={} non_self_present={} peer_class={} peer_query_failures={} target={}",
                check.peer_ready,
                check.probe_success,
                check.non_self_present,
                check.peer_class,
                check.peer_query_failures,
                check.target_ip.trim(),
            ),
        );

        if check.peer_ready && check.probe_success {
            return PeerAttemptOutcome::Success {
                virt_ip,
                tun_device,
                target_ip: check.target_ip.clone(),
            };
        }

        if !check.route_mismatch_detail.is_empty() && check.peer_query_failures >= check_cfg.max_checks
        {
            let detail = format!(
                "route conflict evidence: {}, peer_query_failed={}",
                check.route_mismatch_detail, check.peer_query_failures
            );
            decision("conflict", "route_conflict_detected", &detail);
            teardown(&check).await;
            et.stop().await;
            return PeerAttemptOutcome::NextSubnet {
                code: ErrorCode::RouteConflictDetected,
                error: CoreError::coded(ErrorCode::RouteConflictDetected, detail),
            };
        }

        let keep_waiting = !check.peer_ready
            && check.non_self_present
            && check.peer_query_failures == 0
            && matches!(
                check.peer_class,
                PeerClass::BootstrapOnly | PeerClass::BusinessPeerWaitingIp
            );
        if keep_waiting {
            if Instant::now() > wait_deadline {
                teardown(&check).await;
                et.stop().await;
                decision(
                    "warn",
                    "peer_fallback_next",
                    &format!("peer={masked} bootstrap wait timeout={BOOTSTRAP_WAIT_TIMEOUT:?}"),
                );
                return PeerAttemptOutcome::NextPeer {
                    code: ErrorCode::PeerUnreachable,
                    error: CoreError::coded(
                        ErrorCode::PeerUnreachable,
                        format!(
                            "business endpoint still not ready after {BOOTSTRAP_WAIT_TIMEOUT:?}"
                        ),
                    ),
                };
            }
            decision(
                "warn",
                "peer_wait_business_endpoint",
                &format!("peer={masked} class={} keep current peer and wait", check.peer_class),
            );
            tokio::select! {
                _ = stop.cancelled() => {
                    teardown(&check).await;
                    et.stop().await;
                    return PeerAttemptOutcome::Interrupted;
                }
                _ = tokio::time::sleep(check_cfg.poll_interval) => {}
            }
            continue;
        }

        let error = if check.peer_ready {
            match &check.last_probe_err {
                Some(probe_err) => CoreError::coded(
                    ErrorCode::PeerUnreachable,
                    format!("peer ready but connectivity probe failed: {probe_err}"),
                ),
                None => CoreError::coded(
                    ErrorCode::PeerUnreachable,
                    "peer probe failed without explicit conflict",
                ),
            }
        } else {
            CoreError::coded(ErrorCode::PeerUnreachable, "peer not ready")
        };
        teardown(&check).await;
        et.stop().await;
        decision("warn", "peer_fallback_next", &format!("peer={masked} {error}"));
        return PeerAttemptOutcome::NextPeer {
            code: ErrorCode::PeerUnreachable,
            error,
        };
    }
}

/// Log sink wiring overlay output into the debug ring, with the
/// peer-connection-removed annotation the diff engine cannot see.
fn overlay_log_sink(status: &Arc<SharedStatus>) -> LogSink {
    let status = Arc::clone(status);
    Arc::new(move |line: &str| {
        status.add_debug_log(line);
        info!("{line}");
        if line.contains("peer connection removed.") {
            let extra = "[telehand] event_peer_connection_removed source=easytier-core detail=core reported peer transport removed; waiting snapshot/event reconciliation";
            status.add_debug_log(extra);
            info!("{extra}");
        }
    })
}

/// Judge one candidate through the poller stream.
///
/// Returns when the endpoint probes healthy, the snapshot-error budget is
/// spent, the process exits, the evaluation window lapses, or the round is
/// stopped. The caller owns the keep-waiting/bootstrap-timeout policy.
pub async fn evaluate_candidate_connectivity(req: EvalRequest) -> CandidateCheckResult {
    let EvalRequest {
        et,
        tun_device,
        api_port,
        check_cfg,
        deps,
        stop,
        log,
    } = req;

    let mut result = CandidateCheckResult::default();
    let max_checks = check_cfg.max_checks.max(1);

    let poller_cancel = CancellationToken::new();
    let _poller_guard = poller_cancel.clone().drop_guard();
    let (mut snapshots, mut events) =
        (deps.start_poller)(Arc::clone(&et), check_cfg.poll_interval, poller_cancel.clone());

    let window = tokio::time::sleep(candidate_eval_window(&check_cfg));
    tokio::pin!(window);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                result.interrupted = true;
                return result;
            }
            _ = &mut window => {
                return result;
            }
            event = events.recv() => {
                let Some(event) = event else { return result };
                match event.kind {
                    EventKind::ProcessExit => {
                        let msg = "easytier process exited before candidate became ready";
                        result.last_probe_err = Some(msg.to_string());
                        log("warn", "event_process_exit", msg);
                        return result;
                    }
                    EventKind::PeerAdded => {
                        result.non_self_present = true;
                        if result.peer_class == PeerClass::None {
                            result.peer_class = if event.peer_class != PeerClass::None {
                                event.peer_class
                            } else {
                                PeerClass::BusinessPeerWaitingIp
                            };
                        }
                        log(
                            "warn",
                            "event_peer_added",
                            &format!(
                                "source=diff-engine peer_id={} peer_class={}",
                                dash_if_empty(&event.peer_id),
                                event.peer_class
                            ),
                        );
                        if check_cfg.return_on_bootstrap {
                            log(
                                "warn",
                                "business_endpoint_waiting",
                                "non-self peer observed via event; virtual ip not ready",
                            );
                            return result;
                        }
                    }
                    EventKind::PeerRemoved => {
                        log(
                            "warn",
                            "event_peer_removed",
                            &format!(
                                "source=diff-engine peer_id={} peer_class={}",
                                dash_if_empty(&event.peer_id),
                                event.peer_class
                            ),
                        );
                    }
                    EventKind::SnapshotError => {
                        result.peer_query_failures += 1;
                        log(
                            "warn",
                            "event_snapshot_error",
                            event.error.as_deref().unwrap_or("snapshot failed"),
                        );
                        if result.peer_query_failures >= max_checks {
                            return result;
                        }
                    }
                    EventKind::TunReady | EventKind::EndpointReady => {}
                }
            }
            snapshot = snapshots.recv() => {
                let Some(snapshot) = snapshot else { return result };
                if apply_snapshot(
                    &snapshot.readiness,
                    &mut result,
                    &tun_device,
                    api_port,
                    &check_cfg,
                    &deps,
                    &log,
                )
                .await
                {
                    return result;
                }
            }
        }
    }
}

fn dash_if_empty(value: &str) -> &str {
    if value.trim().is_empty() {
        "-"
    } else {
        value
    }
}

fn format_readiness_context(readiness: &PeerReadiness) -> String {
    let peer_ids: Vec<&str> = readiness
        .peer_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();
    format!(
        "ready={} class={} non_self={} peer_id={} peer_host={} target_ip={} peer_ids={}",
        readiness.ready,
        readiness.class,
        readiness.non_self_present,
        dash_if_empty(&readiness.peer_id),
        dash_if_empty(&readiness.peer_hostname),
        dash_if_empty(&readiness.target_ip),
        dash_if_empty(&peer_ids.join(","))
    )
}

/// Fold one snapshot into the running result. Returns true when the
/// evaluation is decided (ready + probe success, or a return-on-bootstrap
/// short circuit).
async fn apply_snapshot(
    readiness: &PeerReadiness,
    result: &mut CandidateCheckResult,
    tun_device: &str,
    api_port: u16,
    check_cfg: &CandidateCheckConfig,
    deps: &SessionDeps,
    log: &DecisionLogFn,
) -> bool {
    result.peer_ready = readiness.ready;
    result.non_self_present = result.non_self_present || readiness.non_self_present;
    result.target_ip = readiness.target_ip.trim().to_string();
    if readiness.class != PeerClass::None {
        result.peer_class = readiness.class;
    }

    if !result.peer_ready {
        let context = format_readiness_context(readiness);
        match readiness.class {
            PeerClass::BootstrapOnly => {
                log(
                    "warn",
                    "bootstrap_connected",
                    &format!("bootstrap peer connected, business endpoint not ready; {context}"),
                );
                if check_cfg.return_on_bootstrap && readiness.non_self_present {
                    return true;
                }
            }
            PeerClass::BusinessPeerWaitingIp => {
                log(
                    "warn",
                    "business_endpoint_waiting",
                    &format!("peer connected but virtual ip not ready; {context}"),
                );
                if check_cfg.return_on_bootstrap && readiness.non_self_present {
                    return true;
                }
            }
            _ if readiness.non_self_present => {
                log(
                    "warn",
                    "business_endpoint_waiting",
                    &format!("non-self peer present but virtual ip not ready; {context}"),
                );
                if check_cfg.return_on_bootstrap {
                    return true;
                }
            }
            _ => {
                log("warn", "peer_not_ready", &format!("peer list empty; {context}"));
            }
        }
        return false;
    }

    let target_ip = result.target_ip.clone();
    if (deps.should_check_route_owner)() && !target_ip.is_empty() {
        match (deps.route_interface_for_target)(target_ip.clone()).await {
            Err(route_err) => log("warn", "route_check_failed", &route_err.to_string()),
            Ok(route_iface) => {
                if !route_iface.trim().eq_ignore_ascii_case(tun_device.trim()) {
                    result.route_mismatch_detail = format!(
                        "target={target_ip} route_if={} tun_if={tun_device}",
                        route_iface.trim()
                    );
                    log("warn", "route_mismatch", &result.route_mismatch_detail);
                }
            }
        }
    }

    if target_ip.is_empty() {
        let msg = "target peer virtual ip is empty";
        result.last_probe_err = Some(msg.to_string());
        log("warn", "probe_timeout", msg);
        return false;
    }

    // Best effort: a failed route pin is logged, not fatal for the round.
    if !result.host_route_installed {
        match (deps.add_host_route)(target_ip.clone(), tun_device.to_string()).await {
            Ok(()) => {
                result.host_route_installed = true;
                log(
                    "pass",
                    "route_host_bound",
                    &format!("target={target_ip} tun_if={tun_device}"),
                );
            }
            Err(err) => log("warn", "route_host_add_failed", &err.to_string()),
        }
    }

    match (deps.probe_peer_virtual_ip)(target_ip.clone(), api_port, check_cfg.probe_timeout).await {
        Ok(()) => {
            result.probe_success = true;
            log("pass", "peer_ready", &format!("target={target_ip}"));
            true
        }
        Err(probe_err) => {
            result.last_probe_err = Some(probe_err.to_string());
            log("warn", "probe_timeout", &probe_err.to_string());
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Deps whose platform/process seams are inert; tests override what
    /// they exercise.
    pub fn inert_deps() -> SessionDeps {
        let mut deps = SessionDeps::new(OverlayBundle::default());
        deps.collect_local_nets = Arc::new(|| Box::pin(async { Ok(Vec::new()) }));
        deps.collect_route_nets = Arc::new(|| Box::pin(async { Ok(Vec::new()) }));
        deps.should_check_route_owner = Arc::new(|| false);
        deps.add_host_route = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        deps.remove_host_route = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        deps.probe_peer_virtual_ip = Arc::new(|_, _, _| Box::pin(async { Ok(()) }));
        deps.route_interface_for_target =
            Arc::new(|_| Box::pin(async { Ok("inert0".to_string()) }));
        deps
    }

    pub fn noop_log() -> DecisionLogFn {
        Arc::new(|_, _, _| {})
    }

    pub fn recording_log() -> (DecisionLogFn, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let log: DecisionLogFn = Arc::new(move |result, reason, detail| {
            sink.lock().unwrap().push(format!("{result}:{reason}:{detail}"));
        });
        (log, lines)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::readiness::{NodeInfo, PeerReadiness};

    fn check_cfg() -> CandidateCheckConfig {
        CandidateCheckConfig {
            max_checks: 3,
            poll_interval: Duration::from_millis(5),
            probe_timeout: Duration::from_millis(5),
            return_on_bootstrap: false,
        }
    }

    fn snapshot_with(readiness: PeerReadiness) -> Snapshot {
        Snapshot {
            at: chrono::Utc::now(),
            node: Some(NodeInfo {
                ipv4_addr: "10.77.0.1/24".into(),
                ..Default::default()
            }),
            peers: Vec::new(),
            readiness,
        }
    }

    /// Wire a deps record whose poller emits from hand-fed channels.
    fn deps_with_channels(
        snapshots: mpsc::Receiver<Snapshot>,
        events: mpsc::Receiver<Event>,
    ) -> SessionDeps {
        let mut deps = inert_deps();
        let channels = Arc::new(Mutex::new(Some((snapshots, events))));
        deps.start_poller = Arc::new(move |_et, _interval, _cancel| {
            channels
                .lock()
                .unwrap()
                .take()
                .expect("poller started twice")
        });
        deps
    }

    fn eval_request(
        deps: SessionDeps,
        stop: CancellationToken,
        log: DecisionLogFn,
    ) -> EvalRequest {
        EvalRequest {
            et: Arc::new(EasyTier::new(OverlayBundle::default(), None)),
            tun_device: "utun9".into(),
            api_port: 8080,
            check_cfg: check_cfg(),
            deps,
            stop,
            log,
        }
    }

    #[tokio::test]
    async fn route_mismatch_is_recorded_but_reachable_candidate_passes() {
        let (snap_tx, snap_rx) = mpsc::channel(4);
        let (_event_tx, event_rx) = mpsc::channel(4);
        let mut deps = deps_with_channels(snap_rx, event_rx);
        deps.should_check_route_owner = Arc::new(|| true);
        deps.route_interface_for_target = Arc::new(|_| Box::pin(async { Ok("en0".to_string()) }));

        snap_tx
            .send(snapshot_with(PeerReadiness {
                ready: true,
                non_self_present: true,
                class: PeerClass::EndpointReady,
                target_ip: "10.77.0.2".into(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let (log, lines) = recording_log();
        let result =
            evaluate_candidate_connectivity(eval_request(deps, CancellationToken::new(), log)).await;

        assert!(result.peer_ready && result.probe_success);
        assert!(!result.route_mismatch_detail.is_empty());
        assert_eq!(result.peer_query_failures, 0);
        assert!(result.host_route_installed);
        let joined = lines.lock().unwrap().join("\n");
        assert!(joined.contains("warn:route_mismatch:"));
        assert!(joined.contains("pass:peer_ready:"));
    }

    #[tokio::test]
    async fn snapshot_error_budget_ends_evaluation() {
        let (_snap_tx, snap_rx) = mpsc::channel(4);
        let (event_tx, event_rx) = mpsc::channel(8);
        let deps = deps_with_channels(snap_rx, event_rx);

        for _ in 0..3 {
            event_tx
                .send(Event {
                    kind: EventKind::SnapshotError,
                    at: chrono::Utc::now(),
                    peer_id: String::new(),
                    peer_class: PeerClass::None,
                    error: Some("snapshot failed".into()),
                })
                .await
                .unwrap();
        }

        let result = evaluate_candidate_connectivity(eval_request(
            deps,
            CancellationToken::new(),
            noop_log(),
        ))
        .await;
        assert!(result.peer_query_failures >= 3);
        assert!(!result.probe_success);
    }

    #[tokio::test]
    async fn process_exit_ends_evaluation_with_probe_error() {
        let (_snap_tx, snap_rx) = mpsc::channel(4);
        let (event_tx, event_rx) = mpsc::channel(8);
        let deps = deps_with_channels(snap_rx, event_rx);

        event_tx
            .send(Event {
                kind: EventKind::ProcessExit,
                at: chrono::Utc::now(),
                peer_id: String::new(),
                peer_class: PeerClass::None,
                error: None,
            })
            .await
            .unwrap();

        let (log, lines) = recording_log();
        let result =
            evaluate_candidate_connectivity(eval_request(deps, CancellationToken::new(), log)).await;
        assert!(result.last_probe_err.is_some());
        assert!(lines.lock().unwrap().join("\n").contains("event_process_exit"));
    }

    #[tokio::test]
    async fn bootstrap_only_snapshot_logs_and_keeps_waiting() {
        let (snap_tx, snap_rx) = mpsc::channel(4);
        let (_event_tx, event_rx) = mpsc::channel(4);
        let deps = deps_with_channels(snap_rx, event_rx);

        snap_tx
            .send(snapshot_with(PeerReadiness {
                ready: false,
                non_self_present: true,
                class: PeerClass::BootstrapOnly,
                peer_id: "123".into(),
                peer_hostname: "PublicServer_Test".into(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let (log, lines) = recording_log();
        let result =
            evaluate_candidate_connectivity(eval_request(deps, CancellationToken::new(), log)).await;
        assert!(result.non_self_present);
        assert_eq!(result.peer_class, PeerClass::BootstrapOnly);
        assert!(!result.peer_ready);
        assert!(lines.lock().unwrap().join("\n").contains("warn:bootstrap_connected:"));
    }

    #[tokio::test]
    async fn stop_interrupts_evaluation() {
        let (_snap_tx, snap_rx) = mpsc::channel(4);
        let (_event_tx, event_rx) = mpsc::channel(4);
        let deps = deps_with_channels(snap_rx, event_rx);
        let stop = CancellationToken::new();
        stop.cancel();

        let result = evaluate_candidate_connectivity(eval_request(deps, stop, noop_log())).await;
        assert!(result.interrupted);
    }

    #[tokio::test]
    async fn eval_window_bounds_the_wait() {
        let cfg = check_cfg();
        let window = candidate_eval_window(&cfg);
        assert_eq!(window, Duration::from_millis(3 * 5 + 3 * 5));
    }

    #[test]
    fn limiter_dedupes_within_ttl_but_events_bypass() {
        let limiter = DecisionLogLimiter::new(Duration::from_secs(60));
        assert!(limiter.should_log("k", "peer_fallback_next"));
        assert!(!limiter.should_log("k", "peer_fallback_next"));
        assert!(limiter.should_log("k2", "peer_fallback_next"));
        assert!(limiter.should_log("k3", "event_peer_added"));
        assert!(limiter.should_log("k3", "event_peer_added"));
    }

    // ---- connect round ----------------------------------------------------

    fn fixed_ranking(peers: &[&str]) -> Arc<dyn Fn(Vec<String>) -> BoxFuture<PeerSelection> + Send + Sync>
    {
        let ordered: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
        Arc::new(move |_pool| {
            let ordered = ordered.clone();
            Box::pin(async move {
                let results = ordered
                    .iter()
                    .enumerate()
                    .map(|(i, peer)| crate::selector::PeerProbeResult {
                        peer: peer.clone(),
                        latency: Duration::from_millis(10 * (i as u64 + 1)),
                        reachable: true,
                        err: None,
                    })
                    .collect();
                PeerSelection { ordered, results }
            })
        })
    }

    /// Deps for connect-round tests: start/wait/interface succeed and the
    /// candidate evaluation is scripted by the caller.
    fn connect_deps(eval: EvalFn) -> SessionDeps {
        let mut deps = inert_deps();
        deps.rank_peers = fixed_ranking(&["tcp://1.1.1.1:11010", "tcp://2.2.2.2:11010"]);
        deps.start_overlay = Arc::new(|_et, _cfg, _opts| Box::pin(async { Ok(()) }));
        deps.wait_for_ip =
            Arc::new(|_et, _timeout| Box::pin(async { Ok("10.10.10.1".to_string()) }));
        deps.interface_by_ipv4 = Arc::new(|_ip| Box::pin(async { Ok("utun9".to_string()) }));
        deps.evaluate_candidate = eval;
        deps
    }

    fn expected_candidates() -> Vec<crate::plan::Ipv4Candidate> {
        crate::plan::choose_candidates("hash", Role::Client, &[])
    }

    #[tokio::test]
    async fn first_peer_start_failure_falls_back_to_second() {
        let started_peers = Arc::new(Mutex::new(Vec::<String>::new()));
        let current_peer = Arc::new(Mutex::new(String::new()));

        let eval_peer = Arc::clone(&current_peer);
        let eval: EvalFn = Arc::new(move |_req| {
            let peer = eval_peer.lock().unwrap().clone();
            Box::pin(async move {
                if peer == "tcp://2.2.2.2:11010" {
                    CandidateCheckResult {
                        peer_ready: true,
                        probe_success: true,
                        target_ip: "10.10.10.2".into(),
                        ..Default::default()
                    }
                } else {
                    CandidateCheckResult {
                        last_probe_err: Some("probe failed".into()),
                        ..Default::default()
                    }
                }
            })
        });

        let mut deps = connect_deps(eval);
        let start_rec = Arc::clone(&started_peers);
        let start_cur = Arc::clone(&current_peer);
        deps.start_overlay = Arc::new(move |_et, cfg, _opts| {
            let head = cfg.peers.first().cloned().unwrap_or_default();
            start_rec.lock().unwrap().push(head.clone());
            *start_cur.lock().unwrap() = head.clone();
            Box::pin(async move {
                if head == "tcp://1.1.1.1:11010" {
                    Err(CoreError::Overlay("start failed".into()))
                } else {
                    Ok(())
                }
            })
        });

        let status = SharedStatus::new();
        let cfg = SessionConfig {
            network_name: "n".into(),
            network_secret: "s".into(),
            peers: vec!["tcp://1.1.1.1:11010".into(), "tcp://2.2.2.2:11010".into()],
        };
        let result = connect_with_peer_fallback(
            &status,
            &cfg,
            Role::Client,
            "hash",
            8080,
            &check_cfg(),
            &deps,
            &|_et| {},
            "",
            &CancellationToken::new(),
            &DecisionLogLimiter::default(),
        )
        .await
        .expect("round should succeed on the second peer");

        assert_eq!(result.selected_peer, "tcp://2.2.2.2:11010");
        assert_eq!(
            started_peers.lock().unwrap().as_slice(),
            ["tcp://1.1.1.1:11010", "tcp://2.2.2.2:11010"]
        );
        // The first candidate subnet is kept when the peer, not the
        // subnet, was at fault.
        assert_eq!(result.baseline.virtual_cidr, expected_candidates()[0].subnet_cidr);
        assert_eq!(result.active_host_route_peer, "10.10.10.2");
    }

    #[tokio::test]
    async fn route_conflict_evidence_switches_subnet() {
        let eval_calls = Arc::new(Mutex::new(0usize));
        let calls = Arc::clone(&eval_calls);
        let eval: EvalFn = Arc::new(move |_req| {
            let call = {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            Box::pin(async move {
                if call == 1 {
                    CandidateCheckResult {
                        route_mismatch_detail: "target=10.30.0.2 route_if=en0 tun_if=utun9".into(),
                        peer_query_failures: 3,
                        ..Default::default()
                    }
                } else {
                    CandidateCheckResult {
                        peer_ready: true,
                        probe_success: true,
                        target_ip: "10.31.0.2".into(),
                        ..Default::default()
                    }
                }
            })
        });

        let mut deps = connect_deps(eval);
        deps.rank_peers = fixed_ranking(&["tcp://1.1.1.1:11010"]);

        let status = SharedStatus::new();
        let cfg = SessionConfig {
            network_name: "n".into(),
            network_secret: "s".into(),
            peers: vec!["tcp://1.1.1.1:11010".into()],
        };
        let result = connect_with_peer_fallback(
            &status,
            &cfg,
            Role::Client,
            "hash",
            8080,
            &check_cfg(),
            &deps,
            &|_et| {},
            "",
            &CancellationToken::new(),
            &DecisionLogLimiter::default(),
        )
        .await
        .expect("round should succeed on the second candidate");

        // The conflict on candidate #1 forced the next subnet.
        assert_eq!(result.baseline.virtual_cidr, expected_candidates()[1].subnet_cidr);
        assert_eq!(*eval_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn exhausted_round_reports_peer_unreachable() {
        let eval: EvalFn = Arc::new(|_req| {
            Box::pin(async {
                CandidateCheckResult {
                    last_probe_err: Some("probe timeout".into()),
                    ..Default::default()
                }
            })
        });
        let deps = connect_deps(eval);

        let status = SharedStatus::new();
        let cfg = SessionConfig {
            network_name: "n".into(),
            network_secret: "s".into(),
            peers: vec!["tcp://1.1.1.1:11010".into(), "tcp://2.2.2.2:11010".into()],
        };
        let failure = connect_with_peer_fallback(
            &status,
            &cfg,
            Role::Client,
            "hash",
            8080,
            &check_cfg(),
            &deps,
            &|_et| {},
            "",
            &CancellationToken::new(),
            &DecisionLogLimiter::default(),
        )
        .await
        .expect_err("round should exhaust");

        match failure {
            ConnectFailure::Failed { code, .. } => assert_eq!(code, ErrorCode::PeerUnreachable),
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_start_error_aborts_whole_round() {
        let eval: EvalFn = Arc::new(|_req| Box::pin(async { CandidateCheckResult::default() }));
        let mut deps = connect_deps(eval);
        deps.start_overlay = Arc::new(|et, _cfg, _opts| {
            Box::pin(async move {
                // The fatal evidence arrives through the process logs.
                let _ = et;
                Err(CoreError::coded(
                    ErrorCode::TunPermissionDenied,
                    "tun device error: operation not permitted",
                ))
            })
        });

        let status = SharedStatus::new();
        let cfg = SessionConfig {
            network_name: "n".into(),
            network_secret: "s".into(),
            peers: vec!["tcp://1.1.1.1:11010".into(), "tcp://2.2.2.2:11010".into()],
        };
        let failure = connect_with_peer_fallback(
            &status,
            &cfg,
            Role::Client,
            "hash",
            8080,
            &check_cfg(),
            &deps,
            &|_et| {},
            "",
            &CancellationToken::new(),
            &DecisionLogLimiter::default(),
        )
        .await
        .expect_err("fatal start error must abort");

        match failure {
            ConnectFailure::Failed { code, .. } => {
                assert_eq!(code, ErrorCode::TunPermissionDenied)
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_prefers_last_successful_subnet() {
        let eval: EvalFn = Arc::new(|_req| {
            Box::pin(async {
                CandidateCheckResult {
                    peer_ready: true,
                    probe_success: true,
                    target_ip: "10.0.0.2".into(),
                    ..Default::default()
                }
            })
        });
        let deps = connect_deps(eval);
        let preferred = expected_candidates()[3].subnet_cidr.clone();

        let status = SharedStatus::new();
        let cfg = SessionConfig {
            network_name: "n".into(),
            network_secret: "s".into(),
            peers: vec!["tcp://1.1.1.1:11010".into()],
        };
        let result = connect_with_peer_fallback(
            &status,
            &cfg,
            Role::Client,
            "hash",
            8080,
            &check_cfg(),
            &deps,
            &|_et| {},
            &preferred,
            &CancellationToken::new(),
            &DecisionLogLimiter::default(),
        )
        .await
        .expect("round should succeed");

        assert_eq!(result.baseline.virtual_cidr, preferred);
    }
}

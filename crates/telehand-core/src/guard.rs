//! Running-phase health guard.
//!
//! Watches the same poller stream the connect round used and decides when
//! steady state has degraded enough to reconnect. The guard never fails a
//! session: its only output is a single-shot reconnect reason.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::overlay::EasyTier;
use crate::poller::EventKind;
use crate::readiness::{PeerClass, PeerReadiness};
use crate::session::{log_candidate_decision, DecisionLogLimiter, SessionDeps};
use crate::status::SharedStatus;
use crate::timing::{
    PEER_REMOVED_BURST_COUNT, PEER_REMOVED_BURST_WINDOW, RUNNING_CONSECUTIVE_FAILED,
    RUNNING_PROBE_TIMEOUT, STATE_POLL_INTERVAL,
};

/// Degradation thresholds for the guard.
#[derive(Debug, Clone)]
pub struct RunningGuardConfig {
    pub consecutive_failed: usize,
    pub probe_timeout: std::time::Duration,
}

impl Default for RunningGuardConfig {
    fn default() -> Self {
        Self {
            consecutive_failed: RUNNING_CONSECUTIVE_FAILED,
            probe_timeout: RUNNING_PROBE_TIMEOUT,
        }
    }
}

/// Reconnect reason for an exited overlay process.
pub const RECONNECT_REASON_PROCESS_EXIT: &str = "easytier process exited";

/// Reconnect reason for chronic probe failure or a peer-removed burst.
pub const RECONNECT_REASON_DEGRADED: &str = "peer_probe_degraded";

struct GuardState {
    failures: usize,
    active_host_route_target: String,
}

/// Run the guard until stop, process exit, or a reconnect request.
///
/// The reconnect channel has capacity 1; repeat requests while one is
/// pending are dropped, so the state machine consumes at most one per
/// round.
#[allow(clippy::too_many_arguments)]
pub async fn run_running_guard(
    status: Arc<SharedStatus>,
    et: Arc<EasyTier>,
    tun_device: String,
    api_port: u16,
    cfg: RunningGuardConfig,
    deps: SessionDeps,
    stop: CancellationToken,
    reconnect: mpsc::Sender<String>,
) {
    let limiter = DecisionLogLimiter::default();
    let poller_cancel = CancellationToken::new();
    let _poller_guard = poller_cancel.clone().drop_guard();
    let (mut snapshots, mut events) =
        (deps.start_poller)(Arc::clone(&et), STATE_POLL_INTERVAL, poller_cancel.clone());

    let mut state = GuardState {
        failures: 0,
        active_host_route_target: String::new(),
    };
    let mut removed_at: VecDeque<Instant> = VecDeque::with_capacity(PEER_REMOVED_BURST_COUNT + 2);

    let log = |result: &str, reason: &str, detail: &str| {
        log_candidate_decision(&status, &limiter, 1, 1, "running", result, reason, detail);
    };
    let request_reconnect = |reason: &str, detail: &str| -> bool {
        log(
            "warn",
            "peer_probe_degraded",
            &format!("reason={reason} detail={detail}"),
        );
        reconnect.try_send(reason.trim().to_string()).is_ok()
    };

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                remove_active_route(&deps, &mut state, &tun_device).await;
                return;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    remove_active_route(&deps, &mut state, &tun_device).await;
                    return;
                };
                match event.kind {
                    EventKind::ProcessExit => {
                        let _ = request_reconnect(RECONNECT_REASON_PROCESS_EXIT, "overlay terminated");
                        remove_active_route(&deps, &mut state, &tun_device).await;
                        return;
                    }
                    EventKind::PeerRemoved => {
                        let now = Instant::now();
                        removed_at.push_back(now);
                        while let Some(front) = removed_at.front() {
                            if now.duration_since(*front) > PEER_REMOVED_BURST_WINDOW {
                                removed_at.pop_front();
                            } else {
                                break;
                            }
                        }
                        if removed_at.len() >= PEER_REMOVED_BURST_COUNT {
                            let detail = format!(
                                "peer_removed burst={} window={:?}",
                                removed_at.len(),
                                PEER_REMOVED_BURST_WINDOW
                            );
                            let _ = request_reconnect(RECONNECT_REASON_DEGRADED, &detail);
                            remove_active_route(&deps, &mut state, &tun_device).await;
                            return;
                        }
                    }
                    EventKind::SnapshotError => {
                        let empty = PeerReadiness::default();
                        if evaluate(&empty, &mut state, &cfg, &deps, &tun_device, api_port, &log, &request_reconnect).await {
                            remove_active_route(&deps, &mut state, &tun_device).await;
                            return;
                        }
                    }
                    _ => {}
                }
            }
            snapshot = snapshots.recv() => {
                let Some(snapshot) = snapshot else {
                    remove_active_route(&deps, &mut state, &tun_device).await;
                    return;
                };
                if evaluate(&snapshot.readiness, &mut state, &cfg, &deps, &tun_device, api_port, &log, &request_reconnect).await {
                    remove_active_route(&deps, &mut state, &tun_device).await;
                    return;
                }
            }
        }
    }
}

async fn remove_active_route(deps: &SessionDeps, state: &mut GuardState, tun_device: &str) {
    if state.active_host_route_target.is_empty() {
        return;
    }
    let target = std::mem::take(&mut state.active_host_route_target);
    if let Err(e) = (deps.remove_host_route)(target, tun_device.to_string()).await {
        debug!(error = %e, "host route removal failed during guard teardown");
    }
}

/// One health evaluation. Returns true when a reconnect was requested and
/// the guard should exit.
#[allow(clippy::too_many_arguments)]
async fn evaluate(
    readiness: &PeerReadiness,
    state: &mut GuardState,
    cfg: &RunningGuardConfig,
    deps: &SessionDeps,
    tun_device: &str,
    api_port: u16,
    log: &impl Fn(&str, &str, &str),
    request_reconnect: &impl Fn(&str, &str) -> bool,
) -> bool {
    let target_ip = readiness.target_ip.trim().to_string();
    let mut failed_reason: Option<(&str, String)> = None;

    if !readiness.ready {
        match readiness.class {
            PeerClass::BootstrapOnly => {
                state.failures = 0;
                log(
                    "warn",
                    "bootstrap_connected",
                    &format!(
                        "bootstrap peer connected id={} hostname={}, business endpoint not ready",
                        readiness.peer_id, readiness.peer_hostname
                    ),
                );
                return false;
            }
            PeerClass::BusinessPeerWaitingIp => {
                state.failures = 0;
                log(
                    "warn",
                    "business_endpoint_waiting",
                    "peer connected but virtual ip not ready",
                );
                return false;
            }
            _ if readiness.non_self_present => {
                state.failures = 0;
                log(
                    "warn",
                    "business_endpoint_waiting",
                    "peer connected but virtual ip not ready",
                );
                return false;
            }
            _ => {
                failed_reason = Some(("peer_query_failed", "peer list empty".to_string()));
            }
        }
    } else {
        // Target moved: swap the host route atomically (remove old, add new).
        if !target_ip.is_empty() && target_ip != state.active_host_route_target {
            if !state.active_host_route_target.is_empty() {
                let old = std::mem::take(&mut state.active_host_route_target);
                let _ = (deps.remove_host_route)(old, tun_device.to_string()).await;
            }
            match (deps.add_host_route)(target_ip.clone(), tun_device.to_string()).await {
                Ok(()) => state.active_host_route_target = target_ip.clone(),
                Err(e) => log("warn", "route_host_add_failed", &e.to_string()),
            }
        }

        if (deps.should_check_route_owner)() && !target_ip.is_empty() {
            match (deps.route_interface_for_target)(target_ip.clone()).await {
                Err(e) => log("warn", "route_check_failed", &e.to_string()),
                Ok(iface) => {
                    if !iface.trim().eq_ignore_ascii_case(tun_device.trim()) {
                        log(
                            "warn",
                            "route_mismatch",
                            &format!(
                                "target={target_ip} route_if={} tun_if={tun_device}",
                                iface.trim()
                            ),
                        );
                    }
                }
            }
        }

        if target_ip.is_empty() {
            failed_reason = Some(("probe_timeout", "target peer virtual ip is empty".to_string()));
        } else if let Err(probe_err) =
            (deps.probe_peer_virtual_ip)(target_ip.clone(), api_port, cfg.probe_timeout).await
        {
            failed_reason = Some(("probe_timeout", probe_err.to_string()));
        }
    }

    let Some((reason, detail)) = failed_reason else {
        state.failures = 0;
        log("pass", "peer_ready", &format!("target={target_ip}"));
        return false;
    };

    state.failures += 1;
    log(
        "warn",
        reason,
        &format!(
            "consecutive_failures={}/{} {detail}",
            state.failures, cfg.consecutive_failed
        ),
    );
    if state.failures < cfg.consecutive_failed {
        return false;
    }

    request_reconnect(RECONNECT_REASON_DEGRADED, &detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::OverlayBundle;
    use crate::poller::Event;
    use crate::readiness::Snapshot;
    use crate::session::test_support::inert_deps;
    use std::sync::Mutex;
    use std::time::Duration;

    fn guard_setup(
        deps: SessionDeps,
    ) -> (
        mpsc::Sender<Snapshot>,
        mpsc::Sender<Event>,
        mpsc::Receiver<String>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (snap_tx, snap_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let channels = Arc::new(Mutex::new(Some((snap_rx, event_rx))));
        let mut deps = deps;
        deps.start_poller = Arc::new(move |_et, _interval, _cancel| {
            channels.lock().unwrap().take().expect("poller started twice")
        });

        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_running_guard(
            SharedStatus::new(),
            Arc::new(EasyTier::new(OverlayBundle::default(), None)),
            "utun9".to_string(),
            8080,
            RunningGuardConfig {
                consecutive_failed: 3,
                probe_timeout: Duration::from_millis(5),
            },
            deps,
            stop.clone(),
            reconnect_tx,
        ));
        (snap_tx, event_tx, reconnect_rx, stop, handle)
    }

    fn peer_removed() -> Event {
        Event {
            kind: EventKind::PeerRemoved,
            at: chrono::Utc::now(),
            peer_id: "p".into(),
            peer_class: PeerClass::None,
            error: None,
        }
    }

    fn ready_snapshot(target: &str) -> Snapshot {
        Snapshot {
            readiness: PeerReadiness {
                ready: true,
                non_self_present: true,
                class: PeerClass::EndpointReady,
                target_ip: target.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn peer_removed_burst_triggers_single_reconnect() {
        let (_snap_tx, event_tx, mut reconnect_rx, _stop, handle) = guard_setup(inert_deps());

        for _ in 0..PEER_REMOVED_BURST_COUNT {
            event_tx.send(peer_removed()).await.unwrap();
        }

        let reason = tokio::time::timeout(Duration::from_secs(2), reconnect_rx.recv())
            .await
            .expect("reconnect within deadline")
            .expect("reconnect reason");
        assert_eq!(reason, RECONNECT_REASON_DEGRADED);
        handle.await.unwrap();
        // Guard exits after requesting; no further requests are possible.
        assert!(reconnect_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn below_burst_threshold_does_not_reconnect() {
        let (_snap_tx, event_tx, mut reconnect_rx, stop, handle) = guard_setup(inert_deps());

        for _ in 0..(PEER_REMOVED_BURST_COUNT - 1) {
            event_tx.send(peer_removed()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reconnect_rx.try_recv().is_err());

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn consecutive_probe_failures_request_reconnect() {
        let mut deps = inert_deps();
        deps.probe_peer_virtual_ip = Arc::new(|_, _, _| {
            Box::pin(async { Err(crate::error::CoreError::Overlay("dial timeout".into())) })
        });
        let (snap_tx, _event_tx, mut reconnect_rx, _stop, handle) = guard_setup(deps);

        for _ in 0..3 {
            snap_tx.send(ready_snapshot("10.0.0.2")).await.unwrap();
        }

        let reason = tokio::time::timeout(Duration::from_secs(2), reconnect_rx.recv())
            .await
            .expect("reconnect within deadline")
            .expect("reconnect reason");
        assert_eq!(reason, RECONNECT_REASON_DEGRADED);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn healthy_probe_resets_failure_counter() {
        let failures = Arc::new(Mutex::new(vec![
            Err("down".to_string()),
            Err("down".to_string()),
            Ok(()),
            Err("down".to_string()),
            Err("down".to_string()),
        ]));
        let mut deps = inert_deps();
        let script = Arc::clone(&failures);
        deps.probe_peer_virtual_ip = Arc::new(move |_, _, _| {
            let next = {
                let mut script = script.lock().unwrap();
                if script.is_empty() {
                    Ok(())
                } else {
                    script.remove(0)
                }
            };
            Box::pin(async move {
                next.map_err(crate::error::CoreError::Overlay)
            })
        });
        let (snap_tx, _event_tx, mut reconnect_rx, stop, handle) = guard_setup(deps);

        for _ in 0..5 {
            snap_tx.send(ready_snapshot("10.0.0.2")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Two failures, a success, two failures: the counter never reached
        // three in a row.
        assert!(reconnect_rx.try_recv().is_err());

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn process_exit_requests_reconnect_with_exit_reason() {
        let (_snap_tx, event_tx, mut reconnect_rx, _stop, handle) = guard_setup(inert_deps());

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

        let reason = tokio::time::timeout(Duration::from_secs(2), reconnect_rx.recv())
            .await
            .expect("reconnect within deadline")
            .expect("reconnect reason");
        assert_eq!(reason, RECONNECT_REASON_PROCESS_EXIT);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn target_change_swaps_host_route() {
        let added = Arc::new(Mutex::new(Vec::<String>::new()));
        let removed = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut deps = inert_deps();
        let added_rec = Arc::clone(&added);
        deps.add_host_route = Arc::new(move |ip, _dev| {
            added_rec.lock().unwrap().push(ip);
            Box::pin(async { Ok(()) })
        });
        let removed_rec = Arc::clone(&removed);
        deps.remove_host_route = Arc::new(move |ip, _dev| {
            removed_rec.lock().unwrap().push(ip);
            Box::pin(async { Ok(()) })
        });

        let (snap_tx, _event_tx, _reconnect_rx, stop, handle) = guard_setup(deps);
        snap_tx.send(ready_snapshot("10.0.0.2")).await.unwrap();
        snap_tx.send(ready_snapshot("10.0.0.3")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        handle.await.unwrap();

        assert_eq!(added.lock().unwrap().as_slice(), ["10.0.0.2", "10.0.0.3"]);
        // Old target removed on swap, new one removed at guard teardown.
        assert_eq!(removed.lock().unwrap().as_slice(), ["10.0.0.2", "10.0.0.3"]);
    }
}

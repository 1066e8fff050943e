//! Top-level session loop.
//!
//! Owns the two HTTP servers, drains the pairing submission channel, runs
//! connect rounds, and supervises the running phase until stop or a
//! guard-issued reconnect. Resources are released LIFO on every exit
//! path: host route, then supervisor, then poller contexts, then servers.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use telehand_core::guard::RECONNECT_REASON_DEGRADED;
use telehand_core::peer_pool::runtime_peer_pool;
use telehand_core::session::{DecisionLogLimiter, SessionDeps};
use telehand_core::status::PeerInfoFn;
use telehand_core::timing::PEER_INFO_REFRESH_INTERVAL;
use telehand_core::{
    compute_network_hash, connect_with_peer_fallback, format_connect_error, mask_secret,
    network_owner_from_name, peer_info_snapshot, run_running_guard, CandidateCheckConfig,
    ConnectFailure, CoreError, EasyTier, ErrorCode, InstallCommand, OverlayBundle,
    PeerInfoSnapshot, Phase, Role, RunningGuardConfig, SessionConfig, SharedStatus,
    EXIT_CODE_NETWORK, EXIT_CODE_OK, EXIT_CODE_PARAM, EXIT_CODE_SERVICE,
};
use telehand_server::{ApiServer, GuiServer, Ports};

use crate::platform_util;

pub struct SessionOptions {
    pub role: Role,
    pub no_browser: bool,
    pub encoded_config: String,
    pub commands: Vec<InstallCommand>,
    pub clipboard_command: String,
}

struct RuntimeShared {
    overlay: Option<Arc<EasyTier>>,
    network_owner: String,
    network_hash: String,
}

/// Run a full session; returns the process exit code.
pub async fn run_session(opts: SessionOptions, bundle: OverlayBundle) -> i32 {
    let role = opts.role;
    let status = SharedStatus::new();
    status.update_state(|state| {
        state.phase = Phase::Config;
        state.role = role.as_str().to_string();
        state.commands = opts.commands.clone();
        state.clipboard_command = opts.clipboard_command.clone();
    });
    status.set_precheck(Arc::new(connect_precheck));

    let runtime = Arc::new(RwLock::new(RuntimeShared {
        overlay: None,
        network_owner: String::new(),
        network_hash: String::new(),
    }));
    status.set_peer_info_provider(Some(peer_info_provider(Arc::clone(&runtime), role)));

    let ports = Arc::new(Ports::default());
    let api = match ApiServer::start("0.0.0.0", 8080, Arc::clone(&status), Arc::clone(&ports)).await
    {
        Ok(api) => api,
        Err(e) => {
            error!("Failed to start API server: {e}");
            return EXIT_CODE_SERVICE;
        }
    };
    let api_port = api.port();
    println!("API server started at http://0.0.0.0:{api_port}");

    let gui = match GuiServer::start(18080, Arc::clone(&status), Arc::clone(&ports)).await {
        Ok(gui) => gui,
        Err(e) => {
            error!("Failed to start GUI: {e}");
            api.stop();
            return EXIT_CODE_SERVICE;
        }
    };
    let gui_url = format!("http://127.0.0.1:{}", gui.port());
    println!("GUI started at {gui_url}");
    status.update_state(|state| state.api_port = api_port);

    let mut cli_only = opts.no_browser;
    if !opts.no_browser {
        if let Err(e) = platform_util::open_browser(&gui_url) {
            warn!("No browser detected, fallback to CLI mode: {e}");
            cli_only = true;
        }
    } else {
        println!("Browser auto-open disabled; running in CLI mode.");
    }
    if cli_only {
        println!("CLI mode: state/debug information will be printed to stdout/stderr.");
    }

    if !opts.encoded_config.trim().is_empty() {
        if let Err(e) = status.submit_encoded_config(&opts.encoded_config) {
            error!("Invalid config code: {e}");
            api.stop();
            gui.stop();
            return EXIT_CODE_PARAM;
        }
    }

    let Some(mut cfg) = status.wait_for_config().await else {
        println!("Stopped by user.");
        api.stop();
        gui.stop();
        return EXIT_CODE_OK;
    };

    cfg.peers = runtime_peer_pool(&cfg.peers);
    if cfg.peers.is_empty() {
        let code = ErrorCode::PeerUnreachable;
        let msg = format_connect_error(
            code,
            &CoreError::coded(code, "no available peers after normalization"),
        );
        set_session_error(&status, api_port, code, &msg);
        error!("{msg}");
        api.stop();
        gui.stop();
        return code.exit_code(EXIT_CODE_NETWORK);
    }

    println!(
        "Network ready: name={} secret={} peers={}",
        cfg.network_name,
        mask_secret(&cfg.network_secret),
        cfg.peers.join(",")
    );
    println!("State: initializing -> connecting ({role})");

    let network_owner = network_owner_from_name(&cfg.network_name);
    let network_hash = compute_network_hash(&cfg.network_name, &cfg.network_secret);
    status.update_state(|state| {
        state.network_owner = network_owner.clone();
        state.network_hash = network_hash.clone();
        state.endpoint_status = "Connecting to the business endpoint...".into();
    });
    {
        let mut runtime = runtime.write().expect("runtime lock");
        runtime.network_owner = network_owner.clone();
        runtime.network_hash = network_hash.clone();
    }

    let deps = SessionDeps::new(bundle);
    let check_cfg = CandidateCheckConfig::default();
    let limiter = DecisionLogLimiter::default();

    let stop = CancellationToken::new();
    spawn_stop_watchers(&status, &stop);

    let set_runtime_overlay = {
        let runtime = Arc::clone(&runtime);
        move |et: Option<Arc<EasyTier>>| {
            runtime.write().expect("runtime lock").overlay = et;
        }
    };

    let mut preferred_subnet = String::new();
    loop {
        if stop.is_cancelled() {
            println!("State: stopping");
            api.stop();
            set_runtime_overlay(None);
            gui.stop();
            return EXIT_CODE_OK;
        }

        let round = connect_with_peer_fallback(
            &status,
            &cfg,
            role,
            &network_hash,
            api_port,
            &check_cfg,
            &deps,
            &set_runtime_overlay,
            &preferred_subnet,
            &stop,
            &limiter,
        )
        .await;

        let result = match round {
            Ok(result) => result,
            Err(ConnectFailure::Interrupted) => {
                println!("State: stopping");
                api.stop();
                set_runtime_overlay(None);
                gui.stop();
                return EXIT_CODE_OK;
            }
            Err(ConnectFailure::Failed { code, error }) => {
                let msg = format_connect_error(code, &error);
                set_session_error(&status, api_port, code, &msg);
                error!("{msg}");
                api.stop();
                gui.stop();
                return code.exit_code(EXIT_CODE_NETWORK);
            }
        };

        let active_et = Arc::clone(&result.et);
        let active_host_route_target = result.active_host_route_peer.clone();
        let baseline = result.baseline.clone();
        preferred_subnet.clear();

        println!("EasyTier virtual IP: {}", result.virt_ip);
        println!(
            "Session baseline: tun_device={} virtual_subnet={} network_hash={}",
            baseline.tun_device, baseline.virtual_cidr, baseline.network_hash
        );
        status.update_state(|state| {
            state.phase = Phase::Running;
            state.virt_ip = result.virt_ip.clone();
            state.tun_device = baseline.tun_device.clone();
            state.virtual_subnet = baseline.virtual_cidr.clone();
            state.current_peer = result.selected_peer.clone();
            state.endpoint_status = "Connected".into();
            state.error.clear();
            state.error_code.clear();
        });
        println!("State: connecting -> running");
        println!("API server reachable at http://{}:{api_port}", result.virt_ip);
        let guard_cfg = RunningGuardConfig::default();
        println!(
            "State guard: threshold={} consecutive failures",
            guard_cfg.consecutive_failed
        );

        let peer_print_stop = CancellationToken::new();
        spawn_peer_info_printer(&status, &peer_print_stop);

        let guard_stop = CancellationToken::new();
        let (reconnect_tx, mut reconnect_rx) = mpsc::channel::<String>(1);
        tokio::spawn(run_running_guard(
            Arc::clone(&status),
            Arc::clone(&active_et),
            baseline.tun_device.clone(),
            api_port,
            guard_cfg,
            deps.clone(),
            guard_stop.clone(),
            reconnect_tx,
        ));

        let reconnect_reason = tokio::select! {
            _ = stop.cancelled() => None,
            reason = reconnect_rx.recv() => reason,
        };

        guard_stop.cancel();
        peer_print_stop.cancel();
        if !active_host_route_target.is_empty() {
            let _ = (deps.remove_host_route)(
                active_host_route_target.clone(),
                baseline.tun_device.clone(),
            )
            .await;
        }
        active_et.stop().await;
        set_runtime_overlay(None);

        let Some(reason) = reconnect_reason else {
            println!("State: stopping");
            api.stop();
            gui.stop();
            let final_state = status.state();
            if final_state.phase == Phase::Error && !final_state.error_code.is_empty() {
                if let Some(code) = error_code_from_wire(&final_state.error_code) {
                    return code.exit_code(EXIT_CODE_NETWORK);
                }
                return EXIT_CODE_NETWORK;
            }
            return EXIT_CODE_OK;
        };

        let reason = if reason.trim().is_empty() {
            RECONNECT_REASON_DEGRADED.to_string()
        } else {
            reason
        };
        preferred_subnet = baseline.virtual_cidr.clone();
        status.update_state(|state| {
            state.phase = Phase::Connecting;
            state.virt_ip.clear();
            state.current_peer.clear();
            state.last_switch_reason = reason.clone();
            state.endpoint_status = "Connection degraded, reconnecting...".into();
            state.error.clear();
            state.error_code.clear();
        });
        let msg =
            format!("[telehand] reconnect requested reason={reason}; fallback peers first then subnet");
        status.add_debug_log(&msg);
        info!("{msg}");
    }
}

/// Cancel the stop token on SIGINT/SIGTERM or a GUI stop request.
fn spawn_stop_watchers(status: &Arc<SharedStatus>, stop: &CancellationToken) {
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_stop.cancel();
        }
    });

    #[cfg(unix)]
    {
        let term_stop = stop.clone();
        tokio::spawn(async move {
            let Ok(mut term) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            else {
                return;
            };
            term.recv().await;
            term_stop.cancel();
        });
    }

    let gui_status = Arc::clone(status);
    let gui_stop = stop.clone();
    tokio::spawn(async move {
        // A later nil submission is the GUI stop button.
        if gui_status.wait_for_config().await.is_none() {
            gui_stop.cancel();
        }
    });
}

fn peer_info_provider(runtime: Arc<RwLock<RuntimeShared>>, role: Role) -> PeerInfoFn {
    Arc::new(move || {
        let (overlay, owner, hash) = {
            let runtime = runtime.read().expect("runtime lock");
            (
                runtime.overlay.clone(),
                runtime.network_owner.clone(),
                runtime.network_hash.clone(),
            )
        };
        Box::pin(async move {
            let Some(et) = overlay else {
                return Ok(PeerInfoSnapshot {
                    updated_at: chrono_now_rfc3339(),
                    network_owner: owner,
                    network_hash: hash,
                    peers: Vec::new(),
                });
            };
            let node = et.query_node_info().await?;
            let peers = et.query_peer_list().await?;
            let mut snapshot = peer_info_snapshot(&node, &peers, role);
            snapshot.network_owner = owner;
            snapshot.network_hash = hash;
            Ok(snapshot)
        })
    })
}

fn chrono_now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Periodically print the peer table to stdout while running.
fn spawn_peer_info_printer(status: &Arc<SharedStatus>, stop: &CancellationToken) {
    let status = Arc::clone(status);
    let stop = stop.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PEER_INFO_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(provider) = status.peer_info_provider() else { continue };
            match provider().await {
                Ok(snapshot) if !snapshot.peers.is_empty() => print_peer_snapshot(&snapshot),
                Ok(_) => {}
                Err(e) => warn!("Peer info update failed: {e}"),
            }
        }
    });
}

fn print_peer_snapshot(snapshot: &PeerInfoSnapshot) {
    let mut title = "Peer Info".to_string();
    let owner = snapshot.network_owner.trim();
    let hash = snapshot.network_hash.trim();
    if !owner.is_empty() && !hash.is_empty() {
        title.push_str(&format!(" ({owner}:{hash})"));
    } else if !hash.is_empty() {
        title.push_str(&format!(" ({hash})"));
    }
    println!("\n{title} ({})", snapshot.updated_at);
    println!(
        "{:<16} {:<20} {:<10} {:<9} {:<9} {:<10} {:<10} {:<9} {:<10} {:<7} {}",
        "Virtual IPv4",
        "Hostname",
        "Route Cost",
        "Protocol",
        "Latency",
        "Upload",
        "Download",
        "Loss Rate",
        "Version",
        "Role",
        "Local"
    );
    for p in &snapshot.peers {
        println!(
            "{:<16} {:<20} {:<10} {:<9} {:<9} {:<10} {:<10} {:<9} {:<10} {:<7} {}",
            p.virtual_ipv4,
            p.hostname,
            p.route_cost,
            p.protocol,
            p.latency,
            p.upload,
            p.download,
            p.loss_rate,
            p.version,
            p.role,
            if p.is_self { "*" } else { "" }
        );
    }
}

fn set_session_error(status: &SharedStatus, api_port: u16, code: ErrorCode, msg: &str) {
    status.update_state(|state| {
        state.phase = Phase::Error;
        state.api_port = api_port;
        state.error = msg.to_string();
        state.error_code = code.as_str().to_string();
    });
}

/// Pre-connect validation: Windows requires elevation for the adapter.
fn connect_precheck(_cfg: &SessionConfig) -> Result<(), CoreError> {
    if !cfg!(windows) {
        return Ok(());
    }
    match platform_util::is_current_user_admin() {
        Ok(true) => Ok(()),
        Ok(false) => Err(CoreError::coded(
            ErrorCode::WindowsNotAdmin,
            "administrator privileges required on Windows; please run telehand as administrator",
        )),
        Err(e) => Err(CoreError::coded(
            ErrorCode::WindowsAdminCheckFailed,
            format!("failed to check administrator privilege: {e}"),
        )),
    }
}

fn error_code_from_wire(code: &str) -> Option<ErrorCode> {
    use ErrorCode::*;
    let all = [
        WindowsNotAdmin,
        WindowsAdminCheckFailed,
        WindowsTunInitFailed,
        WindowsFirewallBlocked,
        EasytierStartFailed,
        EasytierIpTimeout,
        TunPermissionDenied,
        ConfigExpired,
        AuthFailed,
        PeerUnreachable,
        RouteConflictDetected,
    ];
    all.into_iter().find(|c| c.as_str() == code)
}

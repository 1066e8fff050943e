//! Shared session status.
//!
//! One `SharedStatus` is created per process and handed to the state
//! machine and both HTTP servers. A single reader/writer lock guards the
//! phase struct (reads dominate, writes are short and never held across
//! await points), log rings are independent mutexes, and pairing
//! submission is a capacity-1 channel drained by the session loop.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{decode_config_with_validation, SessionConfig};
use crate::error::{CoreError, CoreResult};
use crate::plan::Role;
use crate::readiness::{strip_cidr, NodeInfo, PeerEntry};

const DEBUG_LOG_CAPACITY: usize = 2000;
const CMD_LOG_CAPACITY: usize = 1000;

/// Session phase, as published to `/health` and the GUI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Config,
    Connecting,
    Running,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Config => "config",
            Phase::Connecting => "connecting",
            Phase::Running => "running",
            Phase::Error => "error",
        }
    }
}

/// Ready-to-paste install/run command for the remote machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallCommand {
    pub platform: String,
    pub command: String,
}

/// Everything the status surfaces display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusState {
    pub phase: Phase,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub role: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub network_owner: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub network_hash: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub tun_device: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub virtual_subnet: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub virt_ip: String,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub api_port: u16,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub current_peer: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub last_switch_reason: String,
    /// Human status line for the pairing page.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub endpoint_status: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub error_code: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub clipboard_command: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub commands: Vec<InstallCommand>,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

/// One control-API request, as shown in the GUI activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdLog {
    pub time: String,
    pub method: String,
    pub path: String,
    pub summary: String,
}

impl CmdLog {
    pub fn now(method: &str, path: &str, summary: impl Into<String>) -> Self {
        Self {
            time: Utc::now().format("%H:%M:%S").to_string(),
            method: method.to_string(),
            path: path.to_string(),
            summary: summary.into(),
        }
    }
}

/// Display row of the peer-info table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerInfoRow {
    pub virtual_ipv4: String,
    pub hostname: String,
    pub route_cost: String,
    pub protocol: String,
    pub latency: String,
    pub upload: String,
    pub download: String,
    pub loss_rate: String,
    pub version: String,
    pub role: String,
    pub is_self: bool,
}

/// Peer table plus the network identity it belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerInfoSnapshot {
    pub updated_at: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub network_owner: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub network_hash: String,
    pub peers: Vec<PeerInfoRow>,
}

/// Role column value: only the self row shows the session role.
pub fn displayed_role_for_peer(is_self: bool, role: Role) -> String {
    if !is_self {
        return "-".to_string();
    }
    match role {
        Role::Client => "Client".to_string(),
        Role::Server => "Server".to_string(),
    }
}

/// Build the display table from one node + peer-list read.
pub fn peer_info_snapshot(node: &NodeInfo, peers: &[PeerEntry], role: Role) -> PeerInfoSnapshot {
    let mut rows = Vec::with_capacity(peers.len() + 1);
    rows.push(PeerInfoRow {
        virtual_ipv4: strip_cidr(&node.ipv4_addr).to_string(),
        hostname: node.hostname.clone(),
        route_cost: "local".into(),
        version: node.version.clone(),
        role: displayed_role_for_peer(true, role),
        is_self: true,
        ..Default::default()
    });
    for peer in peers {
        if !node.peer_id.is_empty() && peer.id == node.peer_id {
            continue;
        }
        rows.push(PeerInfoRow {
            virtual_ipv4: strip_cidr(&peer.ipv4).to_string(),
            hostname: peer.hostname.clone(),
            route_cost: peer.cost.clone(),
            protocol: peer.tunnel_proto.clone(),
            latency: peer.lat_ms.clone(),
            upload: peer.tx_bytes.clone(),
            download: peer.rx_bytes.clone(),
            loss_rate: peer.loss_rate.clone(),
            version: peer.version.clone(),
            role: displayed_role_for_peer(false, role),
            is_self: false,
        });
    }
    PeerInfoSnapshot {
        updated_at: Utc::now().to_rfc3339(),
        peers: rows,
        ..Default::default()
    }
}

/// Why a pairing submission was rejected.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("config already pending")]
    ConfigPending,
    #[error("already connecting")]
    AlreadyConnecting,
    #[error("already running")]
    AlreadyRunning,
    #[error(transparent)]
    Invalid(#[from] CoreError),
}

impl SubmitError {
    /// Taxonomy code carried by the underlying error, if any.
    pub fn code(&self) -> Option<crate::error::ErrorCode> {
        match self {
            SubmitError::Invalid(err) => err.code(),
            _ => None,
        }
    }

    /// Whether the rejection is a state conflict (HTTP 409) rather than a
    /// bad request.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SubmitError::ConfigPending | SubmitError::AlreadyConnecting | SubmitError::AlreadyRunning
        )
    }
}

/// Async peer-info provider installed by the session while an overlay runs.
pub type PeerInfoFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = CoreResult<PeerInfoSnapshot>> + Send>> + Send + Sync,
>;

/// Pre-submit validation hook (the Windows admin check lives here).
pub type PrecheckFn = Arc<dyn Fn(&SessionConfig) -> Result<(), CoreError> + Send + Sync>;

/// Shared status hub.
pub struct SharedStatus {
    state: RwLock<StatusState>,
    cmd_logs: Mutex<VecDeque<CmdLog>>,
    debug_logs: Mutex<VecDeque<String>>,
    config_tx: mpsc::Sender<Option<SessionConfig>>,
    config_rx: tokio::sync::Mutex<mpsc::Receiver<Option<SessionConfig>>>,
    peer_info_fn: RwLock<Option<PeerInfoFn>>,
    precheck: RwLock<Option<PrecheckFn>>,
}

impl SharedStatus {
    pub fn new() -> Arc<Self> {
        let (config_tx, config_rx) = mpsc::channel(1);
        Arc::new(Self {
            state: RwLock::new(StatusState::default()),
            cmd_logs: Mutex::new(VecDeque::with_capacity(CMD_LOG_CAPACITY)),
            debug_logs: Mutex::new(VecDeque::with_capacity(DEBUG_LOG_CAPACITY)),
            config_tx,
            config_rx: tokio::sync::Mutex::new(config_rx),
            peer_info_fn: RwLock::new(None),
            precheck: RwLock::new(None),
        })
    }

    pub fn state(&self) -> StatusState {
        self.state.read().expect("state lock").clone()
    }

    pub fn set_state(&self, state: StatusState) {
        *self.state.write().expect("state lock") = state;
    }

    /// Read-modify-write under the single writer lock.
    pub fn update_state<F: FnOnce(&mut StatusState)>(&self, apply: F) {
        let mut state = self.state.write().expect("state lock");
        apply(&mut state);
    }

    /// Apply only while the phase still matches; connect-progress updates
    /// must not clobber a concurrent stop or error transition.
    pub fn update_state_in_phase<F: FnOnce(&mut StatusState)>(&self, phase: Phase, apply: F) {
        let mut state = self.state.write().expect("state lock");
        if state.phase == phase {
            apply(&mut state);
        }
    }

    pub fn add_cmd_log(&self, log: CmdLog) {
        let mut logs = self.cmd_logs.lock().expect("cmd log lock");
        if logs.len() >= CMD_LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(log);
    }

    pub fn cmd_logs(&self) -> Vec<CmdLog> {
        self.cmd_logs.lock().expect("cmd log lock").iter().cloned().collect()
    }

    pub fn add_debug_log(&self, line: impl Into<String>) {
        let mut logs = self.debug_logs.lock().expect("debug log lock");
        if logs.len() >= DEBUG_LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(line.into());
    }

    pub fn debug_logs(&self) -> Vec<String> {
        self.debug_logs.lock().expect("debug log lock").iter().cloned().collect()
    }

    pub fn set_peer_info_provider(&self, provider: Option<PeerInfoFn>) {
        *self.peer_info_fn.write().expect("peer info lock") = provider;
    }

    pub fn peer_info_provider(&self) -> Option<PeerInfoFn> {
        self.peer_info_fn.read().expect("peer info lock").clone()
    }

    pub fn set_precheck(&self, precheck: PrecheckFn) {
        *self.precheck.write().expect("precheck lock") = Some(precheck);
    }

    /// Decode and enqueue a pairing code for the session loop.
    ///
    /// Rejected while a submission is pending or a session is already
    /// connecting/running; a failed precheck parks the state in `error`.
    pub fn submit_encoded_config(&self, encoded: &str) -> Result<(), SubmitError> {
        let cfg = decode_config_with_validation(encoded)?;
        self.submit_config(cfg)
    }

    pub fn submit_config(&self, cfg: SessionConfig) -> Result<(), SubmitError> {
        match self.state().phase {
            Phase::Connecting => return Err(SubmitError::AlreadyConnecting),
            Phase::Running => return Err(SubmitError::AlreadyRunning),
            _ => {}
        }

        let precheck = self.precheck.read().expect("precheck lock").clone();
        if let Some(precheck) = precheck {
            if let Err(err) = precheck(&cfg) {
                let code = err.code().map(|c| c.as_str().to_string()).unwrap_or_default();
                self.update_state(|state| {
                    state.phase = Phase::Error;
                    state.virt_ip.clear();
                    state.error = err.to_string();
                    state.error_code = code;
                });
                return Err(SubmitError::Invalid(err));
            }
        }

        match self.config_tx.try_send(Some(cfg)) {
            Ok(()) => {
                self.update_state(|state| {
                    state.phase = Phase::Connecting;
                    state.virt_ip.clear();
                    state.error.clear();
                    state.error_code.clear();
                });
                Ok(())
            }
            Err(_) => Err(SubmitError::ConfigPending),
        }
    }

    /// Block until the next submission. `None` means user stop.
    pub async fn wait_for_config(&self) -> Option<SessionConfig> {
        let mut rx = self.config_rx.lock().await;
        rx.recv().await.flatten()
    }

    /// Enqueue a user stop. Dropped silently if a submission is pending —
    /// the session loop observes its stop signal anyway.
    pub fn request_stop(&self) {
        let _ = self.config_tx.try_send(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_sample() -> String {
        SessionConfig {
            network_name: "telehand:abc".into(),
            network_secret: "secret1".into(),
            peers: vec!["tcp://1.1.1.1:11010".into()],
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn submit_then_wait_round_trip() {
        let status = SharedStatus::new();
        status.submit_encoded_config(&encoded_sample()).unwrap();
        assert_eq!(status.state().phase, Phase::Connecting);
        let cfg = status.wait_for_config().await.unwrap();
        assert_eq!(cfg.network_name, "telehand:abc");
    }

    #[test]
    fn duplicate_submit_is_config_pending() {
        let status = SharedStatus::new();
        status.submit_encoded_config(&encoded_sample()).unwrap();
        // Reset the phase so only the full channel blocks the second submit.
        status.update_state(|s| s.phase = Phase::Config);
        let err = status.submit_encoded_config(&encoded_sample()).unwrap_err();
        assert!(matches!(err, SubmitError::ConfigPending));
        assert!(err.is_conflict());
    }

    #[test]
    fn submit_rejected_while_connecting_or_running() {
        let status = SharedStatus::new();
        status.update_state(|s| s.phase = Phase::Connecting);
        assert!(matches!(
            status.submit_encoded_config(&encoded_sample()),
            Err(SubmitError::AlreadyConnecting)
        ));
        status.update_state(|s| s.phase = Phase::Running);
        assert!(matches!(
            status.submit_encoded_config(&encoded_sample()),
            Err(SubmitError::AlreadyRunning)
        ));
    }

    #[test]
    fn failed_precheck_parks_error_state() {
        let status = SharedStatus::new();
        status.set_precheck(Arc::new(|_cfg| {
            Err(CoreError::coded(
                crate::error::ErrorCode::WindowsNotAdmin,
                "administrator privileges required",
            ))
        }));
        let err = status.submit_encoded_config(&encoded_sample()).unwrap_err();
        assert!(!err.is_conflict());
        let state = status.state();
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(state.error_code, "windows_not_admin");
    }

    #[tokio::test]
    async fn stop_wakes_waiter_with_none() {
        let status = SharedStatus::new();
        status.request_stop();
        assert!(status.wait_for_config().await.is_none());
    }

    #[test]
    fn phase_scoped_update_skips_on_mismatch() {
        let status = SharedStatus::new();
        status.update_state_in_phase(Phase::Connecting, |s| s.virt_ip = "10.0.0.1".into());
        assert!(status.state().virt_ip.is_empty());
    }

    #[test]
    fn self_row_shows_session_role() {
        assert_eq!(displayed_role_for_peer(false, Role::Client), "-");
        assert_eq!(displayed_role_for_peer(true, Role::Client), "Client");
        assert_eq!(displayed_role_for_peer(true, Role::Server), "Server");
    }

    #[test]
    fn peer_table_marks_self_and_strips_cidr() {
        let node = NodeInfo {
            peer_id: "1".into(),
            hostname: "me".into(),
            ipv4_addr: "10.0.0.1/24".into(),
            version: "2.1.0".into(),
        };
        let peers = vec![
            PeerEntry {
                id: "1".into(),
                hostname: "me".into(),
                ipv4: "10.0.0.1/24".into(),
                ..Default::default()
            },
            PeerEntry {
                id: "2".into(),
                hostname: "laptop".into(),
                ipv4: "10.0.0.2/24".into(),
                ..Default::default()
            },
        ];
        let snapshot = peer_info_snapshot(&node, &peers, Role::Server);
        assert_eq!(snapshot.peers.len(), 2);
        assert!(snapshot.peers[0].is_self);
        assert_eq!(snapshot.peers[0].virtual_ipv4, "10.0.0.1");
        assert_eq!(snapshot.peers[0].role, "Server");
        assert_eq!(snapshot.peers[1].virtual_ipv4, "10.0.0.2");
        assert_eq!(snapshot.peers[1].role, "-");
    }

    #[test]
    fn log_rings_stay_bounded() {
        let status = SharedStatus::new();
        for i in 0..(DEBUG_LOG_CAPACITY + 5) {
            status.add_debug_log(format!("line {i}"));
        }
        assert_eq!(status.debug_logs().len(), DEBUG_LOG_CAPACITY);
    }
}

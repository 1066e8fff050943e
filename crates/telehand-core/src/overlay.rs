//! EasyTier process supervisor.
//!
//! Owns exactly one overlay process and its scratch directory. The overlay
//! core and CLI executables arrive as opaque byte blobs, get written into
//! a fresh temp dir, and the core is spawned against a loopback RPC port.
//! Merged stdout/stderr is kept in a bounded ring, secret-redacted before
//! storage or emission.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::config::{sanitize_sensitive_log, SessionConfig};
use crate::error::{classify_error, CoreError, CoreResult, ErrorCode};
use crate::readiness::{build_snapshot, NodeInfo, PeerEntry, Snapshot};
use crate::timing::CLI_QUERY_TIMEOUT;

/// Lines kept in the in-memory overlay log ring.
const LOG_RING_CAPACITY: usize = 2000;

/// Cadence of the virtual-IP wait loop.
const WAIT_IP_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Opaque executables and runtime shims supplied by the host environment.
#[derive(Clone, Default)]
pub struct OverlayBundle {
    pub core: Vec<u8>,
    pub cli: Vec<u8>,
    /// Windows runtime shims, placed next to the binaries when present.
    pub packet_dll: Vec<u8>,
    pub wintun_dll: Vec<u8>,
}

impl OverlayBundle {
    /// Load the bundle from a directory laid out by the installer:
    /// `easytier-core[.exe]`, `easytier-cli[.exe]`, plus the Windows DLLs.
    pub fn from_dir(dir: &std::path::Path) -> CoreResult<Self> {
        let (core_name, cli_name) = binary_names();
        let core = std::fs::read(dir.join(core_name)).map_err(|e| {
            CoreError::Overlay(format!("read {core_name} from {}: {e}", dir.display()))
        })?;
        let cli = std::fs::read(dir.join(cli_name)).map_err(|e| {
            CoreError::Overlay(format!("read {cli_name} from {}: {e}", dir.display()))
        })?;
        let packet_dll = std::fs::read(dir.join("Packet.dll")).unwrap_or_default();
        let wintun_dll = std::fs::read(dir.join("wintun.dll")).unwrap_or_default();
        Ok(Self {
            core,
            cli,
            packet_dll,
            wintun_dll,
        })
    }
}

fn binary_names() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("easytier-core.exe", "easytier-cli.exe")
    } else {
        ("easytier-core", "easytier-cli")
    }
}

/// Spawn options beyond the session config.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Explicit local address (`10.x.y.z/24`); DHCP when absent.
    pub ipv4_cidr: Option<String>,
}

/// Callback invoked for every (sanitized) overlay log line.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

struct ProcessState {
    child: Option<Child>,
    scratch: Option<TempDir>,
    cli_bin: Option<PathBuf>,
}

/// Supervisor for one overlay process.
pub struct EasyTier {
    rpc_port: u16,
    secret: Mutex<String>,
    logs: Mutex<VecDeque<String>>,
    on_log: Option<LogSink>,
    process: tokio::sync::Mutex<ProcessState>,
    virt_ip: Mutex<Option<String>>,
    bundle: OverlayBundle,
}

impl std::fmt::Debug for EasyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EasyTier")
            .field("rpc_port", &self.rpc_port)
            .finish()
    }
}

impl EasyTier {
    pub fn new(bundle: OverlayBundle, on_log: Option<LogSink>) -> Self {
        Self {
            rpc_port: allocate_rpc_port(),
            secret: Mutex::new(String::new()),
            logs: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
            on_log,
            process: tokio::sync::Mutex::new(ProcessState {
                child: None,
                scratch: None,
                cli_bin: None,
            }),
            virt_ip: Mutex::new(None),
            bundle,
        }
    }

    /// Loopback RPC port this supervisor's overlay listens on.
    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    /// Last virtual IP observed by `wait_for_ip`.
    pub fn virt_ip(&self) -> Option<String> {
        self.virt_ip.lock().expect("virt_ip lock").clone()
    }

    /// Copy of the captured log ring.
    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().expect("log lock").iter().cloned().collect()
    }

    fn push_log(&self, line: &str) {
        let secret = self.secret.lock().expect("secret lock").clone();
        let sanitized = sanitize_sensitive_log(line, &[secret.as_str()]);
        {
            let mut logs = self.logs.lock().expect("log lock");
            if logs.len() >= LOG_RING_CAPACITY {
                logs.pop_front();
            }
            logs.push_back(sanitized.clone());
        }
        if let Some(sink) = &self.on_log {
            sink(&sanitized);
        }
    }

    /// Write the bundle into a fresh scratch dir and spawn the overlay core.
    pub async fn start(self: &Arc<Self>, cfg: &SessionConfig, opts: StartOptions) -> CoreResult<()> {
        if self.bundle.core.is_empty() || self.bundle.cli.is_empty() {
            return Err(CoreError::Overlay(
                "overlay bundle is empty (easytier-core/easytier-cli missing)".into(),
            ));
        }
        *self.secret.lock().expect("secret lock") = cfg.network_secret.clone();

        let mut process = self.process.lock().await;
        if process.child.is_some() {
            return Err(CoreError::Overlay("overlay already running".into()));
        }

        let scratch = tempfile::Builder::new()
            .prefix("telehand-et-")
            .tempdir()
            .map_err(CoreError::Io)?;
        let dir = scratch.path().to_path_buf();

        let (core_name, cli_name) = binary_names();
        let core_path = dir.join(core_name);
        let cli_path = dir.join(cli_name);
        write_executable(&core_path, &self.bundle.core).await?;
        write_executable(&cli_path, &self.bundle.cli).await?;
        self.ensure_windows_runtime(&dir).await?;

        let args = build_core_args(cfg, &opts, self.rpc_port);
        debug!(rpc_port = self.rpc_port, "spawning easytier-core");

        let mut child = Command::new(&core_path)
            .args(&args)
            .current_dir(&dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::Overlay(format!("spawn easytier-core: {e}")))?;

        self.push_log(&format!("[telehand] easytier rpc={}", self.rpc_port));

        if let Some(stdout) = child.stdout.take() {
            self.spawn_log_reader(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_log_reader(stderr);
        }

        process.child = Some(child);
        process.scratch = Some(scratch);
        process.cli_bin = Some(cli_path);
        Ok(())
    }

    fn spawn_log_reader(
        self: &Arc<Self>,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                supervisor.push_log(&line);
            }
        });
    }

    async fn ensure_windows_runtime(&self, dir: &std::path::Path) -> CoreResult<()> {
        if !cfg!(windows) {
            return Ok(());
        }
        for (name, data) in [
            ("Packet.dll", &self.bundle.packet_dll),
            ("wintun.dll", &self.bundle.wintun_dll),
        ] {
            if data.is_empty() {
                return Err(CoreError::Overlay(format!("{name} payload is empty")));
            }
            tokio::fs::write(dir.join(name), data).await?;
        }
        Ok(())
    }

    /// Whether the overlay process has terminated.
    pub async fn has_exited(&self) -> bool {
        let mut process = self.process.lock().await;
        match process.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    /// Poll the overlay CLI until it reports a virtual IP.
    ///
    /// Aborts early with a coded error when the captured logs already show
    /// a fatal condition (TUN permission, auth failure).
    pub async fn wait_for_ip(&self, wait_timeout: Duration) -> CoreResult<String> {
        let deadline = Instant::now() + wait_timeout;
        loop {
            if let Some(code) = fatal_log_code(&self.logs()) {
                return Err(CoreError::coded(
                    code,
                    "overlay reported a fatal condition while waiting for virtual IP",
                ));
            }

            match self.query_ip().await {
                Ok(Some(ip)) => {
                    *self.virt_ip.lock().expect("virt_ip lock") = Some(ip.clone());
                    return Ok(ip);
                }
                Ok(None) => {}
                Err(err) => self.push_log(&format!("[telehand] node info query failed: {err}")),
            }

            if Instant::now() + WAIT_IP_POLL_INTERVAL > deadline {
                return Err(CoreError::WaitIpTimeout);
            }
            sleep(WAIT_IP_POLL_INTERVAL).await;
        }
    }

    async fn query_ip(&self) -> CoreResult<Option<String>> {
        let info = self.query_node_info().await?;
        let ip = crate::readiness::strip_cidr(&info.ipv4_addr);
        if ip.is_empty() || ip == "0.0.0.0" {
            Ok(None)
        } else {
            Ok(Some(ip.to_string()))
        }
    }

    async fn run_cli(&self, args: &[&str]) -> CoreResult<String> {
        let cli_bin = {
            let process = self.process.lock().await;
            process
                .cli_bin
                .clone()
                .ok_or_else(|| CoreError::Overlay("overlay not started".into()))?
        };
        let rpc = format!("127.0.0.1:{}", self.rpc_port);

        let output = timeout(
            CLI_QUERY_TIMEOUT,
            Command::new(&cli_bin)
                .arg("-p")
                .arg(&rpc)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| CoreError::Overlay("easytier-cli timed out".into()))?
        .map_err(|e| CoreError::Overlay(format!("easytier-cli: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Overlay(format!(
                "easytier-cli error: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `node info -o json`, 3 s deadline.
    pub async fn query_node_info(&self) -> CoreResult<NodeInfo> {
        let out = self.run_cli(&["-o", "json", "node", "info"]).await?;
        parse_node_info(&out)
    }

    /// `peer list -o json`, 3 s deadline.
    pub async fn query_peer_list(&self) -> CoreResult<Vec<PeerEntry>> {
        let out = self.run_cli(&["-o", "json", "peer", "list"]).await?;
        parse_peer_list(&out)
    }

    /// Node info + peer list + readiness classification in one read.
    pub async fn query_snapshot(&self) -> CoreResult<Snapshot> {
        let node = self.query_node_info().await?;
        let peers = self.query_peer_list().await?;
        Ok(build_snapshot(Some(node), peers))
    }

    /// Kill the overlay process and remove the scratch directory.
    pub async fn stop(&self) {
        let mut process = self.process.lock().await;
        if let Some(mut child) = process.child.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill easytier-core");
            }
            let _ = child.wait().await;
        }
        // Dropping the TempDir removes the scratch directory.
        process.scratch.take();
        process.cli_bin.take();
    }
}

/// Fatal conditions recognizable from logs alone; these abort the wait
/// loop instead of burning the whole IP timeout.
fn fatal_log_code(logs: &[String]) -> Option<ErrorCode> {
    if logs.is_empty() {
        return None;
    }
    match classify_error(None, logs, ErrorCode::EasytierStartFailed) {
        code @ (ErrorCode::TunPermissionDenied | ErrorCode::AuthFailed) => Some(code),
        _ => None,
    }
}

/// Argument vector for the overlay core.
fn build_core_args(cfg: &SessionConfig, opts: &StartOptions, rpc_port: u16) -> Vec<String> {
    let mut args = Vec::new();
    match &opts.ipv4_cidr {
        Some(cidr) if !cidr.trim().is_empty() => {
            args.push("--ipv4".to_string());
            args.push(cidr.trim().to_string());
        }
        _ => args.push("--dhcp".to_string()),
    }
    args.extend([
        "--network-name".to_string(),
        cfg.network_name.clone(),
        "--network-secret".to_string(),
        cfg.network_secret.clone(),
        "-l".to_string(),
        "tcp://0.0.0.0:0".to_string(),
        "-l".to_string(),
        "udp://0.0.0.0:0".to_string(),
        "-r".to_string(),
        format!("127.0.0.1:{rpc_port}"),
    ]);
    for peer in &cfg.peers {
        args.push("--peers".to_string());
        args.push(peer.clone());
    }
    args
}

fn parse_node_info(raw: &str) -> CoreResult<NodeInfo> {
    serde_json::from_str(raw.trim())
        .map_err(|e| CoreError::Overlay(format!("invalid node info json: {e}")))
}

/// Peer list output has shipped as both a bare array and an object with a
/// `peers` field; accept either.
fn parse_peer_list(raw: &str) -> CoreResult<Vec<PeerEntry>> {
    let value: serde_json::Value = serde_json::from_str(raw.trim())
        .map_err(|e| CoreError::Overlay(format!("invalid peer list json: {e}")))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("peers") {
            Some(serde_json::Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    let mut peers = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<PeerEntry>(item) {
            Ok(peer) => peers.push(peer),
            Err(e) => debug!(error = %e, "skipping unparseable peer entry"),
        }
    }
    Ok(peers)
}

/// Probe an ephemeral loopback bind to pick the RPC port.
fn allocate_rpc_port() -> u16 {
    match std::net::TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(18899),
        Err(_) => 18899,
    }
}

#[cfg(unix)]
async fn write_executable(path: &std::path::Path, data: &[u8]) -> CoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::write(path, data).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_executable(path: &std::path::Path, data: &[u8]) -> CoreResult<()> {
    tokio::fs::write(path, data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> SessionConfig {
        SessionConfig {
            network_name: "telehand:abc".into(),
            network_secret: "s3cret".into(),
            peers: vec!["tcp://1.1.1.1:11010".into()],
        }
    }

    #[test]
    fn core_args_use_explicit_ipv4_when_given() {
        let args = build_core_args(
            &sample_config(),
            &StartOptions {
                ipv4_cidr: Some("10.1.2.1/24".into()),
            },
            18899,
        );
        assert_eq!(args[0], "--ipv4");
        assert_eq!(args[1], "10.1.2.1/24");
        assert!(args.contains(&"--peers".to_string()));
        assert!(args.contains(&"tcp://1.1.1.1:11010".to_string()));
        assert!(!args.contains(&"--dhcp".to_string()));
    }

    #[test]
    fn core_args_fall_back_to_dhcp() {
        let args = build_core_args(&sample_config(), &StartOptions::default(), 18899);
        assert_eq!(args[0], "--dhcp");
        assert!(args.contains(&"127.0.0.1:18899".to_string()));
    }

    #[test]
    fn node_info_parses_and_strips_cidr() {
        let info = parse_node_info(r#"{"ipv4_addr":"10.126.126.2/24","hostname":"h"}"#).unwrap();
        assert_eq!(crate::readiness::strip_cidr(&info.ipv4_addr), "10.126.126.2");
    }

    #[test]
    fn peer_list_accepts_array_and_wrapped_object() {
        let arr = parse_peer_list(r#"[{"id":"1","ipv4":"10.0.0.2/24","hostname":"a"}]"#).unwrap();
        assert_eq!(arr.len(), 1);
        let wrapped =
            parse_peer_list(r#"{"peers":[{"id":"2","ipv4":"","hostname":"PublicServer_x"}]}"#)
                .unwrap();
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped[0].hostname, "PublicServer_x");
    }

    #[test]
    fn fatal_log_scan_hits_tun_permission() {
        let logs = vec!["tun device error: Operation not permitted".to_string()];
        assert_eq!(fatal_log_code(&logs), Some(ErrorCode::TunPermissionDenied));
        assert_eq!(fatal_log_code(&[]), None);
        let benign = vec!["peer connection established".to_string()];
        assert_eq!(fatal_log_code(&benign), None);
    }

    #[tokio::test]
    async fn wait_for_ip_aborts_early_on_fatal_logs() {
        let et = Arc::new(EasyTier::new(OverlayBundle::default(), None));
        et.push_log("tun device error: Operation not permitted");
        let started = std::time::Instant::now();
        let err = et.wait_for_ip(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::TunPermissionDenied));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn log_ring_redacts_secret_and_stays_bounded() {
        let et = EasyTier::new(OverlayBundle::default(), None);
        *et.secret.lock().unwrap() = "supersecret".into();
        for i in 0..(LOG_RING_CAPACITY + 10) {
            et.push_log(&format!("line {i} token=supersecret"));
        }
        let logs = et.logs();
        assert_eq!(logs.len(), LOG_RING_CAPACITY);
        assert!(logs.iter().all(|l| !l.contains("supersecret")));
    }

    #[test]
    fn rpc_port_allocation_is_nonzero() {
        assert_ne!(allocate_rpc_port(), 0);
    }
}

//! Core error types and the failure-code classifier.

use thiserror::Error;

/// Process exit codes surfaced by the CLI.
pub const EXIT_CODE_OK: i32 = 0;
pub const EXIT_CODE_PARAM: i32 = 2;
pub const EXIT_CODE_NETWORK: i32 = 3;
pub const EXIT_CODE_SERVICE: i32 = 4;

/// Closed set of machine-readable failure codes.
///
/// The wire strings are stable: they appear in `/health`, the status API,
/// and the GUI, and remote tooling matches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
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
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::WindowsNotAdmin => "windows_not_admin",
            ErrorCode::WindowsAdminCheckFailed => "windows_admin_check_failed",
            ErrorCode::WindowsTunInitFailed => "windows_tun_init_failed",
            ErrorCode::WindowsFirewallBlocked => "windows_firewall_blocked",
            ErrorCode::EasytierStartFailed => "easytier_start_failed",
            ErrorCode::EasytierIpTimeout => "easytier_ip_timeout",
            ErrorCode::TunPermissionDenied => "tun_permission_denied",
            ErrorCode::ConfigExpired => "config_expired",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::PeerUnreachable => "peer_unreachable",
            ErrorCode::RouteConflictDetected => "route_conflict_detected",
        }
    }

    /// Whether a connect round may retry past this failure by rotating
    /// peer/subnet. Permission and auth failures never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::EasytierIpTimeout | ErrorCode::PeerUnreachable
        )
    }

    /// Map a final failure code to the CLI exit code.
    pub fn exit_code(&self, fallback: i32) -> i32 {
        match self {
            ErrorCode::EasytierIpTimeout
            | ErrorCode::AuthFailed
            | ErrorCode::PeerUnreachable
            | ErrorCode::WindowsFirewallBlocked
            | ErrorCode::RouteConflictDetected => EXIT_CODE_NETWORK,
            ErrorCode::EasytierStartFailed
            | ErrorCode::WindowsTunInitFailed
            | ErrorCode::WindowsAdminCheckFailed
            | ErrorCode::WindowsNotAdmin
            | ErrorCode::TunPermissionDenied => EXIT_CODE_SERVICE,
            _ => fallback,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core errors for the connection lifecycle.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Failure that already carries a taxonomy code; the classifier
    /// returns it unchanged.
    #[error("{message}")]
    Coded { code: ErrorCode, message: String },

    /// Pairing-code decode failure.
    #[error("invalid pairing code: {0}")]
    InvalidConfig(String),

    /// Overlay supervisor failure (spawn, scratch dir, CLI invocation).
    #[error("overlay error: {0}")]
    Overlay(String),

    /// Timed out waiting for the overlay virtual IP.
    #[error("timeout waiting for EasyTier virtual IP")]
    WaitIpTimeout,

    /// Session interrupted by user stop or signal.
    #[error("session interrupted")]
    Interrupted,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        CoreError::Coded {
            code,
            message: message.into(),
        }
    }

    /// The taxonomy code this error already carries, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            CoreError::Coded { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Classify an overlay failure into a taxonomy code.
///
/// A pre-coded error wins; otherwise error text and process logs are
/// keyword-matched, first bucket wins, else `fallback`.
pub fn classify_error(err: Option<&CoreError>, logs: &[String], fallback: ErrorCode) -> ErrorCode {
    classify_error_for_os(std::env::consts::OS, err, logs, fallback)
}

/// OS-parameterized classifier so the Windows buckets are testable anywhere.
pub fn classify_error_for_os(
    os: &str,
    err: Option<&CoreError>,
    logs: &[String],
    fallback: ErrorCode,
) -> ErrorCode {
    if let Some(code) = err.and_then(|e| e.code()) {
        return code;
    }

    let evidence = join_evidence(err, logs).to_lowercase();
    if contains_any(
        &evidence,
        &["operation not permitted", "permission denied"],
    ) && contains_any(&evidence, &["tun", "wintun", "utun"])
    {
        return ErrorCode::TunPermissionDenied;
    }
    if contains_any(
        &evidence,
        &[
            "auth failed",
            "authentication failed",
            "invalid credential",
            "invalid network secret",
            "forbidden",
        ],
    ) {
        return ErrorCode::AuthFailed;
    }
    if contains_any(
        &evidence,
        &[
            "peer unreachable",
            "no available peer",
            "connection refused",
            "no route to host",
            "network is unreachable",
            "could not connect to peer",
        ],
    ) {
        return ErrorCode::PeerUnreachable;
    }

    if os == "windows" {
        if contains_any(
            &evidence,
            &[
                "firewall",
                "windows filtering platform",
                "wfp",
                "blocked by policy",
                "administratively prohibited",
            ],
        ) {
            return ErrorCode::WindowsFirewallBlocked;
        }
        if contains_any(
            &evidence,
            &[
                "wintun",
                "packet.dll",
                "npcap",
                "tap-windows",
                "virtual adapter",
                "create adapter",
                "tun device",
            ],
        ) {
            return ErrorCode::WindowsTunInitFailed;
        }
    }

    fallback
}

/// Single-line user-facing connect failure message.
pub fn format_connect_error(code: ErrorCode, err: &CoreError) -> String {
    match code {
        ErrorCode::AuthFailed => {
            "Failed to connect: authentication failed (network name/secret mismatch)".into()
        }
        ErrorCode::PeerUnreachable => "Failed to connect: peer unreachable".into(),
        ErrorCode::TunPermissionDenied => {
            "Failed to connect: TUN permission denied (please run with administrator/root privilege)"
                .into()
        }
        ErrorCode::EasytierIpTimeout => {
            "Failed to connect: timeout waiting for virtual IP".into()
        }
        ErrorCode::RouteConflictDetected => {
            "Failed to connect: route/subnet conflict detected before running".into()
        }
        _ => format!("Failed to connect: {err}"),
    }
}

fn join_evidence(err: Option<&CoreError>, logs: &[String]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(logs.len() + 1);
    if let Some(err) = err {
        let msg = err.to_string();
        if !msg.trim().is_empty() {
            parts.push(msg);
        }
    }
    for line in logs {
        let line = line.trim();
        if !line.is_empty() {
            parts.push(line.to_string());
        }
    }
    parts.join("\n")
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

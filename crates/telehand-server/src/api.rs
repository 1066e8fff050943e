//! HTTP control API.
//!
//! JSON over POST on the first free port from 8080, bound on all
//! interfaces so the remote side can reach it over the virtual IP once
//! the overlay is up. Missing files and directories are business-level
//! misses: HTTP 200 with an `{error}` body, so remote tooling can
//! distinguish transport failures from empty results.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use telehand_core::{CmdLog, SharedStatus};

use crate::error::{ServerError, ServerResult};
use crate::Ports;

const PORT_SCAN_RANGE: u16 = 100;
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;
const MAX_EXEC_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DOWNLOAD_CHUNK: usize = 1024 * 1024;
const MAX_DOWNLOAD_CHUNK: usize = 8 * 1024 * 1024;

#[derive(Clone)]
struct ApiState {
    status: Arc<SharedStatus>,
    ports: Arc<Ports>,
}

/// The control API server handle.
pub struct ApiServer {
    port: u16,
    cancel: CancellationToken,
}

impl ApiServer {
    /// Bind the first free port from `start_port` and start serving.
    pub async fn start(
        bind_ip: &str,
        start_port: u16,
        status: Arc<SharedStatus>,
        ports: Arc<Ports>,
    ) -> ServerResult<Self> {
        let state = ApiState {
            status,
            ports: Arc::clone(&ports),
        };
        let app = router(state);

        let (listener, port) = bind_first_free(bind_ip, start_port).await?;
        ports.set_api(port);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::warn!(error = %e, "control API server exited with error");
            }
        });
        info!(port, "control API listening");
        Ok(Self { port, cancel })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

pub(crate) async fn bind_first_free(
    bind_ip: &str,
    start_port: u16,
) -> ServerResult<(TcpListener, u16)> {
    for offset in 0..PORT_SCAN_RANGE {
        let port = start_port.saturating_add(offset);
        if let Ok(listener) = TcpListener::bind((bind_ip, port)).await {
            return Ok((listener, port));
        }
    }
    Err(ServerError::NoAvailablePort(start_port))
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/connect", post(handle_connect))
        .route("/exec", post(handle_exec))
        .route("/read", post(handle_read))
        .route("/write", post(handle_write))
        .route("/edit", post(handle_edit))
        .route("/patch", post(handle_patch))
        .route("/ls", post(handle_ls))
        .route("/upload", post(handle_upload))
        .route("/download", post(handle_download))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn json_error(code: StatusCode, msg: impl Into<String>) -> Response {
    (code, Json(json!({ "error": msg.into() }))).into_response()
}

fn json_error_with_code(code: StatusCode, msg: impl Into<String>, error_code: &str) -> Response {
    let mut body = json!({ "error": msg.into() });
    if !error_code.is_empty() {
        body["error_code"] = json!(error_code);
    }
    (code, Json(body)).into_response()
}

// ---- /health -------------------------------------------------------------

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    phase: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    role: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    virt_ip: String,
    #[serde(skip_serializing_if = "is_zero")]
    api_port: u16,
    #[serde(skip_serializing_if = "is_zero")]
    gui_port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    error_code: String,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

async fn handle_health(State(state): State<ApiState>) -> Json<HealthResp> {
    let s = state.status.state();
    Json(HealthResp {
        status: "ok",
        phase: s.phase.as_str().to_string(),
        role: s.role,
        virt_ip: s.virt_ip,
        api_port: state.ports.api(),
        gui_port: state.ports.gui(),
        error: s.error,
        error_code: s.error_code,
    })
}

// ---- /connect ------------------------------------------------------------

#[derive(Deserialize)]
struct ConnectReq {
    #[serde(default)]
    config: String,
}

async fn handle_connect(State(state): State<ApiState>, Json(req): Json<ConnectReq>) -> Response {
    if req.config.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "config is required");
    }
    match state.status.submit_encoded_config(&req.config) {
        Ok(()) => {
            state
                .status
                .add_cmd_log(CmdLog::now("POST", "/connect", "submitted config"));
            Json(json!({ "ok": true })).into_response()
        }
        Err(err) => {
            let status = if err.is_conflict() {
                StatusCode::CONFLICT
            } else {
                StatusCode::BAD_REQUEST
            };
            let code = err.code().map(|c| c.as_str()).unwrap_or("");
            json_error_with_code(status, err.to_string(), code)
        }
    }
}

// ---- /exec ---------------------------------------------------------------

#[derive(Deserialize)]
struct ExecReq {
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    timeout_sec: u64,
}

#[derive(Serialize)]
struct ExecResp {
    stdout: String,
    stderr: String,
    code: i32,
}

/// Shell for `/exec`: `$SHELL` (fallback `/bin/sh`) on Unix, PowerShell on
/// Windows.
fn exec_shell() -> (String, &'static str) {
    if cfg!(windows) {
        ("powershell.exe".to_string(), "-Command")
    } else {
        let shell = std::env::var("SHELL").unwrap_or_default();
        let shell = if shell.trim().is_empty() {
            "/bin/sh".to_string()
        } else {
            shell
        };
        (shell, "-c")
    }
}

async fn handle_exec(State(state): State<ApiState>, Json(req): Json<ExecReq>) -> Response {
    if req.cmd.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "cmd is required");
    }
    let resp = run_exec(&req.cmd, &req.cwd, req.timeout_sec).await;
    state
        .status
        .add_cmd_log(CmdLog::now("POST", "/exec", truncate(&req.cmd, 80)));
    Json(resp).into_response()
}

/// Run one shell command with the `/exec` deadline semantics: default
/// 30 s, hard ceiling 600 s, exit code 124 on deadline.
async fn run_exec(cmd: &str, cwd: &str, timeout_sec: u64) -> ExecResp {
    let timeout_sec = match timeout_sec {
        0 => DEFAULT_EXEC_TIMEOUT_SECS,
        t => t.min(MAX_EXEC_TIMEOUT_SECS),
    };

    let (shell, flag) = exec_shell();
    let mut command = tokio::process::Command::new(shell);
    command.arg(flag).arg(cmd).kill_on_drop(true);
    if !cwd.is_empty() {
        command.current_dir(cwd);
    }

    match tokio::time::timeout(Duration::from_secs(timeout_sec), command.output()).await {
        Ok(Ok(output)) => ExecResp {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        },
        Ok(Err(e)) => ExecResp {
            stdout: String::new(),
            stderr: e.to_string(),
            code: -1,
        },
        Err(_) => ExecResp {
            stdout: String::new(),
            stderr: format!("command timed out after {timeout_sec}s"),
            code: 124,
        },
    }
}

// ---- /read ---------------------------------------------------------------

#[derive(Deserialize)]
struct ReadReq {
    #[serde(default)]
    path: String,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

#[derive(Serialize)]
struct ReadResp {
    content: String,
    total_lines: usize,
}

async fn handle_read(State(state): State<ApiState>, Json(req): Json<ReadReq>) -> Response {
    if req.path.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path is required");
    }

    let raw = match tokio::fs::read_to_string(&req.path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return json_error(StatusCode::OK, e.to_string());
        }
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let lines: Vec<&str> = raw.lines().collect();
    let total_lines = lines.len();
    let offset = req.offset.min(total_lines);
    let limit = if req.limit == 0 { total_lines } else { req.limit };
    let end = offset.saturating_add(limit).min(total_lines);

    state
        .status
        .add_cmd_log(CmdLog::now("POST", "/read", truncate(&req.path, 80)));
    Json(ReadResp {
        content: lines[offset..end].join("\n"),
        total_lines,
    })
    .into_response()
}

// ---- /write --------------------------------------------------------------

#[derive(Deserialize)]
struct WriteReq {
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
}

async fn handle_write(State(state): State<ApiState>, Json(req): Json<WriteReq>) -> Response {
    if req.path.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path is required");
    }
    if let Err(e) = ensure_parent_dir(&req.path).await {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    if let Err(e) = tokio::fs::write(&req.path, req.content.as_bytes()).await {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    state
        .status
        .add_cmd_log(CmdLog::now("POST", "/write", truncate(&req.path, 80)));
    Json(json!({ "ok": true })).into_response()
}

async fn ensure_parent_dir(path: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

// ---- /edit ---------------------------------------------------------------

#[derive(Deserialize)]
struct EditReq {
    #[serde(default)]
    path: String,
    #[serde(default)]
    start_line: usize,
    #[serde(default)]
    end_line: usize,
    #[serde(default)]
    content: String,
}

async fn handle_edit(State(state): State<ApiState>, Json(req): Json<EditReq>) -> Response {
    if req.path.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path is required");
    }
    let raw = match tokio::fs::read_to_string(&req.path).await {
        Ok(raw) => raw,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let lines: Vec<&str> = raw.split('\n').collect();
    match apply_line_edit(&lines, req.start_line, req.end_line, &req.content) {
        Ok(result) => {
            if let Err(e) = tokio::fs::write(&req.path, result).await {
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
            state.status.add_cmd_log(CmdLog::now(
                "POST",
                "/edit",
                format!("{} L{}-{}", truncate(&req.path, 40), req.start_line, req.end_line),
            ));
            Json(json!({ "ok": true })).into_response()
        }
        Err(msg) => json_error(StatusCode::BAD_REQUEST, msg),
    }
}

/// Replace the 1-indexed inclusive `[start_line, end_line]` span with
/// `content`. `start_line = len+1, end_line = len` appends.
fn apply_line_edit(
    lines: &[&str],
    start_line: usize,
    end_line: usize,
    content: &str,
) -> Result<String, String> {
    let len = lines.len();
    if start_line < 1 || start_line > len + 1 {
        return Err(format!("start_line {start_line} out of range (1-{})", len + 1));
    }
    if end_line + 1 < start_line || end_line > len {
        return Err(format!(
            "end_line {end_line} out of range ({}-{len})",
            start_line.saturating_sub(1)
        ));
    }

    let replacement: Vec<&str> = if content.is_empty() {
        Vec::new()
    } else {
        content.split('\n').collect()
    };

    let mut result = Vec::with_capacity(len + replacement.len());
    result.extend_from_slice(&lines[..start_line - 1]);
    result.extend_from_slice(&replacement);
    result.extend_from_slice(&lines[end_line..]);
    Ok(result.join("\n"))
}

// ---- /patch --------------------------------------------------------------

#[derive(Deserialize)]
struct PatchReq {
    #[serde(default)]
    path: String,
    #[serde(default)]
    old: String,
    #[serde(default)]
    new: String,
    #[serde(default)]
    replace_all: bool,
}

#[derive(Serialize, Debug)]
struct PatchResp {
    replaced: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    warning: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    matches: Vec<usize>,
}

async fn handle_patch(State(state): State<ApiState>, Json(req): Json<PatchReq>) -> Response {
    if req.path.is_empty() || req.old.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path and old are required");
    }
    let content = match tokio::fs::read_to_string(&req.path).await {
        Ok(content) => content,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let (new_content, resp) = match apply_patch(&content, &req.old, &req.new, req.replace_all) {
        Ok(patched) => patched,
        Err(msg) => return json_error(StatusCode::BAD_REQUEST, msg),
    };

    if let Err(e) = tokio::fs::write(&req.path, new_content).await {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    state
        .status
        .add_cmd_log(CmdLog::now("POST", "/patch", truncate(&req.path, 80)));
    Json(resp).into_response()
}

/// Replace `old` with `new` in `content`. Fails when `old` is absent;
/// without `replace_all`, only the first occurrence changes and the
/// remaining match locations come back as a warning.
fn apply_patch(
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<(String, PatchResp), String> {
    let count = content.matches(old).count();
    if count == 0 {
        return Err("old text not found".to_string());
    }
    let match_lines = find_match_lines(content, old);

    let (new_content, replaced) = if replace_all {
        (content.replace(old, new), count)
    } else {
        (content.replacen(old, new, 1), 1)
    };

    let mut resp = PatchResp {
        replaced,
        warning: String::new(),
        matches: Vec::new(),
    };
    if count > 1 && !replace_all {
        resp.warning =
            format!("multiple matches found ({count} total), only replaced first occurrence");
        resp.matches = match_lines;
    }
    Ok((new_content, resp))
}

/// 1-indexed line numbers of each non-overlapping match.
fn find_match_lines(content: &str, pattern: &str) -> Vec<usize> {
    let mut lines = Vec::new();
    let mut idx = 0;
    while let Some(pos) = content[idx..].find(pattern) {
        let abs = idx + pos;
        lines.push(content[..abs].matches('\n').count() + 1);
        idx = abs + pattern.len();
    }
    lines
}

// ---- /ls -----------------------------------------------------------------

#[derive(Deserialize)]
struct LsReq {
    #[serde(default)]
    path: String,
}

#[derive(Serialize)]
struct LsEntry {
    name: String,
    is_dir: bool,
    size: u64,
}

async fn handle_ls(State(state): State<ApiState>, Json(req): Json<LsReq>) -> Response {
    if req.path.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path is required");
    }
    let mut dir = match tokio::fs::read_dir(&req.path).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return json_error(StatusCode::OK, e.to_string());
        }
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let mut entries = Vec::new();
    while let Ok(Some(entry)) = dir.next_entry().await {
        let meta = entry.metadata().await.ok();
        entries.push(LsEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.as_ref().map(|m| m.is_dir()).unwrap_or(false),
            size: meta.map(|m| m.len()).unwrap_or(0),
        });
    }

    state
        .status
        .add_cmd_log(CmdLog::now("POST", "/ls", truncate(&req.path, 80)));
    Json(json!({ "entries": entries })).into_response()
}

// ---- /upload, /download --------------------------------------------------

#[derive(Deserialize)]
struct UploadReq {
    #[serde(default)]
    path: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    append: bool,
}

async fn handle_upload(State(state): State<ApiState>, Json(req): Json<UploadReq>) -> Response {
    if req.path.is_empty() || req.data.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path and data are required");
    }
    let data = match BASE64.decode(&req.data) {
        Ok(data) => data,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "data must be base64"),
    };
    if let Err(e) = ensure_parent_dir(&req.path).await {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let write_result = if req.append {
        use tokio::io::AsyncWriteExt;
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&req.path)
            .await
        {
            Ok(mut file) => file.write_all(&data).await,
            Err(e) => Err(e),
        }
    } else {
        tokio::fs::write(&req.path, &data).await
    };
    if let Err(e) = write_result {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    state
        .status
        .add_cmd_log(CmdLog::now("POST", "/upload", truncate(&req.path, 80)));
    Json(json!({ "ok": true, "bytes": data.len() })).into_response()
}

#[derive(Deserialize)]
struct DownloadReq {
    #[serde(default)]
    path: String,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    limit: usize,
}

#[derive(Serialize)]
struct DownloadResp {
    data: String,
    size: usize,
    total_size: u64,
    offset: u64,
    eof: bool,
}

async fn handle_download(State(state): State<ApiState>, Json(req): Json<DownloadReq>) -> Response {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    if req.path.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path is required");
    }
    let mut file = match tokio::fs::File::open(&req.path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return json_error(StatusCode::OK, e.to_string());
        }
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let total = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let offset = req.offset.min(total);
    let limit = match req.limit {
        0 => DEFAULT_DOWNLOAD_CHUNK,
        l => l.min(MAX_DOWNLOAD_CHUNK),
    };

    if let Err(e) = file.seek(std::io::SeekFrom::Start(offset)).await {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    let mut buf = vec![0u8; limit];
    let n = match file.read(&mut buf).await {
        Ok(n) => n,
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    state
        .status
        .add_cmd_log(CmdLog::now("POST", "/download", truncate(&req.path, 80)));
    Json(DownloadResp {
        data: BASE64.encode(&buf[..n]),
        size: n,
        total_size: total,
        offset,
        eof: offset + n as u64 >= total,
    })
    .into_response()
}

fn truncate(s: &str, n: usize) -> String {
    if s.len() <= n {
        s.to_string()
    } else {
        let mut end = n;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_edit_replaces_inclusive_range() {
        let lines = vec!["a", "b", "c", "d"];
        let out = apply_line_edit(&lines, 2, 3, "X\nY").unwrap();
        assert_eq!(out, "a\nX\nY\nd");
    }

    #[test]
    fn line_edit_supports_pure_append() {
        let lines = vec!["a", "b"];
        let out = apply_line_edit(&lines, 3, 2, "c").unwrap();
        assert_eq!(out, "a\nb\nc");
    }

    #[test]
    fn line_edit_empty_content_deletes_range() {
        let lines = vec!["a", "b", "c"];
        let out = apply_line_edit(&lines, 2, 2, "").unwrap();
        assert_eq!(out, "a\nc");
    }

    #[test]
    fn line_edit_rejects_out_of_range() {
        let lines = vec!["a", "b"];
        let err = apply_line_edit(&lines, 0, 1, "x").unwrap_err();
        assert!(err.contains("start_line"));
        let err = apply_line_edit(&lines, 4, 4, "x").unwrap_err();
        assert!(err.contains("start_line"));
        let err = apply_line_edit(&lines, 1, 3, "x").unwrap_err();
        assert!(err.contains("end_line"));
    }

    #[test]
    fn match_lines_are_one_indexed() {
        let content = "foo\nbar foo\nbaz\nfoo";
        assert_eq!(find_match_lines(content, "foo"), vec![1, 2, 4]);
        assert!(find_match_lines(content, "missing").is_empty());
    }

    #[test]
    fn patch_first_occurrence_warns_about_the_rest() {
        let content = "alpha\nbeta\nalpha\n";
        let (patched, resp) = apply_patch(content, "alpha", "gamma", false).unwrap();
        assert_eq!(patched, "gamma\nbeta\nalpha\n");
        assert_eq!(resp.replaced, 1);
        assert!(resp.warning.contains("2 total"));
        assert_eq!(resp.matches, vec![1, 3]);
    }

    #[test]
    fn patch_replace_all_is_exhaustive() {
        let content = "alpha beta alpha";
        let (patched, resp) = apply_patch(content, "alpha", "gamma", true).unwrap();
        assert_eq!(patched, "gamma beta gamma");
        assert_eq!(resp.replaced, 2);
        assert!(resp.warning.is_empty());

        // A second pass over the same `old` has nothing left to match.
        let err = apply_patch(&patched, "alpha", "gamma", true).unwrap_err();
        assert_eq!(err, "old text not found");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_deadline_returns_code_124() {
        let resp = run_exec("sleep 2", "", 1).await;
        assert_eq!(resp.code, 124);
        assert!(resp.stderr.ends_with("command timed out after 1s"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_captures_output_and_exit_code() {
        let resp = run_exec("echo hello && exit 3", "", 5).await;
        assert_eq!(resp.stdout.trim(), "hello");
        assert_eq!(resp.code, 3);
    }

    #[test]
    fn exec_shell_honors_env_on_unix() {
        if cfg!(windows) {
            let (shell, flag) = exec_shell();
            assert_eq!(shell, "powershell.exe");
            assert_eq!(flag, "-Command");
        } else {
            let (_, flag) = exec_shell();
            assert_eq!(flag, "-c");
        }
    }

    #[test]
    fn truncate_appends_ellipsis() {
        assert_eq!(truncate("short", 80), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/file.txt");
        let path_str = path.to_string_lossy().into_owned();

        ensure_parent_dir(&path_str).await.unwrap();
        tokio::fs::write(&path, "line1\nline2\nline3").await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.join("\n"), "line1\nline2\nline3");
        assert_eq!(lines.len(), 3);
    }
}

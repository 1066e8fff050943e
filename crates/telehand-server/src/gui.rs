//! Status/GUI server.
//!
//! Loopback-only: serves the pairing page plus the state endpoints the
//! page polls. Everything it renders comes from the shared status hub.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use telehand_core::{PeerInfoSnapshot, SharedStatus};

use crate::api::bind_first_free;
use crate::error::ServerResult;
use crate::Ports;

const GUI_PAGE: &str = include_str!("../assets/gui.html");

#[derive(Clone)]
struct GuiState {
    status: Arc<SharedStatus>,
}

/// The status/GUI server handle.
pub struct GuiServer {
    port: u16,
    cancel: CancellationToken,
}

impl GuiServer {
    /// Bind the first free loopback port from `start_port` and serve.
    pub async fn start(
        start_port: u16,
        status: Arc<SharedStatus>,
        ports: Arc<Ports>,
    ) -> ServerResult<Self> {
        let state = GuiState { status };
        let app = Router::new()
            .route("/", get(handle_index))
            .route("/api/state", get(handle_state))
            .route("/api/logs", get(handle_logs))
            .route("/api/debug-logs", get(handle_debug_logs))
            .route("/api/peer-info", get(handle_peer_info))
            .route("/api/submit-config", post(handle_submit_config))
            .route("/api/stop", post(handle_stop))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let (listener, port) = bind_first_free("127.0.0.1", start_port).await?;
        ports.set_gui(port);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::warn!(error = %e, "GUI server exited with error");
            }
        });
        info!(port, "GUI listening on 127.0.0.1");
        Ok(Self { port, cancel })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn handle_index() -> Html<&'static str> {
    Html(GUI_PAGE)
}

async fn handle_state(State(state): State<GuiState>) -> Response {
    Json(state.status.state()).into_response()
}

async fn handle_logs(State(state): State<GuiState>) -> Response {
    Json(state.status.cmd_logs()).into_response()
}

async fn handle_debug_logs(State(state): State<GuiState>) -> Response {
    Json(state.status.debug_logs()).into_response()
}

async fn handle_peer_info(State(state): State<GuiState>) -> Response {
    let Some(provider) = state.status.peer_info_provider() else {
        return Json(PeerInfoSnapshot::default()).into_response();
    };
    match provider().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => Json(json!({ "error": e.to_string() })).into_response(),
    }
}

#[derive(Deserialize)]
struct SubmitConfigReq {
    #[serde(default)]
    config: String,
}

async fn handle_submit_config(
    State(state): State<GuiState>,
    Json(req): Json<SubmitConfigReq>,
) -> Response {
    match state.status.submit_encoded_config(&req.config) {
        Ok(()) => Json(json!({ "ok": "true" })).into_response(),
        Err(err) => {
            let status = if err.is_conflict() {
                StatusCode::CONFLICT
            } else {
                StatusCode::BAD_REQUEST
            };
            let mut body = json!({ "error": err.to_string() });
            if let Some(code) = err.code() {
                body["error_code"] = json!(code.as_str());
            }
            (status, Json(body)).into_response()
        }
    }
}

async fn handle_stop(State(state): State<GuiState>) -> Response {
    state.status.request_stop();
    Json(json!({ "ok": "true" })).into_response()
}

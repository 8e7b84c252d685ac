//! Dashboard HTTP API and static files.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::client::{ChatClient, ChatInfo};
use crate::config::{self, ChatRef, Config, ConfigError, ConfigStore, WebConfig};
use crate::router::Bridge;

const MAX_BODY_BYTES: usize = 256 * 1024;

/// Number of source names spelled out in the status summary.
const SOURCES_SHOWN: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub client: Arc<dyn ChatClient>,
    pub store: Arc<ConfigStore>,
    /// Held across the file write and the in-memory replace, so the file and
    /// the running config always come from the same save.
    save_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>, client: Arc<dyn ChatClient>, store: Arc<ConfigStore>) -> Self {
        Self { bridge, client, store, save_lock: Arc::new(Mutex::new(())) }
    }
}

/// JSON error body: `{ error, details? }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub details: Option<Vec<String>>,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self { status, error: error.into(), details: None }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a [String]>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody { error: &self.error, details: self.details.as_deref() };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub ready: bool,
    pub last_error: Option<String>,
    pub warnings: Vec<String>,
    pub target: String,
    pub sources: String,
    pub config_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrResponse {
    pub ready: bool,
    pub last_error: Option<String>,
    pub has_qr: bool,
    pub data_url: Option<String>,
    /// Epoch milliseconds.
    pub at: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    pub ok: bool,
    pub needs_restart: bool,
    pub warnings: Vec<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct GroupsResponse {
    pub groups: Vec<ChatRef>,
}

/// First few source labels, then `(+N)` for the rest.
pub fn summarize_sources(sources: &[ChatRef]) -> String {
    let labels: Vec<&str> = sources.iter().map(ChatRef::label).filter(|l| !l.is_empty()).collect();
    let shown = labels.iter().take(SOURCES_SHOWN).copied().collect::<Vec<_>>().join(", ");
    if labels.len() > SOURCES_SHOWN {
        format!("{shown} (+{})", labels.len() - SOURCES_SHOWN)
    } else {
        shown
    }
}

/// Browser launch settings are only read when the client starts.
pub fn needs_restart(before: &Config, after: &Config) -> bool {
    before.whatsapp.puppeteer_executable_path != after.whatsapp.puppeteer_executable_path
        || before.whatsapp.headless != after.whatsapp.headless
}

/// Named groups, sorted case-insensitively by name.
pub fn list_groups(chats: Vec<ChatInfo>) -> Vec<ChatRef> {
    let mut groups: Vec<ChatRef> = chats
        .into_iter()
        .filter(|c| c.is_group && !c.id.is_empty() && !c.name.is_empty())
        .map(|c| ChatRef { id: c.id, name: c.name })
        .collect();
    groups.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
    groups
}

pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let config = state.bridge.config();
    let status = state.bridge.status();
    Json(StatusResponse {
        ready: status.ready,
        last_error: status.last_error,
        warnings: config::warnings(&config),
        target: config.whatsapp.target.label().to_string(),
        sources: summarize_sources(&config.whatsapp.sources),
        config_path: state.store.path().display().to_string(),
    })
}

pub async fn qr_handler(State(state): State<AppState>) -> Json<QrResponse> {
    let status = state.bridge.status();
    Json(QrResponse {
        ready: status.ready,
        last_error: status.last_error,
        has_qr: status.qr_data_url.is_some(),
        data_url: status.qr_data_url,
        at: status.last_qr_at.map(|t| t.timestamp_millis()),
    })
}

pub async fn get_config_handler(State(state): State<AppState>) -> Json<Config> {
    Json(Config::clone(&state.bridge.config()))
}

pub async fn save_config_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<SaveResponse>, ApiError> {
    let _saving = state.save_lock.lock().await;
    let saved = state.store.save(&body).map_err(|e| match e {
        ConfigError::Invalid(details) => ApiError {
            status: StatusCode::BAD_REQUEST,
            error: "Invalid config".to_string(),
            details: Some(details),
        },
        other => {
            error!("Failed to save config: {other}");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    })?;

    let warnings = config::warnings(&saved);
    let before = state.bridge.replace(saved);
    let after = state.bridge.config();
    let needs_restart = needs_restart(&before, &after);
    info!(needs_restart, "Config saved");

    let message = if needs_restart {
        "Saved. Restart the relay to apply the browser/headless change."
    } else {
        "Saved. Changes applied."
    };
    Ok(Json(SaveResponse { ok: true, needs_restart, warnings, message: message.to_string() }))
}

pub async fn groups_handler(State(state): State<AppState>) -> Result<Json<GroupsResponse>, ApiError> {
    if !state.bridge.status().ready {
        return Err(ApiError::new(StatusCode::CONFLICT, "WhatsApp client not ready yet"));
    }
    let chats = state.client.get_chats().await.map_err(|e| {
        error!("Failed to fetch groups: {e:#}");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    })?;
    Ok(Json(GroupsResponse { groups: list_groups(chats) }))
}

pub fn router(state: AppState, public_dir: &Path) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/qr", get(qr_handler))
        .route("/api/config", get(get_config_handler).post(save_config_handler))
        .route("/api/groups", get(groups_handler))
        .fallback_service(ServeDir::new(public_dir))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind the dashboard listener. `bind` may be an IP address or a hostname.
pub async fn bind(web: &WebConfig) -> Result<TcpListener> {
    let port = u16::try_from(web.port).with_context(|| format!("web.port {} out of range", web.port))?;
    TcpListener::bind((web.bind.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {}:{port}", web.bind))
}

/// Serve the dashboard on an already bound listener until the server fails.
pub async fn serve_on(listener: TcpListener, state: AppState, public_dir: &Path) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("🌐 Web UI: http://{addr}");
    axum::serve(listener, router(state, public_dir))
        .await
        .context("web server failed")
}

/// Serve the dashboard on the configured address until the server fails.
pub async fn serve(state: AppState, public_dir: &Path) -> Result<()> {
    let listener = bind(&state.bridge.config().web).await?;
    serve_on(listener, state, public_dir).await
}

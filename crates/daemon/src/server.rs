//! HTTP and WebSocket facade
//!
//! JSON API over the fleet: status, session connect/disconnect,
//! machine config, resolution presets, window placement, and a
//! WebSocket stream carrying `status_update` and `log_message` events.

use crate::config::DaemonConfig;
use crate::hypr::WmBridge;
use crate::presets::{normalize_key, PresetStore, ResolutionPreset};
use crate::registry::{FleetRegistry, MachinePatch};
use crate::session::{SessionManager, SessionParams};
use crate::status::StatusAggregator;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use fleetdeck_common::{
    CommandRunner, Error, Geometry, Prober, ScreenPosition, SessionKind, SizePreset,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const UNIT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);
const FLEET_SCRIPT_TIMEOUT: Duration = Duration::from_secs(90);

/// Shared state behind every handler
pub struct AppState {
    pub config: DaemonConfig,
    pub registry: Arc<FleetRegistry>,
    pub presets: Arc<PresetStore>,
    pub bridge: Arc<WmBridge>,
    pub sessions: SessionManager,
    pub aggregator: Arc<StatusAggregator>,
    pub prober: Arc<Prober>,
    pub runner: Arc<dyn CommandRunner>,
    /// `status_update` events from the broadcaster
    pub events: broadcast::Sender<serde_json::Value>,
    /// `log_message` events from the tracing layer
    pub logs: broadcast::Sender<serde_json::Value>,
}

/// API server
#[derive(Clone)]
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/status", get(status_handler))
            .route("/api/status/refresh", post(refresh_handler))
            .route("/api/scan", get(scan_handler))
            .route("/api/vm/:id/start", post(vm_start_handler))
            .route("/api/vm/:id/stop", post(vm_stop_handler))
            .route("/api/fleet/start", post(fleet_start_handler))
            .route("/api/fleet/stop", post(fleet_stop_handler))
            .route("/api/fleet/morning", post(fleet_morning_handler))
            .route("/api/fleet/fastup", post(fleet_fastup_handler))
            .route("/api/connect", post(connect_handler))
            .route("/api/disconnect", post(disconnect_handler))
            .route("/api/connections", get(connections_handler))
            .route("/api/connections/:id/kill", post(kill_handler))
            .route("/api/config", get(config_handler).post(config_update_handler))
            .route("/api/presets", get(presets_handler).post(preset_add_handler))
            .route("/api/presets/:key", put(preset_edit_handler).delete(preset_delete_handler))
            .route("/api/workspaces/assign", post(assign_handler))
            .route("/api/workspaces/batch-assign", post(batch_assign_handler))
            .route("/api/workspaces/state", get(workspace_state_handler))
            .route("/ws", get(websocket_handler))
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("Fleetdeck API listening on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Error wrapper mapping the taxonomy onto HTTP status codes
#[derive(Debug)]
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::AlreadyConnected { .. } => StatusCode::CONFLICT,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::SpawnFailed(_) => StatusCode::BAD_GATEWAY,
            Error::CommandTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "fleetdeckd",
        "version": fleetdeck_common::VERSION,
    }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.aggregator.fleet_status().await)
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.aggregator.refresh();
    Json(state.aggregator.fleet_status().await)
}

#[derive(Debug, Deserialize)]
struct ScanQuery {
    #[serde(default)]
    base: Option<String>,
    #[serde(default = "default_scan_start")]
    start: u8,
    #[serde(default = "default_scan_end")]
    end: u8,
}

fn default_scan_start() -> u8 {
    1
}

fn default_scan_end() -> u8 {
    254
}

/// Sweep a /24 for hosts exposing remote-access services.
async fn scan_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScanQuery>,
) -> ApiResult<impl IntoResponse> {
    if query.start > query.end {
        return Err(Error::InvalidInput("start must not exceed end".to_string()).into());
    }
    let base = query
        .base
        .unwrap_or_else(|| state.config.probe.network_base.clone());
    let hosts = state.prober.scan_range(&base, query.start, query.end).await;
    info!("Scan of {}.{}-{} found {} hosts", base, query.start, query.end, hosts.len());
    Ok(Json(hosts))
}

/// `systemctl --user start/stop` for the machine's backing unit.
async fn unit_action(state: &AppState, id: &str, action: &str) -> ApiResult<Json<serde_json::Value>> {
    // 404 before touching systemctl
    state.registry.get(id)?;
    let unit = format!("{}{}", state.config.session.unit_prefix, id);
    let args = vec!["--user".to_string(), action.to_string(), unit.clone()];
    let output = state
        .runner
        .run("systemctl", &args, UNIT_ACTION_TIMEOUT)
        .await?;
    if !output.success {
        warn!("systemctl {} {} failed: {}", action, unit, output.stderr.trim());
        return Err(Error::SpawnFailed(format!(
            "systemctl {} {}: {}",
            action,
            unit,
            output.stderr.trim()
        ))
        .into());
    }
    state.aggregator.refresh();
    Ok(Json(serde_json::json!({ "ok": true, "unit": unit, "action": action })))
}

async fn vm_start_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    unit_action(&state, &id, "start").await
}

async fn vm_stop_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    unit_action(&state, &id, "stop").await
}

/// Run the fleet script (`up`/`down`) for whole-fleet power actions.
async fn fleet_action(state: &AppState, action: &str) -> ApiResult<Json<serde_json::Value>> {
    let script = state.config.fleet.script_path.clone();
    let args = vec![action.to_string()];
    let output = state.runner.run(&script, &args, FLEET_SCRIPT_TIMEOUT).await?;
    if !output.success {
        error!("Fleet script {} failed: {}", action, output.stderr.trim());
        return Err(Error::SpawnFailed(format!(
            "{} {}: {}",
            script,
            action,
            output.stderr.trim()
        ))
        .into());
    }
    state.aggregator.refresh();
    Ok(Json(serde_json::json!({ "ok": true, "action": action })))
}

async fn fleet_start_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    fleet_action(&state, "up").await
}

async fn fleet_stop_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    fleet_action(&state, "down").await
}

/// Staged morning bring-up (script decides the order and pacing).
async fn fleet_morning_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    fleet_action(&state, "morning").await
}

/// Parallel bring-up without the staging delays.
async fn fleet_fastup_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    fleet_action(&state, "fastup").await
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    address: String,
    #[serde(default = "default_kind")]
    kind: SessionKind,
    /// `"WxH"` or the key of a stored preset
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    workspace: Option<i64>,
    #[serde(default)]
    position: Option<ScreenPosition>,
    #[serde(default)]
    scratchpad: Option<bool>,
}

fn default_kind() -> SessionKind {
    SessionKind::Rdp
}

async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.address.trim().is_empty() {
        return Err(Error::InvalidInput("address is required".to_string()).into());
    }

    // Registry entry for this address fills in anything the request
    // leaves unset
    let entry = state
        .registry
        .list()
        .into_values()
        .find(|m| m.address == req.address);

    let (username, password) = match &entry {
        Some(m) => split_credentials(&m.credentials, &state.config),
        None => (
            state.config.fleet.username.clone(),
            state.config.fleet.password.clone(),
        ),
    };

    let geometry = match &req.resolution {
        Some(spec) => resolve_resolution(&state.presets, spec)?,
        None => entry
            .as_ref()
            .map(|m| m.geometry)
            .unwrap_or(Geometry::new(1920, 1080)),
    };

    let params = SessionParams {
        username,
        password,
        geometry,
        workspace: req.workspace.or(entry.as_ref().map(|m| m.workspace)),
        position: req
            .position
            .or(entry.as_ref().map(|m| m.position))
            .unwrap_or_default(),
        scratchpad: req
            .scratchpad
            .or(entry.as_ref().map(|m| m.scratchpad))
            .unwrap_or(false),
    };

    let id = state.sessions.connect(&req.address, req.kind, params)?;
    state.aggregator.refresh();
    Ok(Json(serde_json::json!({ "session_id": id })))
}

/// `"WxH"` literal, or a preset key lookup.
fn resolve_resolution(presets: &PresetStore, spec: &str) -> Result<Geometry, Error> {
    if let Ok(geometry) = spec.parse::<Geometry>() {
        return Ok(geometry);
    }
    let preset = presets.get(&normalize_key(spec))?;
    Ok(Geometry::new(preset.width, preset.height))
}

fn split_credentials(credentials: &str, config: &DaemonConfig) -> (String, String) {
    match credentials.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (
            config.fleet.username.clone(),
            config.fleet.password.clone(),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct DisconnectRequest {
    address: String,
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DisconnectRequest>,
) -> ApiResult<impl IntoResponse> {
    state.sessions.disconnect(&req.address).await?;
    state.aggregator.refresh();
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn connections_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.sessions.list_active())
}

async fn kill_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.sessions.kill(&id).await?;
    state.aggregator.refresh();
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn config_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "machines": state.registry.list(),
        "listen_port": state.config.listen_port,
        "network_base": state.config.probe.network_base,
    }))
}

#[derive(Debug, Deserialize)]
struct ConfigUpdateRequest {
    id: String,
    #[serde(flatten)]
    patch: MachinePatch,
}

async fn config_update_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConfigUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    let updated = state.registry.update(&req.id, req.patch)?;
    state.aggregator.refresh();
    Ok(Json(updated))
}

async fn presets_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.presets.all())
}

#[derive(Debug, Deserialize)]
struct PresetRequest {
    name: String,
    width: u32,
    height: u32,
    #[serde(default)]
    description: String,
}

async fn preset_add_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PresetRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = state
        .presets
        .add(&req.name, req.width, req.height, &req.description)?;
    Ok(Json(serde_json::json!({ "key": key })))
}

async fn preset_edit_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<PresetRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .presets
        .edit(&key, &req.name, req.width, req.height, &req.description)?;
    Ok(Json(ResolutionPreset {
        name: req.name,
        width: req.width,
        height: req.height,
        description: req.description,
    }))
}

async fn preset_delete_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.presets.delete(&key)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    /// Window title prefix to match
    title: String,
    workspace: i64,
    #[serde(default)]
    position: ScreenPosition,
    #[serde(default)]
    size: SizePreset,
}

async fn assign_one(state: &AppState, req: &AssignRequest) -> Result<(), Error> {
    if req.title.trim().is_empty() {
        return Err(Error::InvalidInput("title is required".to_string()));
    }
    let geometry = state
        .bridge
        .resolve_geometry(req.workspace, req.size, req.position)
        .await?;
    let placed = state
        .bridge
        .place_window(&req.title, req.workspace, req.position, geometry)
        .await;
    if !placed {
        return Err(Error::PlacementFailed(format!(
            "window '{}' not placed on workspace {}",
            req.title, req.workspace
        )));
    }
    Ok(())
}

async fn assign_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<impl IntoResponse> {
    assign_one(&state, &req).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct BatchAssignRequest {
    assignments: Vec<AssignRequest>,
}

/// Place several windows in sequence; each outcome is reported
/// independently.
async fn batch_assign_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchAssignRequest>,
) -> impl IntoResponse {
    let mut results = Vec::with_capacity(req.assignments.len());
    for assignment in &req.assignments {
        let outcome = assign_one(&state, assignment).await;
        if let Err(e) = &outcome {
            warn!("Batch assign '{}' failed: {}", assignment.title, e);
        }
        results.push(serde_json::json!({
            "title": assignment.title,
            "ok": outcome.is_ok(),
            "error": outcome.err().map(|e| e.to_string()),
        }));
    }
    Json(serde_json::json!({ "results": results }))
}

async fn workspace_state_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "windows": state.bridge.list_windows().await,
        "monitors": state.bridge.list_monitors().await,
    }))
}

async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state).await;
    })
}

/// Push `status_update` and `log_message` events; answer explicit
/// `request_status` messages with a fresh snapshot.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = state.events.subscribe();
    let mut logs = state.logs.subscribe();
    debug!("WebSocket client connected");

    // Initial snapshot so the client renders without waiting a cycle
    if send_status(&mut socket, &state).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(body) => {
                    if send_json(&mut socket, &body).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("WebSocket client lagged {} status events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            log = logs.recv() => match log {
                Ok(body) => {
                    if send_json(&mut socket, &body).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if wants_status(&text) && send_status(&mut socket, &state).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket receive error: {}", e);
                    break;
                }
            },
        }
    }
    debug!("WebSocket client disconnected");
}

/// Accepts the bare string or a `{"action": "request_status"}` body.
fn wants_status(text: &str) -> bool {
    if text.trim() == "request_status" {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(|a| a == "request_status"))
        .unwrap_or(false)
}

async fn send_status(socket: &mut WebSocket, state: &AppState) -> Result<(), axum::Error> {
    let status = state.aggregator.fleet_status().await;
    let body = serde_json::json!({
        "event": "status_update",
        "data": status,
    });
    send_json(socket, &body).await
}

async fn send_json(socket: &mut WebSocket, body: &serde_json::Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(body.to_string())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClientCommand, ClientLauncher, SessionTiming};
    use crate::status::StatusAggregator;
    use fleetdeck_common::{CmdOutput, Result};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;

    /// Runner that records every invocation and reports success.
    struct RecordingRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl CommandRunner for RecordingRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            _timeout: Duration,
        ) -> BoxFuture<'static, Result<CmdOutput>> {
            self.calls.lock().push((program.to_string(), args.to_vec()));
            Box::pin(async move { Ok(CmdOutput::ok("")) })
        }
    }

    struct NoLauncher;

    impl ClientLauncher for NoLauncher {
        fn command_variants(
            &self,
            _address: &str,
            _kind: SessionKind,
            _params: &SessionParams,
        ) -> Vec<ClientCommand> {
            Vec::new()
        }
    }

    fn test_state(dir: &tempfile::TempDir) -> (Arc<AppState>, Arc<RecordingRunner>) {
        let recorder = Arc::new(RecordingRunner {
            calls: Mutex::new(Vec::new()),
        });
        let runner: Arc<dyn CommandRunner> = recorder.clone();
        let config = DaemonConfig::default();
        let registry = Arc::new(FleetRegistry::load(dir.path().join("fleet.toml")));
        let presets = Arc::new(PresetStore::load(dir.path().join("presets.json")));
        let prober = Arc::new(Prober::new(runner.clone()));
        let bridge = Arc::new(WmBridge::new(runner.clone(), &config.wm));
        let sessions = SessionManager::new(Box::new(NoLauncher), None, SessionTiming::default());
        let aggregator = Arc::new(StatusAggregator::new(
            registry.clone(),
            prober.clone(),
            bridge.clone(),
            sessions.clone(),
            runner.clone(),
            config.session.unit_prefix.clone(),
        ));
        let (events, _) = tokio::sync::broadcast::channel(8);
        let (logs, _) = tokio::sync::broadcast::channel(8);
        let state = Arc::new(AppState {
            config,
            registry,
            presets,
            bridge,
            sessions,
            aggregator,
            prober,
            runner,
            events,
            logs,
        });
        (state, recorder)
    }

    #[tokio::test]
    async fn test_fleet_actions_invoke_script() {
        let dir = tempfile::tempdir().unwrap();
        let (state, recorder) = test_state(&dir);

        fleet_action(&state, "up").await.unwrap();
        fleet_action(&state, "morning").await.unwrap();
        fleet_action(&state, "fastup").await.unwrap();

        let calls = recorder.calls.lock().clone();
        let script: Vec<_> = calls.iter().filter(|(p, _)| p == "./fleetdeck").collect();
        assert_eq!(script.len(), 3);
        assert_eq!(script[0].1, vec!["up"]);
        assert_eq!(script[1].1, vec!["morning"]);
        assert_eq!(script[2].1, vec!["fastup"]);
    }

    #[test]
    fn test_resolve_resolution_literal_and_preset() {
        let dir = tempfile::tempdir().unwrap();
        let presets = PresetStore::load(dir.path().join("presets.json"));

        assert_eq!(
            resolve_resolution(&presets, "1717x1402").unwrap(),
            Geometry::new(1717, 1402)
        );
        assert_eq!(
            resolve_resolution(&presets, "Full HD").unwrap(),
            Geometry::new(1920, 1080)
        );
        assert!(matches!(
            resolve_resolution(&presets, "no_such_preset").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_split_credentials() {
        let config = DaemonConfig::default();
        assert_eq!(
            split_credentials("admin:hunter2", &config),
            ("admin".to_string(), "hunter2".to_string())
        );
        // Malformed entries fall back to the fleet account
        assert_eq!(
            split_credentials("garbage", &config),
            ("deck".to_string(), "changeme".to_string())
        );
    }

    #[test]
    fn test_request_status_message_forms() {
        assert!(wants_status("request_status"));
        assert!(wants_status(" request_status \n"));
        assert!(wants_status(r#"{"action":"request_status"}"#));
        assert!(!wants_status(r#"{"action":"other"}"#));
        assert!(!wants_status("hello"));
    }
}

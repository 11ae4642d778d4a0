use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    dispatch::IrDispatcher,
    error::DiscoveryError,
    netdetect::{Resolver, SubnetPrefix},
    scanner::{ScanConfig, ScanStopper, Scanner},
    store::DeviceStore,
    types::{DeviceRecord, ScanEvent, ScanSummary},
    validate::{check_port, parse_ipv4, DEFAULT_PORT},
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>, // progress/results of the current scan
    scanner: Scanner,
    store: DeviceStore,
    dispatcher: IrDispatcher,
}

impl AppState {
    pub fn new(scanner: Scanner, store: DeviceStore, dispatcher: IrDispatcher) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            scanner,
            store,
            dispatcher,
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    status: Status,
    results: Option<Vec<DeviceRecord>>,
    stopper: Option<ScanStopper>,
    session: u64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    Done,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Status {
    pub state: ScanState,
    #[serde(flatten)]
    pub summary: ScanSummary,
    pub progress: f64,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub quick: bool,
    /// Skip detection and sweep this /24.
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub port: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub ip: String,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    /// Probe before storing. Off when keeping a fresh scan result.
    #[serde(default = "default_true")]
    pub verify: bool,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub code: String,
}

fn default_true() -> bool {
    true
}

/// Maps library errors onto HTTP statuses.
pub struct ApiError(DiscoveryError);

impl From<DiscoveryError> for ApiError {
    fn from(e: DiscoveryError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DiscoveryError::InvalidAddress(_)
            | DiscoveryError::InvalidPort(_)
            | DiscoveryError::InvalidIrCode(_) => StatusCode::BAD_REQUEST,
            DiscoveryError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan).delete(delete_scan))
        .route("/results", get(get_results))
        .route("/devices", get(list_devices).post(add_device))
        .route("/devices/check", post(check_device))
        .route("/devices/refresh", post(refresh_devices))
        .route("/devices/{id}", delete(remove_device))
        .route("/devices/{id}/command", post(send_command))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving API on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    (StatusCode::OK, Json(s.status.clone()))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match s.results.as_ref() {
        Some(res) => (StatusCode::OK, Json(res.clone())).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn scanner_for(app: &AppState, req: &ScanRequest) -> ApiResult<Scanner> {
    let mut config = if req.quick { ScanConfig::quick() } else { ScanConfig::thorough() };
    if let Some(c) = req.concurrency {
        config.concurrency = c;
    }
    if let Some(ms) = req.timeout_ms {
        config.probe_timeout = Duration::from_millis(ms);
    }
    if let Some(p) = req.port {
        config.port = check_port(p)?;
    }
    let scanner = app.scanner.with_config(config);
    Ok(match req.subnet.as_deref() {
        Some(s) => {
            let prefix: SubnetPrefix = s
                .parse()
                .map_err(|e: anyhow::Error| DiscoveryError::InvalidAddress(e.to_string()))?;
            scanner.with_resolver(Resolver::Fixed(prefix))
        }
        None => scanner,
    })
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> ApiResult<impl IntoResponse> {
    let scanner = scanner_for(&app, &req)?;
    let mut handle = scanner.start();

    let session = {
        let mut s = app.inner.write().await;
        // Starting a new scan stops the previous one.
        if let Some(old) = s.stopper.take() {
            old.stop();
        }
        s.session += 1;
        s.status = Status {
            state: ScanState::Running,
            ..Status::default()
        };
        s.results = None;
        s.stopper = Some(handle.stopper());
        s.session
    };

    let app2 = app.clone();
    tokio::spawn(async move {
        while let Some(ev) = handle.next_event().await {
            let mut s = app2.inner.write().await;
            if s.session != session {
                continue;
            }
            match ev {
                ScanEvent::ProbeStarted { .. } => {}
                ScanEvent::DeviceFound { record } => {
                    // Partial results are visible while the scan runs.
                    let found = {
                        let partial = s.results.get_or_insert_with(Vec::new);
                        partial.push(record);
                        partial.len() as u64
                    };
                    s.status.summary.found = found;
                }
                ScanEvent::Progress { settled, total, fraction } => {
                    s.status.summary.scanned_done = settled;
                    s.status.summary.scanned_total = total;
                    s.status.progress = fraction;
                }
                ScanEvent::Completed { cancelled, .. } => {
                    s.status.summary.cancelled = cancelled;
                }
            }
        }

        let res = handle.finish().await;
        let mut s = app2.inner.write().await;
        if s.session != session {
            return;
        }
        s.stopper = None;
        match res {
            Ok(records) => {
                s.status.summary.found = records.len() as u64;
                s.status.state = if s.status.summary.cancelled {
                    ScanState::Stopped
                } else {
                    ScanState::Done
                };
                s.results = Some(records);
            }
            Err(e) => {
                s.status.state = ScanState::Failed;
                error!("scan error: {e}");
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "state": ScanState::Running }))))
}

async fn delete_scan(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match s.stopper.as_ref() {
        Some(stopper) => {
            stopper.stop();
            StatusCode::ACCEPTED
        }
        None => StatusCode::CONFLICT,
    }
}

async fn list_devices(State(app): State<AppState>) -> ApiResult<Json<Vec<DeviceRecord>>> {
    Ok(Json(app.store.load_devices().await?))
}

fn target(ip: &str, port: Option<u32>) -> ApiResult<(Ipv4Addr, u16)> {
    let ip = parse_ipv4(ip)?;
    let port = match port {
        Some(p) => check_port(p)?,
        None => DEFAULT_PORT,
    };
    Ok((ip, port))
}

async fn add_device(
    State(app): State<AppState>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<Response> {
    let (ip, port) = target(&req.ip, req.port)?;
    let record = if req.verify {
        match app.scanner.create_device_from_ip(ip, port).await {
            Some(r) => r,
            None => {
                let body = json!({ "error": format!("no player answering at {ip}:{port}") });
                return Ok((StatusCode::NOT_FOUND, Json(body)).into_response());
            }
        }
    } else {
        DeviceRecord::discovered(ip, port)
    };
    let record = record.with_name(req.name.unwrap_or_default());
    app.store.add_device(record.clone()).await?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

async fn check_device(
    State(app): State<AppState>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<impl IntoResponse> {
    let (ip, port) = target(&req.ip, req.port)?;
    let online = app.scanner.check_device_availability(ip, port).await;
    Ok(Json(json!({ "id": crate::types::device_id(ip, port), "online": online })))
}

async fn refresh_devices(State(app): State<AppState>) -> ApiResult<Json<Vec<DeviceRecord>>> {
    Ok(Json(app.store.refresh_status(&app.scanner).await?))
}

async fn remove_device(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    Ok(if app.store.remove_device(&id).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

async fn send_command(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> ApiResult<Response> {
    let Some(dev) = app.store.find(&id).await? else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let ok = app.dispatcher.send(dev.ip_address, dev.port, &req.code).await?;
    Ok(Json(json!({ "ok": ok })).into_response())
}

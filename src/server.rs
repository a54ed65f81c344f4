use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::StoreError;
use crate::store::{ScanStore, SqliteStore};
use crate::types::{ImportDocument, ImportSummary, ScanId, ScanJob, ServerId, Settings};

#[derive(Clone)]
pub struct AppState {
    store: Arc<SqliteStore>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub settings: Settings,
    pub active: Vec<ScanJob>,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub server_id: ServerId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanAccepted {
    pub scan_id: ScanId,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub scan_id: ScanId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub canceled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PortsResponse {
    pub server_id: ServerId,
    pub ports: Vec<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueAllResponse {
    pub queued: usize,
}

/// Control API routes, mounted under `/api`.
pub fn router(store: Arc<SqliteStore>) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/scan/cancel", post(post_cancel))
        .route("/scan/run-periodic", post(post_queue_all))
        .route("/ports/import", post(post_import))
        .route("/servers/{id}/ports", get(get_ports))
        .with_state(AppState { store });

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, store: Arc<SqliteStore>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "control API listening");
    axum::serve(listener, router(store)).await?;
    Ok(())
}

struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::InvalidImport(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn get_status(State(app): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let settings = app.store.get_settings().await?;
    let active = app.store.list_pending_jobs().await?;
    Ok(Json(StatusResponse { settings, active }))
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (scan_id, created) = app.store.request_scan(req.server_id).await?;
    let status = if created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ScanAccepted { scan_id, created })))
}

async fn post_cancel(
    State(app): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    let canceled = app.store.cancel_scan(req.scan_id).await?;
    Ok(Json(CancelResponse { canceled }))
}

async fn get_ports(
    State(app): State<AppState>,
    Path(server_id): Path<ServerId>,
) -> Result<Json<PortsResponse>, ApiError> {
    let ports = app.store.list_ports(server_id).await?;
    Ok(Json(PortsResponse { server_id, ports }))
}

async fn post_queue_all(State(app): State<AppState>) -> Result<Json<QueueAllResponse>, ApiError> {
    let queued = app.store.queue_all().await?;
    Ok(Json(QueueAllResponse { queued }))
}

async fn post_import(
    State(app): State<AppState>,
    Json(doc): Json<ImportDocument>,
) -> Result<Json<ImportSummary>, ApiError> {
    let summary = app.store.import_servers(doc.into_servers()).await?;
    Ok(Json(summary))
}

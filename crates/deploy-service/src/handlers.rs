//! API handlers for the Deploy Service

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use paygate_common::{DeployError, DeployedResource, ErrorKind, OperationResult};
use std::sync::Arc;
use tracing::info;

use crate::{
    models::{
        CountersUpdate, DeployRequest, EventsResponse, LogsQuery, LogsResponse, RedeployRequest,
        ResourceListResponse,
    },
    orchestrator::Orchestrator,
    reconciler::{ReconcileReport, Reconciler},
    tester::TestSuiteReport,
};

/// Shared application state
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub reconciler: Arc<Reconciler>,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        ApiError {
            status: status_for(err.kind()),
            message: err.detail(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::User => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Environment => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Build => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Runtime | ErrorKind::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Operation outcomes are returned as-is; only the status code differs
fn respond(result: OperationResult, success: StatusCode) -> (StatusCode, Json<OperationResult>) {
    let status = match (result.success, result.error_kind) {
        (true, _) => success,
        (false, Some(kind)) => status_for(kind),
        (false, None) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(result))
}

/// Health check
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "deploy-service",
        "registry_degraded": state.orchestrator.registry().is_degraded()
    }))
}

/// List every known resource
pub async fn list_resources_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ResourceListResponse>, ApiError> {
    let resources = state.orchestrator.list().await?;

    Ok(Json(ResourceListResponse {
        total: resources.len(),
        resources,
    }))
}

/// Deploy a new resource
pub async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DeployRequest>,
) -> impl IntoResponse {
    info!("Deploy requested: {} ({} files)", payload.config.name, payload.files.len());

    let result = state.orchestrator.deploy(payload.files, payload.config).await;
    respond(result, StatusCode::CREATED)
}

/// Get resource status, reconciled against the engine
pub async fn get_resource_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeployedResource>, ApiError> {
    let resource = state.orchestrator.refresh(&id).await?;
    Ok(Json(resource))
}

/// Redeploy an existing resource
pub async fn redeploy_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<RedeployRequest>,
) -> impl IntoResponse {
    info!("Redeploy requested: {} ({} files)", id, payload.files.len());

    let result = state
        .orchestrator
        .redeploy(&id, payload.files, payload.config)
        .await;
    respond(result, StatusCode::OK)
}

/// Remove a resource with its container and image
pub async fn remove_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.remove(&id).await, StatusCode::OK)
}

pub async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.stop(&id).await, StatusCode::OK)
}

pub async fn restart_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.restart(&id).await, StatusCode::OK)
}

/// Tail of the container output
pub async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let tail = query.tail();
    let logs = state.orchestrator.logs(&id, tail).await?;

    Ok(Json(LogsResponse {
        resource_id: id,
        tail,
        logs,
    }))
}

/// Progress log for a resource
pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<EventsResponse> {
    let events = state.orchestrator.events(&id).await;
    Json(EventsResponse {
        resource_id: id,
        events,
    })
}

/// Run the post-deploy test suite and wait for its report
pub async fn test_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TestSuiteReport>, ApiError> {
    info!("Post-deploy tests requested: {}", id);

    let report = state.orchestrator.test(&id).await?;
    Ok(Json(report))
}

/// Merge request and revenue counters reported by the ledger
pub async fn counters_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<CountersUpdate>,
) -> Result<Json<DeployedResource>, ApiError> {
    let resource = state
        .orchestrator
        .update_counters(&id, update.request_count, update.revenue_usdc)
        .await?;
    Ok(Json(resource))
}

/// Run one reconciliation pass now
pub async fn reconcile_handler(State(state): State<Arc<AppState>>) -> Json<ReconcileReport> {
    Json(state.reconciler.reconcile_once().await)
}

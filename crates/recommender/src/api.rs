//! HTTP API: health, metrics, input ingestion and published statuses

use crate::state::{ControllerRegistration, ControllerRegistry, StatusStore};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use recommender_lib::{
    health::{ComponentStatus, HealthRegistry},
    ContainerId, ContainerMetricsSnapshot, InputEvent, InputSender, OomInfo, PodId, PodSpec,
    Resources, VpaId, VpaObject,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub input: InputSender,
    pub statuses: Arc<StatusStore>,
    pub controllers: Arc<ControllerRegistry>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        input: InputSender,
        statuses: Arc<StatusStore>,
        controllers: Arc<ControllerRegistry>,
    ) -> Self {
        Self {
            health_registry,
            input,
            statuses,
            controllers,
        }
    }
}

/// Body of `POST /api/v1/containers`
#[derive(Debug, Deserialize)]
pub struct ContainerUpsert {
    pub id: ContainerId,
    #[serde(default)]
    pub request: Resources,
}

/// 200 while operational, 503 when a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Hand an event to the recommender. 503 when the queue is full or the
/// recommender has stopped.
fn enqueue(state: &AppState, event: InputEvent) -> Response {
    match state.input.try_send(event) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(TrySendError::Full(_)) => error_response(StatusCode::SERVICE_UNAVAILABLE, "input queue is full"),
        Err(TrySendError::Closed(_)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "recommender is not running")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn upsert_pod(State(state): State<Arc<AppState>>, Json(pod): Json<PodSpec>) -> Response {
    enqueue(&state, InputEvent::UpsertPod(pod))
}

async fn delete_pod(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    enqueue(&state, InputEvent::DeletePod(PodId::new(namespace, name)))
}

async fn upsert_container(
    State(state): State<Arc<AppState>>,
    Json(container): Json<ContainerUpsert>,
) -> Response {
    enqueue(
        &state,
        InputEvent::UpsertContainer {
            id: container.id,
            request: container.request,
        },
    )
}

async fn upsert_vpa(State(state): State<Arc<AppState>>, Json(vpa): Json<VpaObject>) -> Response {
    enqueue(&state, InputEvent::UpsertVpa(vpa))
}

async fn delete_vpa(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    enqueue(&state, InputEvent::DeleteVpa(VpaId::new(namespace, name)))
}

async fn push_metrics(
    State(state): State<Arc<AppState>>,
    Json(snapshots): Json<Vec<ContainerMetricsSnapshot>>,
) -> Response {
    if snapshots.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }
    enqueue(&state, InputEvent::Metrics(snapshots))
}

async fn push_ooms(State(state): State<Arc<AppState>>, Json(ooms): Json<Vec<OomInfo>>) -> Response {
    if ooms.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }
    enqueue(&state, InputEvent::Oom(ooms))
}

async fn register_controller(
    State(state): State<Arc<AppState>>,
    Path((namespace, kind, name)): Path<(String, String, String)>,
    Json(registration): Json<ControllerRegistration>,
) -> StatusCode {
    state
        .controllers
        .register(&namespace, &kind, &name, registration);
    StatusCode::NO_CONTENT
}

async fn remove_controller(
    State(state): State<Arc<AppState>>,
    Path((namespace, kind, name)): Path<(String, String, String)>,
) -> StatusCode {
    if state.controllers.remove(&namespace, &kind, &name) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn vpa_status(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    match state.statuses.get(&VpaId::new(namespace, name)) {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "VPA status not found"),
    }
}

async fn recommendations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.statuses.list())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/pods", post(upsert_pod))
        .route("/api/v1/pods/:namespace/:name", delete(delete_pod))
        .route("/api/v1/containers", post(upsert_container))
        .route("/api/v1/vpas", post(upsert_vpa))
        .route("/api/v1/vpas/:namespace/:name", delete(delete_vpa))
        .route("/api/v1/vpas/:namespace/:name/status", get(vpa_status))
        .route("/api/v1/metrics", post(push_metrics))
        .route("/api/v1/ooms", post(push_ooms))
        .route(
            "/api/v1/controllers/:namespace/:kind/:name",
            put(register_controller).delete(remove_controller),
        )
        .route("/api/v1/recommendations", get(recommendations))
        .with_state(state)
}

pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

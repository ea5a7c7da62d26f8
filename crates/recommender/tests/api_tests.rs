//! Integration tests for the recommender HTTP API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use recommender_lib::{
    health::{components, HealthRegistry},
    input_channel, InputEvent, RecommenderConfig, RecommenderLoopBuilder,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;
use vpa_recommender::api::{create_router, AppState};
use vpa_recommender::state::{ControllerRegistry, StatusStore};

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    receiver: mpsc::Receiver<InputEvent>,
}

async fn setup_test_app(queue_capacity: usize) -> TestApp {
    let health_registry = HealthRegistry::with_recommender_components().await;
    let (input, receiver) = input_channel(queue_capacity);
    let state = Arc::new(AppState::new(
        health_registry,
        input,
        Arc::new(StatusStore::new()),
        Arc::new(ControllerRegistry::new()),
    ));
    TestApp {
        router: create_router(state.clone()),
        state,
        receiver,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn vpa_body() -> Value {
    json!({
        "id": {"namespace": "default", "vpa_name": "web"},
        "selector": "app=web",
        "updateMode": "Auto",
        "creationTime": "2024-03-01T00:00:00Z"
    })
}

fn pod_body() -> Value {
    json!({
        "id": {"namespace": "default", "pod_name": "web-1"},
        "labels": {"app": "web"},
        "phase": "running",
        "containers": [{"name": "app", "request": {"cpu": 500, "memory": 536870912}}]
    })
}

fn metrics_body(minutes: i64) -> Value {
    let start = chrono::Utc::now() - chrono::Duration::minutes(minutes);
    let snapshots: Vec<Value> = (0..minutes)
        .map(|minute| {
            json!({
                "id": {"pod_id": {"namespace": "default", "pod_name": "web-1"}, "container_name": "app"},
                "snapshot_time": (start + chrono::Duration::minutes(minute)).to_rfc3339(),
                "window_secs": 60,
                "usage": {"cpu": 200, "memory": 314572800}
            })
        })
        .collect();
    Value::Array(snapshots)
}

#[tokio::test]
async fn test_healthz_reports_component_status() {
    let app = setup_test_app(8).await;
    let (status, health) = send(&app.router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");

    app.state
        .health_registry
        .set_degraded(components::CHECKPOINT_STORE, "1 checkpoint failed")
        .await;
    let (status, health) = send(&app.router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");

    app.state
        .health_registry
        .set_unhealthy(components::FEEDER, "input closed")
        .await;
    let (status, health) = send(&app.router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_first_iteration() {
    let app = setup_test_app(8).await;
    let (status, readiness) = send(&app.router, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    app.state
        .health_registry
        .mark_iteration_complete(chrono::Utc::now())
        .await;
    let (status, readiness) = send(&app.router, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup_test_app(8).await;
    // Make sure the recommender metrics exist in the registry
    recommender_lib::RecommenderMetrics::new().observe_iteration_latency(0.01);

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("vpa_recommender_iteration_latency_seconds"));
}

#[tokio::test]
async fn test_ingestion_enqueues_events() {
    let mut app = setup_test_app(16).await;

    let (status, _) = send(&app.router, "POST", "/api/v1/vpas", Some(vpa_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = send(&app.router, "POST", "/api/v1/pods", Some(pod_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = send(
        &app.router,
        "POST",
        "/api/v1/containers",
        Some(json!({
            "id": {"pod_id": {"namespace": "default", "pod_name": "web-1"}, "container_name": "sidecar"},
            "request": {"cpu": 100}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = send(&app.router, "POST", "/api/v1/metrics", Some(metrics_body(2))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = send(
        &app.router,
        "POST",
        "/api/v1/ooms",
        Some(json!([{
            "container": {"pod_id": {"namespace": "default", "pod_name": "web-1"}, "container_name": "app"},
            "timestamp": "2024-03-01T00:00:00Z",
            "requested_memory": 536870912
        }])),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = send(&app.router, "DELETE", "/api/v1/pods/default/web-1", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = send(&app.router, "DELETE", "/api/v1/vpas/default/web", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut kinds = Vec::new();
    while let Ok(event) = app.receiver.try_recv() {
        kinds.push(match event {
            InputEvent::UpsertVpa(_) => "upsert_vpa",
            InputEvent::DeleteVpa(_) => "delete_vpa",
            InputEvent::UpsertPod(_) => "upsert_pod",
            InputEvent::DeletePod(_) => "delete_pod",
            InputEvent::UpsertContainer { .. } => "upsert_container",
            InputEvent::Metrics(snapshots) => {
                assert_eq!(snapshots.len(), 2);
                "metrics"
            }
            InputEvent::Oom(_) => "oom",
        });
    }
    assert_eq!(
        kinds,
        vec![
            "upsert_vpa",
            "upsert_pod",
            "upsert_container",
            "metrics",
            "oom",
            "delete_pod",
            "delete_vpa"
        ]
    );
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let app = setup_test_app(8).await;
    let (status, _) = send(&app.router, "POST", "/api/v1/vpas", Some(json!({"selector": "app=web"}))).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_full_queue_returns_503() {
    let app = setup_test_app(1).await;
    let (status, _) = send(&app.router, "POST", "/api/v1/vpas", Some(vpa_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&app.router, "POST", "/api/v1/pods", Some(pod_body())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "input queue is full");
}

#[tokio::test]
async fn test_controller_registration() {
    let app = setup_test_app(8).await;
    let uri = "/api/v1/controllers/default/Deployment/web";
    let (status, _) = send(&app.router, "PUT", uri, Some(json!({"apiVersion": "apps/v1"}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(app.state.controllers.len(), 1);

    let (status, _) = send(&app.router, "DELETE", uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app.router, "DELETE", uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_vpa_status_is_404() {
    let app = setup_test_app(8).await;
    let (status, body) = send(&app.router, "GET", "/api/v1/vpas/default/missing/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "VPA status not found");

    let (status, body) = send(&app.router, "GET", "/api/v1/recommendations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_recommendation_published_after_iteration() {
    let TestApp {
        router,
        state,
        receiver,
    } = setup_test_app(16).await;

    for (uri, body) in [
        ("/api/v1/vpas", vpa_body()),
        ("/api/v1/pods", pod_body()),
        ("/api/v1/metrics", metrics_body(10)),
    ] {
        let (status, _) = send(&router, "POST", uri, Some(body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let mut recommender_loop = RecommenderLoopBuilder::new(RecommenderConfig::default())
        .input(receiver)
        .status_writer(state.statuses.clone())
        .controllers(state.controllers.clone())
        .health(state.health_registry.clone())
        .build()
        .unwrap();
    let summary = recommender_loop.run_iteration().await;
    assert_eq!(summary.recommendations, 1);

    let (status, body) = send(&router, "GET", "/api/v1/vpas/default/web/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["podCount"], 1);
    let app = &body["recommendation"]["containerRecommendations"][0];
    assert_eq!(app["containerName"], "app");
    assert!(app["target"]["cpu"].as_str().unwrap().ends_with('m'));

    let (status, body) = send(&router, "GET", "/api/v1/recommendations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(&router, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
}

//! Health and liveness endpoints.

mod common;

use axum::http::StatusCode;
use common::{get, json_body, TestApp};
use herald_delivery::storage::mock::MockOperation;

#[tokio::test]
async fn health_check_returns_success_when_store_answers() {
    let app = TestApp::new();

    let response = app.send(get("/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "up");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn health_check_reports_unavailable_store() {
    let app = TestApp::new();
    app.storage.inject_error(MockOperation::HealthCheck, "connection refused").await;

    let response = app.send(get("/health")).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["database"]["status"], "down");
}

#[tokio::test]
async fn liveness_check_touches_no_dependencies() {
    let app = TestApp::new();
    app.storage.inject_error(MockOperation::HealthCheck, "connection refused").await;

    let response = app.send(get("/live")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "alive");
}

#[tokio::test]
async fn responses_carry_request_id() {
    let app = TestApp::new();

    let response = app.send(get("/live")).await;

    assert!(response.headers().contains_key("x-request-id"));
}

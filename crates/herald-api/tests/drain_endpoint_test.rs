//! Drain trigger responses.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{drain_request, json_body, TestApp, SECRET};
use herald_core::DeliveryStatus;
use herald_delivery::{storage::mock::MockOperation, DeliveryStorage};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn empty_queue_reports_zero_processed() {
    let app = TestApp::new();

    let response = app.send(drain_request(Some(SECRET))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["processedCount"], 0);
    assert!(body["durationMs"].is_u64());
}

#[tokio::test]
async fn due_records_are_delivered() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hook"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let app = TestApp::new();
    let url = format!("{}/hook", server.uri());
    let first = app.queue(&url).await;
    let second = app.queue(&url).await;

    let response = app.send(drain_request(Some(SECRET))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["processedCount"], 2);
    assert_eq!(app.storage.status_of(first.id).await, Some(DeliveryStatus::Delivered));
    assert_eq!(app.storage.status_of(second.id).await, Some(DeliveryStatus::Delivered));
}

#[tokio::test]
async fn failed_retry_counts_as_processed() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let app = TestApp::new();
    let record = app.queue(&format!("{}/hook", server.uri())).await;

    let response = app.send(drain_request(Some(SECRET))).await;

    assert_eq!(json_body(response).await["processedCount"], 1);
    let stored = app.storage.find_by_id(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.attempt_count, 2);
}

#[tokio::test]
async fn store_failure_returns_generic_error() {
    let app = TestApp::new();
    app.storage.inject_error(MockOperation::FindDue, "connection refused").await;

    let response = app.send(drain_request(Some(SECRET))).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Internal server error");
    assert!(!body.to_string().contains("connection refused"));
}

#[tokio::test]
async fn hard_timeout_returns_gateway_timeout() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let app = TestApp::builder()
        .drain_hard_timeout(Duration::from_millis(100))
        .client_timeout(Duration::from_secs(5))
        .build();
    app.queue(&format!("{}/hook", server.uri())).await;

    let response = app.send(drain_request(Some(SECRET))).await;

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Request timed out");
}

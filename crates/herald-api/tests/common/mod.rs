//! Router fixtures backed by in-memory storage.

#![allow(dead_code)]

use std::{collections::HashSet, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use chrono::Utc;
use herald_api::{create_router, middleware::auth::OperatorSecret, AppState};
use herald_core::{
    Clock, DeliveryRecord, DeliveryStatus, DestinationKind, DomainEvent, EndpointId, EventSource,
    EventType, TeamId, TeamRef, TestClock, WebhookEndpoint,
};
use herald_delivery::{
    storage::mock::MockDeliveryStorage, ClientConfig, DeliveryClient, Dispatcher, DrainConfig,
    DrainScheduler, PayloadFormatter, RetryPolicy,
};
use serde_json::{json, Value};
use tower::ServiceExt;

pub const SECRET: &str = "cron-secret-for-tests";

pub struct TestApp {
    pub storage: Arc<MockDeliveryStorage>,
    pub clock: TestClock,
    pub router: Router,
}

pub struct TestAppBuilder {
    secret: Option<&'static str>,
    drain_hard_timeout: Duration,
    client_timeout: Duration,
}

impl TestAppBuilder {
    pub fn without_secret(mut self) -> Self {
        self.secret = None;
        self
    }

    pub fn drain_hard_timeout(mut self, timeout: Duration) -> Self {
        self.drain_hard_timeout = timeout;
        self
    }

    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn build(self) -> TestApp {
        let storage = Arc::new(MockDeliveryStorage::new());
        let clock = TestClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let client = Arc::new(
            DeliveryClient::new(ClientConfig { timeout: self.client_timeout, ..ClientConfig::default() })
                .unwrap(),
        );
        let policy = RetryPolicy { max_attempts: 3, jitter_factor: 0.0, ..RetryPolicy::default() };

        let dispatcher = Dispatcher::new(
            storage.clone(),
            client.clone(),
            PayloadFormatter::default(),
            policy.clone(),
            shared_clock.clone(),
        );
        let scheduler = DrainScheduler::new(
            storage.clone(),
            client,
            PayloadFormatter::default(),
            policy,
            shared_clock.clone(),
            DrainConfig::default(),
        )
        .unwrap();

        let state = AppState {
            storage: storage.clone(),
            dispatcher: Arc::new(dispatcher),
            scheduler: Arc::new(scheduler),
            clock: shared_clock,
            operator_secret: OperatorSecret::new(self.secret),
            drain_budget: Duration::from_secs(45),
            drain_hard_timeout: self.drain_hard_timeout,
            request_timeout: Duration::from_secs(30),
        };

        TestApp { storage, clock, router: create_router(state) }
    }
}

impl TestApp {
    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            secret: Some(SECRET),
            drain_hard_timeout: Duration::from_secs(60),
            client_timeout: Duration::from_secs(2),
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.expect("failed to make request")
    }

    /// Stores a pending record for `url` that is due now.
    pub async fn queue(&self, url: &str) -> DeliveryRecord {
        let endpoint = endpoint(TeamId::new(), url, EventType::LicenseCreated);
        let now = self.clock.now_utc();
        let record = DeliveryRecord::first_failure(
            &endpoint,
            &event(EventType::LicenseCreated, endpoint.team_id),
            DestinationKind::Generic,
            json!({"eventType": "LICENSE_CREATED"}),
            DeliveryStatus::Pending,
            now,
            Some("server error: HTTP 503".to_string()),
            Some(503),
            now,
        );
        self.storage.insert_record(record.clone()).await;
        record
    }
}

pub fn endpoint(team_id: TeamId, url: &str, event_type: EventType) -> WebhookEndpoint {
    WebhookEndpoint {
        id: EndpointId::new(),
        team_id,
        url: url.to_string(),
        enabled: true,
        event_types: HashSet::from([event_type]),
    }
}

pub fn event(event_type: EventType, team_id: TeamId) -> DomainEvent {
    DomainEvent::new(
        event_type,
        EventSource::ApiKey,
        TeamRef { id: team_id, name: "Acme".to_string() },
        json!({"key": "ABCD-1234"}),
        Utc::now(),
    )
}

pub fn drain_request(token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/internal/webhooks/retry");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn event_request(token: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/internal/events")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body)).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&bytes).expect("response should be valid JSON")
}

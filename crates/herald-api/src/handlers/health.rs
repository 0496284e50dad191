//! Health check handlers for service monitoring.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use herald_core::Clock;
use herald_delivery::DeliveryStorage;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// The retry store is unreachable
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Retry store connectivity
    pub database: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Error message if the component is down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is failing
    Down,
}

/// Health checks with an injected clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Pings the retry store and reports the result.
    pub async fn health_check(&self, storage: &dyn DeliveryStorage) -> HealthResponse {
        let timestamp = self.clock.now_utc();
        let start_time = self.clock.now();

        let (status, message) = match storage.health_check().await {
            Ok(()) => (ComponentStatus::Up, None),
            Err(e) => {
                error!(error = %e, "database health check failed");
                (ComponentStatus::Down, Some(format!("Database connection failed: {e}")))
            },
        };
        let elapsed = self.clock.now().saturating_duration_since(start_time);

        let overall = match status {
            ComponentStatus::Up => HealthStatus::Healthy,
            ComponentStatus::Down => HealthStatus::Unhealthy,
        };

        HealthResponse {
            status: overall,
            timestamp,
            checks: HealthChecks {
                database: ComponentHealth {
                    status,
                    message,
                    response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                },
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Health check endpoint handler.
///
/// Returns 200 when the store answers and 503 otherwise.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let response = HealthService::new(state.clock.clone()).health_check(state.storage.as_ref()).await;

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?response.status, "health check completed");

    (status_code, Json(response)).into_response()
}

/// Liveness check. Touches no dependencies.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "herald"
    });

    (StatusCode::OK, Json(response)).into_response()
}

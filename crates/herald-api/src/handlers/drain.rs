//! Operator-triggered retry drain.
//!
//! An external scheduler calls `POST /internal/webhooks/retry` on a fixed
//! cadence. Each call runs one drain under the configured budget and is
//! raced against a hard ceiling so the caller always gets an answer.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::AppState;

/// Body of a successful drain.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainResponse {
    /// Always `true`.
    pub success: bool,
    /// Records driven to delivered, pending or failed.
    pub processed_count: usize,
    /// Wall time spent in the drain.
    pub duration_ms: u64,
}

/// Body of a failed request. Details stay in the server log.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always `false`.
    pub success: bool,
    /// Generic message.
    pub error: &'static str,
}

impl ErrorResponse {
    pub(crate) fn into_response_with(status: StatusCode, error: &'static str) -> Response {
        (status, Json(Self { success: false, error })).into_response()
    }
}

/// Runs one retry drain.
#[instrument(name = "trigger_drain", skip(state))]
pub async fn trigger_drain(State(state): State<AppState>) -> Response {
    let started = state.clock.now();
    let deadline = started + state.drain_budget;
    let cancellation = CancellationToken::new();

    let outcome = tokio::time::timeout(
        state.drain_hard_timeout,
        state.scheduler.drain_until(deadline, &cancellation),
    )
    .await;

    let elapsed = state.clock.now().saturating_duration_since(started);
    let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(Ok(report)) => {
            info!(
                processed = report.processed,
                delivered = report.delivered,
                retried = report.retried,
                failed = report.failed,
                skipped = report.skipped,
                stopped_early = report.stopped_early,
                duration_ms,
                "retry drain finished"
            );
            let body = DrainResponse { success: true, processed_count: report.processed, duration_ms };
            (StatusCode::OK, Json(body)).into_response()
        },
        Ok(Err(e)) => {
            error!(error = %e, duration_ms, "retry drain failed");
            ErrorResponse::into_response_with(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
            )
        },
        Err(_) => {
            error!(
                duration_ms,
                ceiling_ms = u64::try_from(state.drain_hard_timeout.as_millis()).unwrap_or(u64::MAX),
                "retry drain exceeded hard timeout"
            );
            ErrorResponse::into_response_with(StatusCode::GATEWAY_TIMEOUT, "Request timed out")
        },
    }
}

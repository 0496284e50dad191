//! Event feed.
//!
//! The platform posts each domain event here once. The handler runs the
//! immediate dispatch and reports what happened per endpoint.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_core::DomainEvent;
use herald_delivery::DispatchSummary;
use serde::Serialize;
use tracing::{error, info, instrument};

use super::drain::ErrorResponse;
use crate::AppState;

/// Body of a successful dispatch.
#[derive(Debug, Serialize)]
pub struct EventResponse {
    /// Always `true`.
    pub success: bool,
    /// Per-endpoint counts.
    #[serde(flatten)]
    pub summary: DispatchSummary,
}

/// Dispatches one domain event to its subscribed endpoints.
#[instrument(
    name = "ingest_event",
    skip(state, event),
    fields(event_id = %event.id, event_type = %event.event_type, team_id = %event.team.id)
)]
pub async fn ingest_event(State(state): State<AppState>, Json(event): Json<DomainEvent>) -> Response {
    match state.dispatcher.dispatch(&event).await {
        Ok(summary) => {
            info!(
                delivered = summary.delivered,
                queued = summary.queued,
                skipped = summary.skipped,
                duplicates = summary.duplicates,
                "event dispatched"
            );
            (StatusCode::OK, Json(EventResponse { success: true, summary })).into_response()
        },
        Err(e) => {
            error!(error = %e, "event dispatch failed");
            ErrorResponse::into_response_with(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
            )
        },
    }
}

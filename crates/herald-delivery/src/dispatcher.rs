//! Immediate delivery of freshly emitted domain events.
//!
//! For each subscribed endpoint the dispatcher classifies the URL, formats the
//! payload, attempts delivery once and hands failures to the retry store.

use std::sync::Arc;

use herald_core::{Clock, DeliveryRecord, DeliveryStatus, DomainEvent, WebhookEndpoint};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    classify::classify,
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, ErrorCategory, Result},
    format::PayloadFormatter,
    retry::{RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Per-event dispatch counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    /// Endpoints that accepted the immediate attempt.
    pub delivered: usize,
    /// Failed attempts written to the retry store.
    pub queued: usize,
    /// Endpoints skipped because of a contract or store error.
    pub skipped: usize,
    /// Failed attempts whose (endpoint, event) pair was already queued.
    pub duplicates: usize,
}

enum EndpointOutcome {
    Delivered,
    Queued,
    Duplicate,
    Skipped,
}

/// Resolves endpoints for an event and performs the first attempt.
pub struct Dispatcher {
    storage: Arc<dyn DeliveryStorage>,
    client: Arc<DeliveryClient>,
    formatter: PayloadFormatter,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        client: Arc<DeliveryClient>,
        formatter: PayloadFormatter,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, client, formatter, policy, clock }
    }

    /// Delivers `event` to every enabled endpoint subscribed to its type.
    ///
    /// Endpoints are handled independently: a formatting or store failure for
    /// one is logged and counted as skipped without affecting the rest.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the endpoints cannot be
    /// resolved.
    pub async fn dispatch(&self, event: &DomainEvent) -> Result<DispatchSummary> {
        let endpoints =
            self.storage.find_subscribed_endpoints(event.team.id, event.event_type).await?;

        let mut summary = DispatchSummary::default();

        for endpoint in endpoints.iter().filter(|e| e.subscribes_to(event.event_type)) {
            match self.dispatch_to(event, endpoint).await {
                EndpointOutcome::Delivered => summary.delivered += 1,
                EndpointOutcome::Queued => summary.queued += 1,
                EndpointOutcome::Duplicate => summary.duplicates += 1,
                EndpointOutcome::Skipped => summary.skipped += 1,
            }
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            endpoints = endpoints.len(),
            delivered = summary.delivered,
            queued = summary.queued,
            skipped = summary.skipped,
            duplicates = summary.duplicates,
            "event dispatched"
        );

        Ok(summary)
    }

    async fn dispatch_to(&self, event: &DomainEvent, endpoint: &WebhookEndpoint) -> EndpointOutcome {
        let destination = classify(&endpoint.url);

        let payload = match self.formatter.format(event, destination) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    destination = %destination,
                    error = %e,
                    "cannot format event for endpoint"
                );
                return EndpointOutcome::Skipped;
            },
        };

        let request = DeliveryRequest {
            url: &endpoint.url,
            payload: &payload,
            destination,
            event_id: event.id,
            attempt_number: 1,
        };
        let result = self.client.attempt(&request).await;

        if result.success {
            return EndpointOutcome::Delivered;
        }

        let error =
            result.error.unwrap_or_else(|| DeliveryError::internal("failure without cause"));

        if !error.is_retryable() {
            error!(
                event_id = %event.id,
                endpoint_id = %endpoint.id,
                category = %ErrorCategory::from(&error),
                error = %error,
                "delivery failed with non-retryable error"
            );
            return EndpointOutcome::Skipped;
        }

        let now = self.clock.now_utc();
        let (status, next_attempt_at) = match self.policy.decide(0, &error, now) {
            RetryDecision::Retry { next_attempt_at, .. } => (DeliveryStatus::Pending, next_attempt_at),
            RetryDecision::GiveUp { reason, .. } => {
                warn!(
                    event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    reason = %reason,
                    "delivery permanently failed on first attempt"
                );
                (DeliveryStatus::Failed, now)
            },
        };

        let record = DeliveryRecord::first_failure(
            endpoint,
            event,
            destination,
            payload.into_json(),
            status,
            next_attempt_at,
            Some(error.to_string()),
            error.status_code(),
            now,
        );

        match self.storage.enqueue(record).await {
            Ok(true) => {
                info!(
                    event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    status = %status,
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "delivery queued for retry"
                );
                EndpointOutcome::Queued
            },
            Ok(false) => {
                info!(
                    event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    "delivery already queued"
                );
                EndpointOutcome::Duplicate
            },
            Err(e) => {
                error!(
                    event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    error = %e,
                    "failed to queue delivery"
                );
                EndpointOutcome::Skipped
            },
        }
    }
}

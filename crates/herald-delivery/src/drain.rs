//! Deadline-bounded draining of the retry store.
//!
//! A drain run sweeps stale claims, then repeatedly fetches due records
//! oldest-first, claims each one and retries it through the delivery client
//! with bounded parallelism. The run stops when nothing is due or the
//! cancellation token fires. It also stops claiming once the time left before
//! the deadline is shorter than the client's per-call timeout, so every attempt
//! it starts can finish by the deadline. Attempts already started when it
//! stops are awaited and counted.
//!
//! Each attempt runs on its own task. A panic there is recorded against the
//! record as a retryable failure instead of leaving it claimed.

use std::{
    collections::HashSet,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use herald_core::{Clock, DeliveryId, DeliveryRecord};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, ErrorCategory, Result},
    format::{PayloadFormatter, WirePayload},
    retry::{RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Tuning for drain runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Records fetched per query.
    pub batch_size: usize,
    /// Attempts in flight at once.
    pub concurrency: usize,
    /// Claims older than this are considered orphaned.
    pub stale_claim_threshold: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            concurrency: crate::DEFAULT_DRAIN_CONCURRENCY,
            stale_claim_threshold: Duration::from_secs(300),
        }
    }
}

/// Counts from one drain run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Records driven to delivered, pending or failed.
    pub processed: usize,
    /// Records delivered.
    pub delivered: usize,
    /// Records returned to pending with a later due time.
    pub retried: usize,
    /// Records that exhausted their attempts.
    pub failed: usize,
    /// Records lost to a concurrent claimer or left untouched by a store error.
    pub skipped: usize,
    /// Whether the deadline or cancellation ended the run.
    pub stopped_early: bool,
}

impl DrainReport {
    fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Delivered => self.delivered += 1,
            RecordOutcome::Retried => self.retried += 1,
            RecordOutcome::Failed => self.failed += 1,
            RecordOutcome::Skipped => self.skipped += 1,
        }
        self.processed = self.delivered + self.retried + self.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Delivered,
    Retried,
    Failed,
    Skipped,
}

struct Shared {
    storage: Arc<dyn DeliveryStorage>,
    client: Arc<DeliveryClient>,
    formatter: PayloadFormatter,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

/// Retries due deliveries until a deadline.
///
/// Runs may overlap freely; the store's conditional claim guarantees each
/// record is attempted by at most one of them.
pub struct DrainScheduler {
    shared: Arc<Shared>,
    config: DrainConfig,
}

impl DrainScheduler {
    /// Creates a scheduler.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the batch size or
    /// concurrency is zero.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        client: Arc<DeliveryClient>,
        formatter: PayloadFormatter,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        config: DrainConfig,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(DeliveryError::configuration("drain batch size must be positive"));
        }
        if config.concurrency == 0 {
            return Err(DeliveryError::configuration("drain concurrency must be positive"));
        }

        Ok(Self { shared: Arc::new(Shared { storage, client, formatter, policy, clock }), config })
    }

    /// Returns the drain configuration.
    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    /// Drains until `deadline` and returns how many records were processed.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the first due-record query
    /// fails.
    pub async fn drain(&self, deadline: Instant) -> Result<usize> {
        let report = self.drain_until(deadline, &CancellationToken::new()).await?;
        Ok(report.processed)
    }

    /// Returns claims older than the stale threshold to pending.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the update fails.
    pub async fn reclaim_stale(&self) -> Result<u64> {
        let now = self.shared.clock.now_utc();
        let threshold = chrono::Duration::from_std(self.config.stale_claim_threshold)
            .unwrap_or(chrono::Duration::MAX);
        let claimed_before = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let reclaimed = self.shared.storage.reclaim_stale(claimed_before, now).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "returned stale claims to pending");
        }
        Ok(reclaimed)
    }

    /// Drains until `deadline`, cancellation, or an empty queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the first due-record query
    /// fails. Later failures end the run early with partial counts.
    pub async fn drain_until(
        &self,
        deadline: Instant,
        cancellation: &CancellationToken,
    ) -> Result<DrainReport> {
        let started = self.shared.clock.now();
        let mut report = DrainReport::default();

        if self.should_stop(deadline, cancellation) {
            report.stopped_early = true;
            return Ok(report);
        }

        if let Err(e) = self.reclaim_stale().await {
            warn!(error = %e, "stale claim sweep failed");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight: JoinSet<RecordOutcome> = JoinSet::new();
        let mut seen: HashSet<DeliveryId> = HashSet::new();
        let mut first_fetch = true;

        'fetch: loop {
            if self.should_stop(deadline, cancellation) {
                report.stopped_early = true;
                break;
            }

            let now = self.shared.clock.now_utc();
            let due = match self
                .shared
                .storage
                .find_due(now, self.config.batch_size + seen.len())
                .await
            {
                Ok(due) => due,
                Err(e) if first_fetch => return Err(e.into()),
                Err(e) => {
                    error!(error = %e, "failed to fetch due deliveries, ending drain");
                    report.stopped_early = true;
                    break;
                },
            };
            first_fetch = false;

            let fresh: Vec<DeliveryRecord> =
                due.into_iter().filter(|r| !seen.contains(&r.id)).collect();
            if fresh.is_empty() {
                break;
            }

            debug!(batch_size = fresh.len(), "processing due deliveries");

            for record in fresh {
                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'fetch,
                    },
                    () = cancellation.cancelled() => {
                        report.stopped_early = true;
                        break 'fetch;
                    },
                };

                if self.should_stop(deadline, cancellation) {
                    report.stopped_early = true;
                    break 'fetch;
                }

                seen.insert(record.id);
                let shared = self.shared.clone();
                in_flight.spawn(async move {
                    let outcome = process_record(&shared, record).await;
                    drop(permit);
                    outcome
                });
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(error = %e, "delivery task panicked");
                    report.skipped += 1;
                },
            }
        }

        let elapsed = self.shared.clock.now().saturating_duration_since(started);
        info!(
            processed = report.processed,
            delivered = report.delivered,
            retried = report.retried,
            failed = report.failed,
            skipped = report.skipped,
            stopped_early = report.stopped_early,
            duration_ms = elapsed.as_millis() as u64,
            "drain completed"
        );

        Ok(report)
    }

    /// Whether to stop claiming: an attempt started now could outlive the
    /// deadline.
    fn should_stop(&self, deadline: Instant, cancellation: &CancellationToken) -> bool {
        let remaining = deadline.saturating_duration_since(self.shared.clock.now());
        cancellation.is_cancelled() || remaining < self.shared.client.config().timeout
    }
}

/// Claims, attempts and completes one record.
///
/// Never fails: store errors are logged and the record is left for the stale
/// sweep of a later run.
async fn process_record(shared: &Arc<Shared>, record: DeliveryRecord) -> RecordOutcome {
    let id = record.id;

    let record = match shared.storage.claim(id, shared.clock.now_utc()).await {
        Ok(Some(claimed)) => claimed,
        Ok(None) => {
            debug!(delivery_id = %id, "delivery claimed elsewhere, skipping");
            return RecordOutcome::Skipped;
        },
        Err(e) => {
            warn!(delivery_id = %id, error = %e, "failed to claim delivery");
            return RecordOutcome::Skipped;
        },
    };

    match guard_panics(id, attempt_record(shared.clone(), record.clone())).await {
        None => complete_delivered(shared, &record).await,
        Some(error) => complete_failed(shared, &record, &error).await,
    }
}

/// Formats and sends a claimed record. `None` means the destination accepted it.
async fn attempt_record(shared: Arc<Shared>, record: DeliveryRecord) -> Option<DeliveryError> {
    let payload = match &record.payload {
        Some(payload) => WirePayload::new(payload.clone()),
        None => match shared.formatter.format(&record.event, record.destination) {
            Ok(payload) => payload,
            Err(e) => {
                error!(delivery_id = %record.id, error = %e, "cannot format queued delivery");
                return Some(e);
            },
        },
    };

    let request = DeliveryRequest {
        url: &record.target_url,
        payload: &payload,
        destination: record.destination,
        event_id: record.event_id,
        attempt_number: record.attempt_count.saturating_add(1),
    };
    let result = shared.client.attempt(&request).await;

    if result.success {
        return None;
    }
    Some(result.error.unwrap_or_else(|| DeliveryError::internal("failure without cause")))
}

/// Runs an attempt on its own task and turns a panic into a failure outcome.
async fn guard_panics<F>(id: DeliveryId, attempt: F) -> Option<DeliveryError>
where
    F: Future<Output = Option<DeliveryError>> + Send + 'static,
{
    match tokio::spawn(attempt).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = panic_message(e);
            error!(delivery_id = %id, panic = %message, "delivery attempt panicked");
            Some(DeliveryError::attempt_panicked(message))
        },
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

async fn complete_delivered(shared: &Shared, record: &DeliveryRecord) -> RecordOutcome {
    match shared.storage.mark_delivered(record.id, shared.clock.now_utc()).await {
        Ok(true) => {
            info!(
                delivery_id = %record.id,
                event_id = %record.event_id,
                attempt = record.attempt_count + 1,
                "queued delivery succeeded"
            );
            RecordOutcome::Delivered
        },
        Ok(false) => {
            warn!(delivery_id = %record.id, "delivery no longer claimed, result discarded");
            RecordOutcome::Skipped
        },
        Err(e) => {
            error!(delivery_id = %record.id, error = %e, "failed to mark delivery delivered");
            RecordOutcome::Skipped
        },
    }
}

async fn complete_failed(
    shared: &Shared,
    record: &DeliveryRecord,
    error: &DeliveryError,
) -> RecordOutcome {
    let now = shared.clock.now_utc();
    let decision = shared.policy.decide(record.attempt_count, error, now);
    let attempt_count = decision.attempt_count();

    let (applied, outcome) = match decision {
        RetryDecision::Retry { next_attempt_at, .. } => {
            debug!(
                delivery_id = %record.id,
                attempt_count,
                next_attempt_at = %next_attempt_at,
                category = %ErrorCategory::from(error),
                error = %error,
                "delivery failed, retry scheduled"
            );
            let applied = shared
                .storage
                .schedule_retry(
                    record.id,
                    attempt_count,
                    next_attempt_at,
                    error.to_string(),
                    error.status_code(),
                    now,
                )
                .await;
            (applied, RecordOutcome::Retried)
        },
        RetryDecision::GiveUp { reason, .. } => {
            warn!(
                delivery_id = %record.id,
                event_id = %record.event_id,
                endpoint_id = %record.endpoint_id,
                attempt_count,
                reason = %reason,
                error = %error,
                "delivery permanently failed"
            );
            let applied = shared
                .storage
                .mark_failed(record.id, attempt_count, error.to_string(), error.status_code(), now)
                .await;
            (applied, RecordOutcome::Failed)
        },
    };

    match applied {
        Ok(true) => outcome,
        Ok(false) => {
            warn!(delivery_id = %record.id, "delivery no longer claimed, result discarded");
            RecordOutcome::Skipped
        },
        Err(e) => {
            error!(delivery_id = %record.id, error = %e, "failed to record delivery failure");
            RecordOutcome::Skipped
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use herald_core::{
        DeliveryStatus, DestinationKind, DomainEvent, EndpointId, EventSource, EventType, TeamId,
        TeamRef, TestClock, WebhookEndpoint,
    };
    use serde_json::json;

    use super::*;
    use crate::storage::mock::MockDeliveryStorage;

    async fn explode() -> Option<DeliveryError> {
        panic!("formatter bug")
    }

    fn shared(storage: Arc<MockDeliveryStorage>, clock: TestClock) -> Arc<Shared> {
        Arc::new(Shared {
            storage,
            client: Arc::new(DeliveryClient::with_defaults().unwrap()),
            formatter: PayloadFormatter::default(),
            policy: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(3600),
                jitter_factor: 0.0,
            },
            clock: Arc::new(clock),
        })
    }

    fn pending(now: DateTime<Utc>) -> DeliveryRecord {
        let endpoint = WebhookEndpoint {
            id: EndpointId::new(),
            team_id: TeamId::new(),
            url: "http://127.0.0.1:1/hook".to_string(),
            enabled: true,
            event_types: HashSet::from([EventType::LicenseCreated]),
        };
        let event = DomainEvent::new(
            EventType::LicenseCreated,
            EventSource::ApiKey,
            TeamRef { id: endpoint.team_id, name: "Acme".to_string() },
            json!({}),
            now,
        );
        DeliveryRecord::first_failure(
            &endpoint,
            &event,
            DestinationKind::Generic,
            json!({}),
            DeliveryStatus::Pending,
            now,
            Some("server error: HTTP 500".to_string()),
            Some(500),
            now,
        )
    }

    #[tokio::test]
    async fn normal_outcomes_pass_through_the_guard() {
        let id = DeliveryId::new();

        assert!(guard_panics(id, async { None }).await.is_none());

        let error = guard_panics(id, async { Some(DeliveryError::timeout(10)) }).await;
        assert!(matches!(error, Some(DeliveryError::Timeout { timeout_ms: 10 })));
    }

    #[tokio::test]
    async fn panicking_attempt_becomes_a_retryable_failure() {
        let error = guard_panics(DeliveryId::new(), explode()).await.unwrap();

        assert!(error.is_retryable());
        assert_eq!(error.to_string(), "delivery attempt panicked: formatter bug");
    }

    #[tokio::test]
    async fn panicked_record_is_released_for_retry() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let clock = TestClock::new();
        let now = clock.now_utc();
        let record = pending(now);
        let id = record.id;
        storage.insert_record(record).await;
        let shared = shared(storage.clone(), clock);

        let claimed = storage.claim(id, now).await.unwrap().unwrap();
        let error = guard_panics(id, explode()).await.unwrap();
        let outcome = complete_failed(&shared, &claimed, &error).await;

        assert_eq!(outcome, RecordOutcome::Retried);
        let stored = storage.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Pending);
        assert_eq!(stored.attempt_count, 2);
        assert!(stored.claimed_at.is_none());
        assert_eq!(stored.last_error.as_deref(), Some("delivery attempt panicked: formatter bug"));
    }
}

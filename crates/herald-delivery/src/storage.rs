//! Storage abstraction for the delivery engine.
//!
//! The dispatcher and drain scheduler talk to the retry store only through
//! [`DeliveryStorage`]. Production wraps `herald_core::storage::Storage`;
//! tests use [`mock::MockDeliveryStorage`], which enforces the same
//! conditional transitions in memory.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result, DeliveryId, DeliveryRecord, EventType, TeamId, WebhookEndpoint,
};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Retry store and endpoint lookups required by the delivery engine.
///
/// Every completion operation is conditional on the record currently being
/// `in_progress` and reports through its boolean whether it applied.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Inserts a record unless its (endpoint, event) pair already exists.
    ///
    /// Returns `false` for a duplicate; the existing record is unchanged.
    fn enqueue(&self, record: DeliveryRecord) -> StorageFuture<'_, bool>;

    /// Pending records with `next_attempt_at <= now`, oldest-due first.
    fn find_due(&self, now: DateTime<Utc>, limit: usize)
        -> StorageFuture<'_, Vec<DeliveryRecord>>;

    /// Moves a due pending record to `in_progress`.
    ///
    /// Exactly one of any number of concurrent callers receives the record.
    fn claim(&self, id: DeliveryId, now: DateTime<Utc>)
        -> StorageFuture<'_, Option<DeliveryRecord>>;

    /// `in_progress -> delivered`.
    fn mark_delivered(&self, id: DeliveryId, now: DateTime<Utc>) -> StorageFuture<'_, bool>;

    /// `in_progress -> pending` with a new attempt count and due time.
    fn schedule_retry(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: String,
        last_status_code: Option<u16>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// `in_progress -> failed`.
    fn mark_failed(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        last_error: String,
        last_status_code: Option<u16>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Returns records claimed before `claimed_before` to `pending`.
    fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, u64>;

    /// Finds a record by id.
    fn find_by_id(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>>;

    /// Enabled endpoints of a team subscribed to `event_type`.
    fn find_subscribed_endpoints(
        &self,
        team_id: TeamId,
        event_type: EventType,
    ) -> StorageFuture<'_, Vec<WebhookEndpoint>>;

    /// Verifies the store is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// Production storage backed by PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<herald_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<herald_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn enqueue(&self, record: DeliveryRecord) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.enqueue(&record).await })
    }

    fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.find_due(now, limit).await })
    }

    fn claim(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<DeliveryRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.claim(id, now).await })
    }

    fn mark_delivered(&self, id: DeliveryId, now: DateTime<Utc>) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.mark_delivered(id, now).await })
    }

    fn schedule_retry(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: String,
        last_status_code: Option<u16>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .deliveries
                .schedule_retry(id, attempt_count, next_attempt_at, &last_error, last_status_code, now)
                .await
        })
    }

    fn mark_failed(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        last_error: String,
        last_status_code: Option<u16>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .deliveries
                .mark_failed(id, attempt_count, &last_error, last_status_code, now)
                .await
        })
    }

    fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.reclaim_stale(claimed_before, now).await })
    }

    fn find_by_id(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.find_by_id(id).await })
    }

    fn find_subscribed_endpoints(
        &self,
        team_id: TeamId,
        event_type: EventType,
    ) -> StorageFuture<'_, Vec<WebhookEndpoint>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.find_subscribed(team_id, event_type).await })
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory storage for testing delivery logic without a database.
    //!
    //! Applies the same conditional transitions as the SQL repository and
    //! supports one-shot error injection per operation.

    use std::{collections::HashMap, sync::Arc};

    use chrono::{DateTime, Utc};
    use herald_core::{
        CoreError, DeliveryId, DeliveryRecord, DeliveryStatus, EventType, TeamId,
        WebhookEndpoint,
    };
    use tokio::sync::RwLock;

    use super::{DeliveryStorage, StorageFuture};

    /// Storage operation that can be made to fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum MockOperation {
        /// `enqueue`
        Enqueue,
        /// `find_due`
        FindDue,
        /// `claim`
        Claim,
        /// `mark_delivered`, `schedule_retry` and `mark_failed`
        Complete,
        /// `reclaim_stale`
        ReclaimStale,
        /// `find_subscribed_endpoints`
        FindEndpoints,
        /// `health_check`
        HealthCheck,
    }

    /// Mock storage for testing delivery logic without database.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        records: Arc<RwLock<HashMap<DeliveryId, DeliveryRecord>>>,
        endpoints: Arc<RwLock<Vec<WebhookEndpoint>>>,
        injected: Arc<RwLock<HashMap<MockOperation, String>>>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers an endpoint.
        pub async fn add_endpoint(&self, endpoint: WebhookEndpoint) {
            self.endpoints.write().await.push(endpoint);
        }

        /// Stores a record as-is, replacing any with the same id.
        pub async fn insert_record(&self, record: DeliveryRecord) {
            self.records.write().await.insert(record.id, record);
        }

        /// Makes the next call of `operation` fail with `message`.
        pub async fn inject_error(&self, operation: MockOperation, message: impl Into<String>) {
            self.injected.write().await.insert(operation, message.into());
        }

        /// Makes the next claim fail.
        pub async fn inject_claim_error(&self, message: impl Into<String>) {
            self.inject_error(MockOperation::Claim, message).await;
        }

        /// Returns copies of all records.
        pub async fn records(&self) -> Vec<DeliveryRecord> {
            self.records.read().await.values().cloned().collect()
        }

        /// Current status of a record.
        pub async fn status_of(&self, id: DeliveryId) -> Option<DeliveryStatus> {
            self.records.read().await.get(&id).map(|r| r.status)
        }

        async fn take_injected(&self, operation: MockOperation) -> herald_core::Result<()> {
            match self.injected.write().await.remove(&operation) {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }

        async fn complete(
            &self,
            id: DeliveryId,
            next: DeliveryStatus,
            apply: impl FnOnce(&mut DeliveryRecord) + Send,
        ) -> herald_core::Result<bool> {
            self.take_injected(MockOperation::Complete).await?;

            let mut records = self.records.write().await;
            match records.get_mut(&id) {
                Some(record) if record.status.can_transition_to(next) => {
                    record.status = next;
                    apply(record);
                    record.claimed_at = None;
                    Ok(true)
                },
                _ => Ok(false),
            }
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn enqueue(&self, record: DeliveryRecord) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.take_injected(MockOperation::Enqueue).await?;

                let mut records = self.records.write().await;
                let duplicate = records
                    .values()
                    .any(|r| r.endpoint_id == record.endpoint_id && r.event_id == record.event_id);
                if duplicate {
                    return Ok(false);
                }
                records.insert(record.id, record);
                Ok(true)
            })
        }

        fn find_due(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
            Box::pin(async move {
                self.take_injected(MockOperation::FindDue).await?;

                let mut due: Vec<DeliveryRecord> =
                    self.records.read().await.values().filter(|r| r.is_due(now)).cloned().collect();
                due.sort_by_key(|r| (r.next_attempt_at, r.created_at));
                due.truncate(limit);
                Ok(due)
            })
        }

        fn claim(
            &self,
            id: DeliveryId,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<DeliveryRecord>> {
            Box::pin(async move {
                self.take_injected(MockOperation::Claim).await?;

                let mut records = self.records.write().await;
                match records.get_mut(&id) {
                    Some(record)
                        if record.is_due(now)
                            && record.status.can_transition_to(DeliveryStatus::InProgress) =>
                    {
                        record.status = DeliveryStatus::InProgress;
                        record.claimed_at = Some(now);
                        record.updated_at = now;
                        Ok(Some(record.clone()))
                    },
                    _ => Ok(None),
                }
            })
        }

        fn mark_delivered(&self, id: DeliveryId, now: DateTime<Utc>) -> StorageFuture<'_, bool> {
            Box::pin(self.complete(id, DeliveryStatus::Delivered, move |record| {
                record.last_error = None;
                record.updated_at = now;
            }))
        }

        fn schedule_retry(
            &self,
            id: DeliveryId,
            attempt_count: u32,
            next_attempt_at: DateTime<Utc>,
            last_error: String,
            last_status_code: Option<u16>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(self.complete(id, DeliveryStatus::Pending, move |record| {
                record.attempt_count = record.attempt_count.max(attempt_count);
                record.next_attempt_at = next_attempt_at;
                record.last_error = Some(last_error);
                record.last_status_code = last_status_code;
                record.updated_at = now;
            }))
        }

        fn mark_failed(
            &self,
            id: DeliveryId,
            attempt_count: u32,
            last_error: String,
            last_status_code: Option<u16>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(self.complete(id, DeliveryStatus::Failed, move |record| {
                record.attempt_count = record.attempt_count.max(attempt_count);
                record.last_error = Some(last_error);
                record.last_status_code = last_status_code;
                record.updated_at = now;
            }))
        }

        fn reclaim_stale(
            &self,
            claimed_before: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                self.take_injected(MockOperation::ReclaimStale).await?;

                let mut reclaimed = 0;
                for record in self.records.write().await.values_mut() {
                    let stale = record.status.can_transition_to(DeliveryStatus::Pending)
                        && record.claimed_at.is_some_and(|at| at < claimed_before);
                    if stale {
                        record.status = DeliveryStatus::Pending;
                        record.claimed_at = None;
                        record.updated_at = now;
                        reclaimed += 1;
                    }
                }
                Ok(reclaimed)
            })
        }

        fn find_by_id(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>> {
            Box::pin(async move { Ok(self.records.read().await.get(&id).cloned()) })
        }

        fn find_subscribed_endpoints(
            &self,
            team_id: TeamId,
            event_type: EventType,
        ) -> StorageFuture<'_, Vec<WebhookEndpoint>> {
            Box::pin(async move {
                self.take_injected(MockOperation::FindEndpoints).await?;

                Ok(self
                    .endpoints
                    .read()
                    .await
                    .iter()
                    .filter(|e| e.team_id == team_id && e.subscribes_to(event_type))
                    .cloned()
                    .collect())
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(async move { self.take_injected(MockOperation::HealthCheck).await })
        }
    }

    #[cfg(test)]
    mod tests {
        use std::collections::HashSet;

        use herald_core::{
            DestinationKind, DomainEvent, EndpointId, EventSource, TeamRef,
        };
        use serde_json::json;

        use super::*;

        fn endpoint() -> WebhookEndpoint {
            WebhookEndpoint {
                id: EndpointId::new(),
                team_id: TeamId::new(),
                url: "https://example.com/hook".to_string(),
                enabled: true,
                event_types: HashSet::from([EventType::LicenseCreated]),
            }
        }

        fn pending(endpoint: &WebhookEndpoint, now: DateTime<Utc>) -> DeliveryRecord {
            let event = DomainEvent::new(
                EventType::LicenseCreated,
                EventSource::ApiKey,
                TeamRef { id: endpoint.team_id, name: "Acme".to_string() },
                json!({}),
                now,
            );
            DeliveryRecord::first_failure(
                endpoint,
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
        async fn duplicate_enqueue_is_rejected() {
            let storage = MockDeliveryStorage::new();
            let endpoint = endpoint();
            let now = Utc::now();
            let first = pending(&endpoint, now);
            let mut second = first.clone();
            second.id = DeliveryId::new();

            assert!(storage.enqueue(first).await.unwrap());
            assert!(!storage.enqueue(second).await.unwrap());
            assert_eq!(storage.records().await.len(), 1);
        }

        #[tokio::test]
        async fn completion_requires_a_claim() {
            let storage = MockDeliveryStorage::new();
            let now = Utc::now();
            let record = pending(&endpoint(), now);
            let id = record.id;
            storage.insert_record(record).await;

            assert!(!storage.mark_delivered(id, now).await.unwrap());
            assert!(storage.claim(id, now).await.unwrap().is_some());
            assert!(storage.mark_delivered(id, now).await.unwrap());
            assert!(!storage
                .mark_failed(id, 9, "late".to_string(), None, now)
                .await
                .unwrap());
            assert_eq!(storage.status_of(id).await, Some(DeliveryStatus::Delivered));
        }

        #[tokio::test]
        async fn terminal_records_are_never_reclaimed() {
            let storage = MockDeliveryStorage::new();
            let now = Utc::now();
            let mut record = pending(&endpoint(), now);
            record.status = DeliveryStatus::Failed;
            record.claimed_at = Some(now - chrono::Duration::hours(1));
            let id = record.id;
            storage.insert_record(record).await;

            assert!(storage.claim(id, now).await.unwrap().is_none());
            assert_eq!(storage.reclaim_stale(now, now).await.unwrap(), 0);
            assert!(!storage.schedule_retry(id, 2, now, "x".to_string(), None, now).await.unwrap());

            let stored = storage.find_by_id(id).await.unwrap().unwrap();
            assert_eq!(stored.status, DeliveryStatus::Failed);
            assert!(storage.find_by_id(DeliveryId::new()).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn injected_errors_fire_once() {
            let storage = MockDeliveryStorage::new();
            storage.inject_claim_error("connection reset").await;

            assert!(storage.claim(DeliveryId::new(), Utc::now()).await.is_err());
            assert!(storage.claim(DeliveryId::new(), Utc::now()).await.unwrap().is_none());
        }
    }
}

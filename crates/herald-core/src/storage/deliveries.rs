//! Repository for the persisted retry queue.
//!
//! Every state change is a single conditional `UPDATE` keyed on the current
//! status, so concurrent drain runs can race freely: exactly one claimer wins
//! a pending row, and completion updates never touch a row that is not
//! currently claimed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DeliveryId, DeliveryRecord},
};

const COLUMNS: &str = "id, endpoint_id, event_id, target_url, destination, event, payload, \
                       status, attempt_count, next_attempt_at, last_error, last_status_code, \
                       claimed_at, created_at, updated_at";

/// Repository for delivery record operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a record unless one already exists for its (endpoint, event).
    ///
    /// Returns `false` when the pair was already queued; the existing row is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(&self, record: &DeliveryRecord) -> Result<bool> {
        let inserted: Option<uuid::Uuid> = sqlx::query_scalar(
            r"
            INSERT INTO webhook_deliveries (
                id, endpoint_id, event_id, target_url, destination, event, payload,
                status, attempt_count, next_attempt_at, last_error, last_status_code,
                claimed_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL, $13, $13
            )
            ON CONFLICT (endpoint_id, event_id) DO NOTHING
            RETURNING id
            ",
        )
        .bind(record.id)
        .bind(record.endpoint_id)
        .bind(record.event_id)
        .bind(&record.target_url)
        .bind(record.destination.to_string())
        .bind(sqlx::types::Json(&record.event))
        .bind(record.payload.as_ref().map(sqlx::types::Json))
        .bind(record.status)
        .bind(i32::try_from(record.attempt_count).unwrap_or(i32::MAX))
        .bind(record.next_attempt_at)
        .bind(&record.last_error)
        .bind(record.last_status_code.map(i32::from))
        .bind(record.created_at)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(inserted.is_some())
    }

    /// Lists pending records due at `now`, oldest-due first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let query = format!(
            r"
            SELECT {COLUMNS}
            FROM webhook_deliveries
            WHERE status = 'pending' AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC, created_at ASC
            LIMIT $2
            "
        );

        let records = sqlx::query_as::<_, DeliveryRecord>(&query)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(records)
    }

    /// Atomically moves a due pending record to `in_progress`.
    ///
    /// Returns `None` if another run claimed it first or it is no longer due.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn claim(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<Option<DeliveryRecord>> {
        let query = format!(
            r"
            UPDATE webhook_deliveries
            SET status = 'in_progress', claimed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending' AND next_attempt_at <= $2
            RETURNING {COLUMNS}
            "
        );

        let record = sqlx::query_as::<_, DeliveryRecord>(&query)
            .bind(id)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(record)
    }

    /// Completes a claimed record as delivered.
    ///
    /// Returns `false` if the record was not claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_delivered(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET status = 'delivered', claimed_at = NULL, last_error = NULL, updated_at = $2
            WHERE id = $1 AND status = 'in_progress'
            ",
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns a claimed record to `pending` after a failed attempt.
    ///
    /// The attempt count only ever grows: a smaller value is ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        last_status_code: Option<u16>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET status = 'pending',
                attempt_count = GREATEST(attempt_count, $2),
                next_attempt_at = $3,
                last_error = $4,
                last_status_code = $5,
                claimed_at = NULL,
                updated_at = $6
            WHERE id = $1 AND status = 'in_progress'
            ",
        )
        .bind(id)
        .bind(i32::try_from(attempt_count).unwrap_or(i32::MAX))
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(last_status_code.map(i32::from))
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Completes a claimed record as permanently failed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        last_error: &str,
        last_status_code: Option<u16>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET status = 'failed',
                attempt_count = GREATEST(attempt_count, $2),
                last_error = $3,
                last_status_code = $4,
                claimed_at = NULL,
                updated_at = $5
            WHERE id = $1 AND status = 'in_progress'
            ",
        )
        .bind(id)
        .bind(i32::try_from(attempt_count).unwrap_or(i32::MAX))
        .bind(last_error)
        .bind(last_status_code.map(i32::from))
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns records claimed before `claimed_before` to `pending`.
    ///
    /// Recovers rows orphaned by a drain run that crashed mid-attempt. The
    /// attempt count is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET status = 'pending', claimed_at = NULL, updated_at = $2
            WHERE status = 'in_progress' AND claimed_at < $1
            ",
        )
        .bind(claimed_before)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds a record by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        let query = format!("SELECT {COLUMNS} FROM webhook_deliveries WHERE id = $1");

        let record = sqlx::query_as::<_, DeliveryRecord>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(record)
    }
}

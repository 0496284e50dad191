//! PostgreSQL repositories backing the retry store.
//!
//! All SQL lives in this module. The delivery crate reaches it through the
//! `DeliveryStorage` trait so that engine logic can be exercised without a
//! database.

use std::sync::Arc;

use sqlx::PgPool;

pub mod deliveries;
pub mod endpoints;

use crate::error::Result;

/// Schema statements applied idempotently at startup.
pub const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS webhook_endpoints (
        id UUID PRIMARY KEY,
        team_id UUID NOT NULL,
        url TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        event_types TEXT[] NOT NULL DEFAULT '{}'
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id UUID PRIMARY KEY,
        endpoint_id UUID NOT NULL,
        event_id UUID NOT NULL,
        target_url TEXT NOT NULL,
        destination TEXT NOT NULL,
        event JSONB NOT NULL,
        payload JSONB,
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'in_progress', 'delivered', 'failed')),
        attempt_count INTEGER NOT NULL CHECK (attempt_count >= 1),
        next_attempt_at TIMESTAMPTZ NOT NULL,
        last_error TEXT,
        last_status_code INTEGER,
        claimed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (endpoint_id, event_id)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_due
    ON webhook_deliveries (next_attempt_at)
    WHERE status = 'pending'
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_claimed
    ON webhook_deliveries (claimed_at)
    WHERE status = 'in_progress'
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_endpoints_team
    ON webhook_endpoints (team_id)
    WHERE enabled
    ",
];

/// Container for all repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Retry store.
    pub deliveries: Arc<deliveries::Repository>,

    /// Read-only endpoint configuration.
    pub endpoints: Arc<endpoints::Repository>,
}

impl Storage {
    /// Creates repositories over the given pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            endpoints: Arc::new(endpoints::Repository::new(pool)),
        }
    }

    /// Applies [`SCHEMA`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        let pool = self.deliveries.pool();
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*pool).await?;
        }
        Ok(())
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.deliveries.pool()).await?;
        Ok(())
    }
}

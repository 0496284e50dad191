//! Read-only access to team webhook endpoints.
//!
//! Endpoints are owned by the dashboard; Herald only resolves which of them
//! should receive a given event.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{EventType, TeamId, WebhookEndpoint},
};

/// Repository for endpoint lookups.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Enabled endpoints of `team_id` subscribed to `event_type`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_subscribed(
        &self,
        team_id: TeamId,
        event_type: EventType,
    ) -> Result<Vec<WebhookEndpoint>> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            r"
            SELECT id, team_id, url, enabled, event_types
            FROM webhook_endpoints
            WHERE team_id = $1 AND enabled AND $2 = ANY(event_types)
            ORDER BY id
            ",
        )
        .bind(team_id)
        .bind(event_type.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }
}

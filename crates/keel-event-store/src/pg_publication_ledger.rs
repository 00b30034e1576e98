//! `PostgreSQL` implementation of the `PublicationLedger` seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use keel_core::error::DomainError;
use keel_core::publisher::PublicationLedger;
use keel_core::repository::EventRecord;

use crate::pg_session::{EventRow, storage_error};
use crate::schema;

/// Publication ledger backed by the `published_at` column of the event
/// table. Runs outside any unit of work transaction.
#[derive(Debug, Clone)]
pub struct PgPublicationLedger {
    pool: PgPool,
}

impl PgPublicationLedger {
    /// Creates a new `PgPublicationLedger`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PublicationLedger for PgPublicationLedger {
    async fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), DomainError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let result = sqlx::query(schema::MARK_PUBLISHED)
            .bind(event_ids)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        debug!(marked = result.rows_affected(), "events marked as published");
        Ok(())
    }

    async fn unpublished_events(
        &self,
        occurred_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRecord>, DomainError> {
        let rows = sqlx::query_as::<_, EventRow>(schema::SELECT_UNPUBLISHED)
            .bind(occurred_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(rows.into_iter().map(EventRecord::from).collect())
    }
}

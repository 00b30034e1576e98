//! `PostgreSQL` implementation of the session, event store and projection
//! store seams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use keel_core::error::DomainError;
use keel_core::repository::{
    EventRecord, EventStore, ProjectionRow, ProjectionStore, check_contiguous,
};
use keel_core::session::{Session, SessionFactory};

use crate::schema;

pub(crate) fn storage_error(err: sqlx::Error) -> DomainError {
    DomainError::Infrastructure(err.to_string())
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EventRow {
    event_id: Uuid,
    aggregate_id: Uuid,
    event_kind: String,
    payload: serde_json::Value,
    version: i64,
    correlation_id: Uuid,
    causation_id: Uuid,
    occurred_on: DateTime<Utc>,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            aggregate_id: row.aggregate_id,
            event_kind: row.event_kind,
            payload: row.payload,
            version: row.version,
            correlation_id: row.correlation_id,
            causation_id: row.causation_id,
            occurred_on: row.occurred_on,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectionDbRow {
    projection: String,
    aggregate_id: Uuid,
    version: i64,
    state: serde_json::Value,
}

impl From<ProjectionDbRow> for ProjectionRow {
    fn from(row: ProjectionDbRow) -> Self {
        Self {
            projection: row.projection,
            aggregate_id: row.aggregate_id,
            version: row.version,
            state: row.state,
        }
    }
}

/// Opens one `PgSession` per unit of work from a shared pool.
#[derive(Debug, Clone)]
pub struct PgSessionFactory {
    pool: PgPool,
}

impl PgSessionFactory {
    /// Creates a new `PgSessionFactory`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionFactory for PgSessionFactory {
    type Session = PgSession;

    async fn begin(&self) -> Result<PgSession, DomainError> {
        let tx = self.pool.begin().await.map_err(storage_error)?;
        Ok(PgSession { tx })
    }
}

/// One open `PostgreSQL` transaction.
///
/// `sqlx` rolls the transaction back when it is dropped unfinished.
#[derive(Debug)]
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

impl PgSession {
    async fn highest_version(&mut self, aggregate_id: Uuid) -> Result<i64, DomainError> {
        sqlx::query_scalar::<_, i64>(schema::HIGHEST_VERSION)
            .bind(aggregate_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(storage_error)
    }
}

#[async_trait]
impl Session for PgSession {
    async fn commit(self) -> Result<(), DomainError> {
        self.tx.commit().await.map_err(storage_error)
    }

    async fn rollback(self) -> Result<(), DomainError> {
        self.tx.rollback().await.map_err(storage_error)
    }
}

#[async_trait]
impl EventStore for PgSession {
    async fn load_events(&mut self, aggregate_id: Uuid) -> Result<Vec<EventRecord>, DomainError> {
        let rows = sqlx::query_as::<_, EventRow>(schema::SELECT_EVENTS)
            .bind(aggregate_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn append_events(
        &mut self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[EventRecord],
    ) -> Result<i64, DomainError> {
        check_contiguous(aggregate_id, expected_version, events)?;
        let Some(last) = events.last() else {
            return Ok(expected_version);
        };

        // The batch runs under a savepoint so a conflict leaves none of it
        // behind while the outer transaction stays usable.
        let mut savepoint = Connection::begin(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        for event in events {
            let inserted = sqlx::query(schema::INSERT_EVENT)
                .bind(event.event_id)
                .bind(event.aggregate_id)
                .bind(&event.event_kind)
                .bind(&event.payload)
                .bind(event.version)
                .bind(event.correlation_id)
                .bind(event.causation_id)
                .bind(event.occurred_on)
                .execute(&mut *savepoint)
                .await;
            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    savepoint.rollback().await.map_err(storage_error)?;
                    let actual = self.highest_version(aggregate_id).await?;
                    warn!(
                        %aggregate_id,
                        expected_version,
                        actual,
                        "event store append lost the race"
                    );
                    return Err(DomainError::ConcurrencyConflict {
                        aggregate_id,
                        expected: expected_version,
                        actual,
                    });
                }
                Err(err) => return Err(storage_error(err)),
            }
        }
        savepoint.commit().await.map_err(storage_error)?;

        debug!(%aggregate_id, from = expected_version + 1, to = last.version, "events appended");
        Ok(last.version)
    }
}

#[async_trait]
impl ProjectionStore for PgSession {
    async fn upsert_projection(&mut self, row: &ProjectionRow) -> Result<(), DomainError> {
        sqlx::query(schema::UPSERT_PROJECTION)
            .bind(&row.projection)
            .bind(row.aggregate_id)
            .bind(row.version)
            .bind(&row.state)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn fetch_projection(
        &mut self,
        projection: &str,
        aggregate_id: Uuid,
    ) -> Result<Option<ProjectionRow>, DomainError> {
        let row = sqlx::query_as::<_, ProjectionDbRow>(schema::SELECT_PROJECTION)
            .bind(projection)
            .bind(aggregate_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(row.map(ProjectionRow::from))
    }

    async fn find_projections(
        &mut self,
        projection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<ProjectionRow>, DomainError> {
        let rows = sqlx::query_as::<_, ProjectionDbRow>(schema::FIND_PROJECTIONS)
            .bind(projection)
            .bind(field)
            .bind(value)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(rows.into_iter().map(ProjectionRow::from).collect())
    }

    async fn list_projections(
        &mut self,
        projection: &str,
    ) -> Result<Vec<ProjectionRow>, DomainError> {
        let rows = sqlx::query_as::<_, ProjectionDbRow>(schema::LIST_PROJECTIONS)
            .bind(projection)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(rows.into_iter().map(ProjectionRow::from).collect())
    }
}

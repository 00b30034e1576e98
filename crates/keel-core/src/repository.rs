//! Storage seams for the event store and the projection tables.
//!
//! Both traits are implemented by a transaction-scoped session, so every
//! call made through them is part of the unit of work's transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Stored representation of a domain event.
///
/// The same record is appended to the event store and handed to the
/// broker after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Kind name; selects the payload schema and the broker topic.
    pub event_kind: String,
    /// Kind-specific fields as a JSON object.
    pub payload: serde_json::Value,
    /// Version within the aggregate stream.
    pub version: i64,
    /// Correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Causation ID linking to the causing event/command.
    pub causation_id: Uuid,
    /// Timestamp of event creation.
    pub occurred_on: DateTime<Utc>,
}

/// Append-only, version-ordered event log keyed by `(aggregate_id, version)`.
#[async_trait]
pub trait EventStore: Send {
    /// Load all events for a given aggregate, ordered by version.
    async fn load_events(&mut self, aggregate_id: Uuid) -> Result<Vec<EventRecord>, DomainError>;

    /// Append `events` as versions `expected_version + 1 ..` and return the
    /// last version written.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` when another writer already
    /// holds one of the versions. The conflict is detected by the uniqueness
    /// of `(aggregate_id, version)`, and nothing from the batch is kept.
    /// Returns `DomainError::Validation` when the records do not carry
    /// consecutive versions starting at `expected_version + 1`.
    async fn append_events(
        &mut self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[EventRecord],
    ) -> Result<i64, DomainError>;
}

/// One row of a projection table: the materialized state of an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRow {
    /// Projection (table) name, e.g. `items`.
    pub projection: String,
    /// Aggregate the row materializes.
    pub aggregate_id: Uuid,
    /// Highest event version folded into `state`.
    pub version: i64,
    /// Current field values.
    pub state: serde_json::Value,
}

/// Mutable, query-side view of aggregates.
#[async_trait]
pub trait ProjectionStore: Send {
    /// Insert or update a row in one round trip.
    async fn upsert_projection(&mut self, row: &ProjectionRow) -> Result<(), DomainError>;

    /// Fetch a row by aggregate id.
    async fn fetch_projection(
        &mut self,
        projection: &str,
        aggregate_id: Uuid,
    ) -> Result<Option<ProjectionRow>, DomainError>;

    /// Fetch rows whose top-level string `field` equals `value`.
    async fn find_projections(
        &mut self,
        projection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<ProjectionRow>, DomainError>;

    /// Fetch every row of a projection, ordered by aggregate id.
    async fn list_projections(&mut self, projection: &str)
    -> Result<Vec<ProjectionRow>, DomainError>;
}

/// Checks that `events` continue the stream at `expected_version + 1`.
///
/// Shared by event store implementations before they touch storage.
///
/// # Errors
///
/// Returns `DomainError::Validation` on a gap, a duplicate, or a record
/// belonging to another aggregate.
pub fn check_contiguous(
    aggregate_id: Uuid,
    expected_version: i64,
    events: &[EventRecord],
) -> Result<(), DomainError> {
    for (offset, event) in (1_i64..).zip(events) {
        if event.aggregate_id != aggregate_id {
            return Err(DomainError::Validation(format!(
                "event {} belongs to aggregate {}, not {aggregate_id}",
                event.event_id, event.aggregate_id
            )));
        }
        let wanted = expected_version + offset;
        if event.version != wanted {
            return Err(DomainError::Validation(format!(
                "event {} has version {}, expected {wanted}",
                event.event_id, event.version
            )));
        }
    }
    Ok(())
}

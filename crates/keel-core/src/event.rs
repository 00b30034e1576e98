//! Domain event abstractions.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::repository::EventRecord;

/// Abstraction over system time so event timestamps are deterministic in
/// tests.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by `Utc::now`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Metadata attached to every domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Kind name; doubles as the broker topic.
    pub event_kind: String,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Position of this event in the aggregate stream, starting at 1.
    pub version: i64,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Uuid,
    /// Causation ID linking this event to the event/command that caused it.
    pub causation_id: Uuid,
    /// Timestamp of event creation.
    pub occurred_on: DateTime<Utc>,
}

impl EventMetadata {
    /// Builds metadata for a fresh event caused directly by a command.
    #[must_use]
    pub fn new(
        event_kind: &str,
        aggregate_id: Uuid,
        version: i64,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_kind: event_kind.to_owned(),
            aggregate_id,
            version,
            correlation_id,
            causation_id: correlation_id,
            occurred_on: clock.now(),
        }
    }

    /// Rebuilds metadata from a stored row.
    #[must_use]
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            event_kind: record.event_kind.clone(),
            aggregate_id: record.aggregate_id,
            version: record.version,
            correlation_id: record.correlation_id,
            causation_id: record.causation_id,
            occurred_on: record.occurred_on,
        }
    }
}

/// A kind-specific event body with a fixed kind name.
///
/// The kind name selects both the broker topic and the payload schema, so
/// it must be unique across the whole application.
pub trait EventPayload:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// The kind name, e.g. `item.created`.
    const EVENT_KIND: &'static str;
}

/// Trait that all domain events implement.
pub trait DomainEvent: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Returns the event kind name.
    fn event_kind(&self) -> &'static str;

    /// Serializes the kind-specific fields to a JSON object.
    fn to_payload(&self) -> serde_json::Value;

    /// Returns the metadata for this event.
    fn metadata(&self) -> &EventMetadata;

    /// Converts the event to the row written to the event store and handed
    /// to the broker.
    fn to_record(&self) -> EventRecord {
        let meta = self.metadata();
        EventRecord {
            event_id: meta.event_id,
            aggregate_id: meta.aggregate_id,
            event_kind: self.event_kind().to_owned(),
            payload: self.to_payload(),
            version: meta.version,
            correlation_id: meta.correlation_id,
            causation_id: meta.causation_id,
            occurred_on: meta.occurred_on,
        }
    }
}

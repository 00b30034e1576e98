//! Broker-facing seams used after commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DomainError;
use crate::repository::EventRecord;

/// Outcome of publishing one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Events acknowledged by the broker, in batch order.
    pub delivered: Vec<Uuid>,
    /// Number of events that were not acknowledged within the flush
    /// timeout.
    pub undelivered: usize,
}

impl PublishReport {
    /// Returns `true` when every event in the batch was delivered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.undelivered == 0
    }
}

/// Producer side of the message broker.
///
/// Publishing never fails as a whole: partial or total failure is reported
/// as an undelivered count so callers that already committed can log it
/// and carry on.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Sends each event to the topic named after its kind and waits, at
    /// most a bounded flush timeout, for the broker's acknowledgements.
    async fn publish(&self, events: &[EventRecord]) -> PublishReport;
}

/// Tracks which stored events have reached the broker.
#[async_trait]
pub trait PublicationLedger: Send + Sync {
    /// Marks events as delivered to the broker.
    async fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), DomainError>;

    /// Returns up to `limit` never-marked events that occurred before
    /// `occurred_before`, oldest first.
    async fn unpublished_events(
        &self,
        occurred_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRecord>, DomainError>;
}

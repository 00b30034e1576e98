//! Event publisher backed by a broker transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use keel_core::publisher::{EventPublisher, PublishReport};
use keel_core::repository::EventRecord;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, instrument, warn};

use crate::message::encode;
use crate::transport::MessageSink;

/// Publishes each event to the topic named after its kind.
///
/// All messages of a batch are handed to the transport in batch order and
/// their acknowledgements are then awaited together. Sending and
/// acknowledging share one deadline of `flush_timeout` from the start of
/// the call; whatever is unacknowledged by then counts as undelivered.
#[derive(Clone)]
pub struct BrokerPublisher {
    sink: Arc<dyn MessageSink>,
    flush_timeout: Duration,
}

impl std::fmt::Debug for BrokerPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerPublisher")
            .field("flush_timeout", &self.flush_timeout)
            .finish_non_exhaustive()
    }
}

impl BrokerPublisher {
    /// Creates a publisher over `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn MessageSink>, flush_timeout: Duration) -> Self {
        Self {
            sink,
            flush_timeout,
        }
    }
}

#[async_trait]
impl EventPublisher for BrokerPublisher {
    #[instrument(skip_all, fields(batch = events.len()))]
    async fn publish(&self, events: &[EventRecord]) -> PublishReport {
        let deadline = Instant::now() + self.flush_timeout;
        let mut undelivered = 0;
        let mut pending = Vec::with_capacity(events.len());

        for record in events {
            let topic = record.event_kind.as_str();
            let body = match encode(record) {
                Ok(body) => body,
                Err(err) => {
                    error!(topic, event_id = %record.event_id, error = %err, "event could not be encoded");
                    undelivered += 1;
                    continue;
                }
            };
            match timeout_at(deadline, self.sink.send(topic, body)).await {
                Ok(Ok(ack)) => pending.push((record.event_id, topic, ack)),
                Ok(Err(err)) => {
                    error!(topic, error = %err, "message delivery failed");
                    undelivered += 1;
                }
                Err(_) => {
                    error!(topic, "broker did not accept message before flush timeout");
                    undelivered += 1;
                }
            }
        }

        let acks = join_all(pending.into_iter().map(|(event_id, topic, ack)| async move {
            (event_id, topic, timeout_at(deadline, ack).await)
        }))
        .await;

        let mut delivered = Vec::with_capacity(acks.len());
        for (event_id, topic, result) in acks {
            match result {
                Ok(Ok(())) => {
                    debug!(topic, %event_id, "message delivered");
                    delivered.push(event_id);
                }
                Ok(Err(err)) => {
                    error!(topic, %event_id, error = %err, "message delivery failed");
                    undelivered += 1;
                }
                Err(_) => {
                    error!(topic, %event_id, "no acknowledgement before flush timeout");
                    undelivered += 1;
                }
            }
        }

        if undelivered > 0 {
            warn!(undelivered, "messages failed to flush from the producer");
        }
        PublishReport {
            delivered,
            undelivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::memory::InMemoryBroker;

    fn record(kind: &str, version: i64) -> EventRecord {
        EventRecord {
            event_id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4(),
            event_kind: kind.to_owned(),
            payload: serde_json::json!({"n": version}),
            version,
            correlation_id: Uuid::new_v4(),
            causation_id: Uuid::new_v4(),
            occurred_on: Utc::now(),
        }
    }

    fn publisher(broker: &InMemoryBroker) -> BrokerPublisher {
        BrokerPublisher::new(Arc::new(broker.clone()), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_each_event_goes_to_topic_named_after_its_kind() {
        // Arrange
        let broker = InMemoryBroker::new();
        let events = vec![
            record("item.created", 1),
            record("item.name_updated", 2),
            record("item.created", 3),
        ];

        // Act
        let report = publisher(&broker).publish(&events).await;

        // Assert
        assert!(report.is_complete());
        assert_eq!(
            report.delivered,
            events.iter().map(|e| e.event_id).collect::<Vec<_>>()
        );
        assert_eq!(broker.topic_len("item.created"), 2);
        assert_eq!(broker.topic_len("item.name_updated"), 1);
    }

    #[tokio::test]
    async fn test_rejected_topic_is_counted_not_raised() {
        let broker = InMemoryBroker::new();
        broker.reject_topic("item.deleted");
        let events = vec![record("item.created", 1), record("item.deleted", 2)];

        let report = publisher(&broker).publish(&events).await;

        assert_eq!(report.delivered, vec![events[0].event_id]);
        assert_eq!(report.undelivered, 1);
    }

    #[tokio::test]
    async fn test_missing_acknowledgement_times_out_within_flush_timeout() {
        let broker = InMemoryBroker::new();
        broker.stall_topic("item.created");
        let events = vec![record("item.created", 1), record("item.renamed", 2)];

        let started = Instant::now();
        let report = publisher(&broker).publish(&events).await;

        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(report.delivered, vec![events[1].event_id]);
        assert_eq!(report.undelivered, 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_whole_batch_undelivered() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let events = vec![record("item.created", 1), record("item.created", 2)];

        let report = publisher(&broker).publish(&events).await;

        assert!(report.delivered.is_empty());
        assert_eq!(report.undelivered, 2);
    }
}

//! The consumer loop.
//!
//! One loop per process drains a durable subscription covering every topic
//! that has a handler. Each message is decoded, fanned out to all handlers
//! of its kind concurrently and acknowledged synchronously only once every
//! handler succeeded. Anything else leaves the message unacknowledged for
//! the broker to redeliver; there is no dead-letter path, so a message
//! that can never succeed is retried forever and holds up its topic.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::BrokerError;
use crate::registry::{Dispatch, HandlerRegistry};
use crate::transport::{Incoming, MessageSource};

/// Counters describing one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages whose handlers all succeeded and were acknowledged.
    pub handled: u64,
    /// Messages on a topic without handlers, acknowledged unprocessed.
    pub unrouted: u64,
    /// Messages that failed to decode.
    pub undecodable: u64,
    /// Messages with at least one failing handler.
    pub failed: u64,
    /// Errors reported by the broker while polling.
    pub receive_errors: u64,
    /// Acknowledgements that did not go through.
    pub commit_errors: u64,
}

/// Runs handlers from a [`HandlerRegistry`] against a [`MessageSource`].
#[derive(Debug)]
pub struct EventConsumer<S> {
    source: S,
    registry: Arc<HandlerRegistry>,
    poll_timeout: Duration,
}

impl<S: MessageSource> EventConsumer<S> {
    /// Creates a consumer; nothing is subscribed until [`EventConsumer::run`].
    #[must_use]
    pub fn new(source: S, registry: Arc<HandlerRegistry>, poll_timeout: Duration) -> Self {
        Self {
            source,
            registry,
            poll_timeout,
        }
    }

    /// Consumes until `shutdown` is cancelled.
    ///
    /// The source is closed on every exit path once it has been handed to
    /// the loop. With an empty registry the loop does not start.
    ///
    /// # Errors
    ///
    /// Returns the error of a failed subscription or of a subscription the
    /// broker closed. Other receive errors are logged, counted and retried
    /// after one poll timeout. Errors on individual messages are retried by
    /// redelivery.
    #[instrument(skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<ConsumerStats, BrokerError> {
        let topics = self.registry.topics();
        if topics.is_empty() {
            warn!("no topics to subscribe to; consumer will not start");
            return Ok(ConsumerStats::default());
        }

        let outcome = self.consume(&topics, &shutdown).await;

        info!("closing broker consumer");
        if let Err(err) = self.source.close().await {
            warn!(error = %err, "broker consumer did not close cleanly");
        }
        if let Ok(stats) = &outcome {
            info!(?stats, "broker consumer stopped");
        }
        outcome
    }

    async fn consume(
        &mut self,
        topics: &[String],
        shutdown: &CancellationToken,
    ) -> Result<ConsumerStats, BrokerError> {
        self.source.subscribe(topics).await?;
        info!(?topics, "broker consumer subscribed");

        let mut stats = ConsumerStats::default();
        while !shutdown.is_cancelled() {
            let polled = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                polled = self.source.poll(self.poll_timeout) => polled,
            };
            match polled {
                Ok(Some(message)) => self.process(&message, &mut stats).await,
                Ok(None) => {}
                Err(err) if err.is_benign() => debug!(error = %err, "ignoring benign broker signal"),
                Err(err) if err.is_fatal() => {
                    error!(error = %err, ?stats, "broker subscription lost; stopping consumer");
                    return Err(err);
                }
                Err(err) => {
                    error!(error = %err, "broker consumer error");
                    stats.receive_errors += 1;
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.poll_timeout) => {}
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn process(&mut self, message: &S::Message, stats: &mut ConsumerStats) {
        let topic = message.topic();
        match self.registry.dispatch(topic, message.body()).await {
            Dispatch::Unrouted => {
                warn!(topic, "no handler registered for topic; acknowledging");
                if self.commit(message, stats).await {
                    stats.unrouted += 1;
                }
            }
            Dispatch::Undecodable(err) => {
                error!(
                    topic,
                    error = %err,
                    raw_message = %String::from_utf8_lossy(message.body()),
                    "message could not be decoded; leaving it unacknowledged"
                );
                stats.undecodable += 1;
            }
            Dispatch::Failed { event_id, failures } => {
                for failure in &failures {
                    error!(
                        topic,
                        %event_id,
                        handler = failure.handler,
                        error = %failure.error,
                        "event handler failed; message will be redelivered"
                    );
                }
                stats.failed += 1;
            }
            Dispatch::Handled { event_id, handlers } => {
                info!(topic, %event_id, handlers, "consumed event");
                if self.commit(message, stats).await {
                    stats.handled += 1;
                }
            }
        }
    }

    async fn commit(&mut self, message: &S::Message, stats: &mut ConsumerStats) -> bool {
        match self.source.commit(message).await {
            Ok(()) => true,
            Err(err) => {
                error!(topic = message.topic(), error = %err, "failed to acknowledge message");
                stats.commit_errors += 1;
                false
            }
        }
    }
}

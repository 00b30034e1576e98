//! NATS `JetStream` transport.
//!
//! All topics live in one stream capturing `{prefix}.>`. Each worker
//! process binds the durable pull consumer named after the consumer group,
//! filtered to the subscribed topics. The consumer delivers from the start
//! of the stream, requires explicit acknowledgements, never gives up on a
//! message (`max_deliver = -1`) and keeps at most `max_in_flight`
//! messages unacknowledged.

use std::sync::Arc;
use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream::consumer::pull::{Config as PullConsumerConfig, Stream as PullMessages};
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::stream::{Config as StreamConfig, Stream as StreamHandle, StorageType};
use async_nats::jetstream::{self, Context as JetStreamContext};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::transport::{Incoming, MessageSink, MessageSource, PendingAck};

/// Connection to a NATS server with `JetStream` enabled.
#[derive(Clone)]
pub struct NatsBroker {
    client: Client,
    jetstream: JetStreamContext,
    config: Arc<BrokerConfig>,
}

impl std::fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NatsBroker {
    /// Connects and makes sure the event stream exists.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Connection` when no server is reachable and
    /// `BrokerError::Setup` when the stream cannot be created.
    pub async fn connect(config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = async_nats::connect(config.urls.join(","))
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!(urls = ?config.urls, "connected to NATS");

        let broker = Self {
            jetstream: jetstream::new(client.clone()),
            client,
            config: Arc::new(config),
        };
        broker.ensure_stream().await?;
        Ok(broker)
    }

    /// The configuration this broker was connected with.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    async fn ensure_stream(&self) -> Result<StreamHandle, BrokerError> {
        let stream = self
            .jetstream
            .get_or_create_stream(StreamConfig {
                name: self.config.stream.clone(),
                subjects: vec![format!("{}.>", self.config.subject_prefix)],
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Setup(e.to_string()))?;
        debug!(stream = %self.config.stream, "event stream ready");
        Ok(stream)
    }

    /// Opens the consumer side; the durable consumer is bound on
    /// [`MessageSource::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Setup` when the stream cannot be looked up.
    pub async fn source(&self) -> Result<NatsSource, BrokerError> {
        let stream = self.ensure_stream().await?;
        Ok(NatsSource {
            client: self.client.clone(),
            stream,
            config: Arc::clone(&self.config),
            messages: None,
        })
    }
}

#[async_trait]
impl MessageSink for NatsBroker {
    async fn send(&self, topic: &str, body: Vec<u8>) -> Result<PendingAck, BrokerError> {
        let ack = self
            .jetstream
            .publish(self.config.subject_for(topic), body.into())
            .await
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_owned(),
                reason: e.to_string(),
            })?;
        let topic = topic.to_owned();
        Ok(async move {
            ack.await.map(|_| ()).map_err(|e| BrokerError::Publish {
                topic,
                reason: e.to_string(),
            })
        }
        .boxed())
    }
}

/// A message received from `JetStream`.
#[derive(Debug)]
pub struct NatsMessage {
    topic: String,
    message: jetstream::Message,
}

impl Incoming for NatsMessage {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn body(&self) -> &[u8] {
        &self.message.payload
    }
}

/// Durable pull subscription for one consumer group.
pub struct NatsSource {
    client: Client,
    stream: StreamHandle,
    config: Arc<BrokerConfig>,
    messages: Option<PullMessages>,
}

impl std::fmt::Debug for NatsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsSource")
            .field("consumer_group", &self.config.consumer_group)
            .field("subscribed", &self.messages.is_some())
            .finish_non_exhaustive()
    }
}

impl NatsSource {
    fn consumer_config(&self, topics: &[String]) -> PullConsumerConfig {
        PullConsumerConfig {
            durable_name: Some(self.config.consumer_group.clone()),
            filter_subjects: topics
                .iter()
                .map(|topic| self.config.subject_for(topic))
                .collect(),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.config.ack_wait(),
            max_deliver: -1,
            max_ack_pending: self.config.max_in_flight,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MessageSource for NatsSource {
    type Message = NatsMessage;

    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        let config = self.consumer_config(topics);
        let consumer: PullConsumer = self
            .stream
            .create_consumer(config)
            .await
            .map_err(|e| BrokerError::Setup(e.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Setup(e.to_string()))?;
        info!(
            consumer = %self.config.consumer_group,
            stream = %self.config.stream,
            "durable consumer bound"
        );
        self.messages = Some(messages);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<NatsMessage>, BrokerError> {
        let Some(messages) = self.messages.as_mut() else {
            return Err(BrokerError::StreamClosed("consumer is not subscribed".into()));
        };
        match tokio::time::timeout(timeout, messages.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BrokerError::StreamClosed("message stream ended".into())),
            Ok(Some(Err(err))) => Err(BrokerError::Receive(err.to_string())),
            Ok(Some(Ok(message))) => {
                let subject = message.subject.as_str();
                let topic = self.config.topic_of(subject).unwrap_or(subject).to_owned();
                Ok(Some(NatsMessage { topic, message }))
            }
        }
    }

    async fn commit(&mut self, message: &NatsMessage) -> Result<(), BrokerError> {
        message
            .message
            .double_ack()
            .await
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.messages = None;
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

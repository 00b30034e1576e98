//! Transport seams between the broker logic and a concrete broker.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::BrokerError;

/// Acknowledgement of one sent message, resolved once the broker has
/// stored it.
pub type PendingAck = BoxFuture<'static, Result<(), BrokerError>>;

/// Producer-side transport.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Hands one message to the broker for `topic`.
    ///
    /// Messages handed over in sequence keep that order on the broker. The
    /// returned future resolves when the broker acknowledges the message.
    async fn send(&self, topic: &str, body: Vec<u8>) -> Result<PendingAck, BrokerError>;
}

/// A received message.
pub trait Incoming: Send + Sync {
    /// Topic the message arrived on.
    fn topic(&self) -> &str;

    /// Raw message body.
    fn body(&self) -> &[u8];
}

/// Consumer-side transport: a durable subscription on behalf of one
/// consumer group.
#[async_trait]
pub trait MessageSource: Send {
    /// The message type delivered by [`MessageSource::poll`].
    type Message: Incoming;

    /// Subscribes to `topics`. Called once before the first poll.
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    /// Waits at most `timeout` for the next message; `Ok(None)` on
    /// timeout.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Self::Message>, BrokerError>;

    /// Durably acknowledges `message`, returning only once the broker has
    /// confirmed it.
    async fn commit(&mut self, message: &Self::Message) -> Result<(), BrokerError>;

    /// Releases the subscription and the connection.
    async fn close(&mut self) -> Result<(), BrokerError>;
}

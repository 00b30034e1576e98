//! Message broker integration for the Keel backend.
//!
//! The producer side turns committed event records into one message per
//! event on the topic named after the event kind. The consumer side runs a
//! durable, at-least-once loop that decodes each message, fans it out to
//! every handler registered for its kind and acknowledges it only after
//! all of them succeeded.
//!
//! Transport is abstracted behind [`transport::MessageSink`] and
//! [`transport::MessageSource`]; [`nats`] implements both on NATS
//! JetStream and [`memory`] provides an in-process broker for tests and
//! local runs.

pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod nats;
pub mod producer;
pub mod reconcile;
pub mod registry;
pub mod transport;

pub use config::BrokerConfig;
pub use consumer::{ConsumerStats, EventConsumer};
pub use error::BrokerError;
pub use message::EventMessage;
pub use producer::BrokerPublisher;
pub use reconcile::PublicationReconciler;
pub use registry::{EventHandler, HandlerRegistry};

//! Handler registry: a closed, typed mapping from event kind to the
//! handlers subscribed to it.
//!
//! The registry is filled once during wiring and then shared immutably
//! with the consumer loop, so subscriptions cannot change while the loop
//! runs.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use keel_core::error::DomainError;
use keel_core::event::EventPayload;
use tracing::info;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::message::{EventMessage, decode};

/// An asynchronous consumer of one event kind.
///
/// Delivery is at least once, so implementations must be idempotent with
/// respect to [`EventMessage::event_id`].
#[async_trait]
pub trait EventHandler<P: EventPayload>: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Handles one message.
    async fn handle(&self, message: &EventMessage<P>) -> Result<(), DomainError>;
}

/// One handler that did not complete.
#[derive(Debug)]
pub struct HandlerFailure {
    /// The handler's name.
    pub handler: &'static str,
    /// What went wrong; a panic is reported as an infrastructure error.
    pub error: DomainError,
}

/// Result of routing one message body.
#[derive(Debug)]
pub enum Dispatch {
    /// No handler is registered for the topic.
    Unrouted,
    /// The body did not decode into the topic's payload type.
    Undecodable(BrokerError),
    /// Every handler completed.
    Handled {
        /// The decoded event's identifier.
        event_id: Uuid,
        /// Number of handlers run.
        handlers: usize,
    },
    /// At least one handler failed. The others still ran to completion.
    Failed {
        /// The decoded event's identifier.
        event_id: Uuid,
        /// The handlers that failed.
        failures: Vec<HandlerFailure>,
    },
}

#[async_trait]
trait Route: Send + Sync {
    fn payload_type(&self) -> TypeId;
    fn handler_count(&self) -> usize;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    async fn dispatch(&self, body: &[u8]) -> Dispatch;
}

struct TypedRoute<P: EventPayload> {
    handlers: Vec<Arc<dyn EventHandler<P>>>,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P: EventPayload> Route for TypedRoute<P> {
    fn payload_type(&self) -> TypeId {
        TypeId::of::<P>()
    }

    fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn dispatch(&self, body: &[u8]) -> Dispatch {
        let message = match decode::<P>(body) {
            Ok(message) => message,
            Err(err) => return Dispatch::Undecodable(err),
        };

        let outcomes = join_all(self.handlers.iter().map(|handler| {
            let message = &message;
            async move {
                let outcome = AssertUnwindSafe(handler.handle(message))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(DomainError::Infrastructure("handler panicked".into()))
                    });
                (handler.name(), outcome)
            }
        }))
        .await;

        let failures: Vec<HandlerFailure> = outcomes
            .into_iter()
            .filter_map(|(handler, outcome)| {
                outcome
                    .err()
                    .map(|error| HandlerFailure { handler, error })
            })
            .collect();

        if failures.is_empty() {
            Dispatch::Handled {
                event_id: message.event_id,
                handlers: self.handlers.len(),
            }
        } else {
            Dispatch::Failed {
                event_id: message.event_id,
                failures,
            }
        }
    }
}

/// Maps each event kind to its payload type and ordered handler list.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: BTreeMap<&'static str, Box<dyn Route>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.routes.iter().map(|(kind, route)| (kind, route.handler_count())))
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` for the kind `P::EVENT_KIND`. Handlers of one kind
    /// run concurrently, in registration order of their futures.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::KindConflict` if the kind is already bound to
    /// a different payload type.
    pub fn subscribe<P, H>(&mut self, handler: Arc<H>) -> Result<(), BrokerError>
    where
        P: EventPayload,
        H: EventHandler<P>,
    {
        let route = self.routes.entry(P::EVENT_KIND).or_insert_with(|| {
            Box::new(TypedRoute::<P> {
                handlers: Vec::new(),
                _payload: PhantomData,
            })
        });
        if route.payload_type() != TypeId::of::<P>() {
            return Err(BrokerError::KindConflict(P::EVENT_KIND));
        }
        let typed = route
            .as_any_mut()
            .downcast_mut::<TypedRoute<P>>()
            .ok_or(BrokerError::KindConflict(P::EVENT_KIND))?;
        let handler: Arc<dyn EventHandler<P>> = handler;
        info!(topic = P::EVENT_KIND, handler = handler.name(), "handler registered");
        typed.handlers.push(handler);
        Ok(())
    }

    /// Topics with at least one handler, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.routes.keys().map(|kind| (*kind).to_owned()).collect()
    }

    /// Number of handlers registered for `topic`.
    #[must_use]
    pub fn handler_count(&self, topic: &str) -> usize {
        self.routes.get(topic).map_or(0, |route| route.handler_count())
    }

    /// Returns `true` when nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decodes `body` for `topic` and runs every handler of that kind
    /// concurrently, waiting for all of them.
    pub async fn dispatch(&self, topic: &str, body: &[u8]) -> Dispatch {
        match self.routes.get(topic) {
            Some(route) => route.dispatch(body).await,
            None => Dispatch::Unrouted,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pinged {
        target: String,
    }

    impl EventPayload for Pinged {
        const EVENT_KIND: &'static str = "test.pinged";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Impostor {
        other: u32,
    }

    impl EventPayload for Impostor {
        const EVENT_KIND: &'static str = "test.pinged";
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler<Pinged> for Counting {
        async fn handle(&self, _message: &EventMessage<Pinged>) -> Result<(), DomainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DomainError::Infrastructure("down".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler<Pinged> for Panicking {
        async fn handle(&self, _message: &EventMessage<Pinged>) -> Result<(), DomainError> {
            panic!("boom");
        }
    }

    struct Never;

    #[async_trait]
    impl EventHandler<Impostor> for Never {
        async fn handle(&self, _message: &EventMessage<Impostor>) -> Result<(), DomainError> {
            Ok(())
        }
    }

    fn body() -> Vec<u8> {
        serde_json::to_vec(&EventMessage {
            event_id: Uuid::new_v4(),
            occurred_on: Utc::now(),
            aggregate_id: Uuid::new_v4(),
            version: 1,
            correlation_id: Uuid::new_v4(),
            payload: Pinged {
                target: "x".into(),
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_handlers_of_a_kind_run() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let mut registry = HandlerRegistry::new();
        registry.subscribe(Arc::clone(&first)).unwrap();
        registry.subscribe(Arc::clone(&second)).unwrap();

        let outcome = registry.dispatch("test.pinged", &body()).await;

        assert!(matches!(outcome, Dispatch::Handled { handlers: 2, .. }));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.topics(), vec!["test.pinged".to_owned()]);
    }

    #[tokio::test]
    async fn test_one_failing_handler_fails_the_message_but_others_still_run() {
        let ok = Arc::new(Counting::default());
        let failing = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let mut registry = HandlerRegistry::new();
        registry.subscribe(Arc::clone(&ok)).unwrap();
        registry.subscribe(Arc::clone(&failing)).unwrap();

        let outcome = registry.dispatch("test.pinged", &body()).await;

        let Dispatch::Failed { failures, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_reported_as_failure() {
        let mut registry = HandlerRegistry::new();
        registry.subscribe(Arc::new(Panicking)).unwrap();

        let outcome = registry.dispatch("test.pinged", &body()).await;

        assert!(matches!(outcome, Dispatch::Failed { .. }));
    }

    #[tokio::test]
    async fn test_unknown_topic_and_bad_body_are_distinguished() {
        let mut registry = HandlerRegistry::new();
        registry.subscribe(Arc::new(Counting::default())).unwrap();

        let unrouted = registry.dispatch("test.other", &body()).await;
        let undecodable = registry.dispatch("test.pinged", b"{not json").await;

        assert!(matches!(unrouted, Dispatch::Unrouted));
        assert!(matches!(undecodable, Dispatch::Undecodable(_)));
    }

    #[test]
    fn test_second_payload_type_for_same_kind_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.subscribe(Arc::new(Counting::default())).unwrap();

        let result = registry.subscribe(Arc::new(Never));

        assert!(matches!(result, Err(BrokerError::KindConflict("test.pinged"))));
        assert_eq!(registry.handler_count("test.pinged"), 1);
    }
}

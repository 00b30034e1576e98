//! Shared application state.

use std::sync::Arc;

use keel_core::event::Clock;
use keel_core::publisher::{EventPublisher, PublicationLedger};
use keel_core::repository::{EventStore, ProjectionStore};
use keel_core::session::SessionFactory;
use keel_core::unit_of_work::UnitOfWork;

/// A session factory whose sessions provide both the event store and the
/// projection store. Every request handler is generic over it.
pub trait Backend: SessionFactory<Session: EventStore + ProjectionStore> {}

impl<F> Backend for F
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
}

/// Application state shared across all request handlers.
pub struct AppState<F> {
    /// Opens one transaction per request.
    pub sessions: Arc<F>,
    /// Receives committed events.
    pub publisher: Arc<dyn EventPublisher>,
    /// Records fully published events, when configured.
    pub ledger: Option<Arc<dyn PublicationLedger>>,
    /// Timestamp source for new events.
    pub clock: Arc<dyn Clock>,
}

impl<F> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            publisher: Arc::clone(&self.publisher),
            ledger: self.ledger.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<F> std::fmt::Debug for AppState<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("ledger", &self.ledger.is_some())
            .finish_non_exhaustive()
    }
}

impl<F: Backend> AppState<F> {
    /// Create new application state.
    #[must_use]
    pub fn new(sessions: Arc<F>, publisher: Arc<dyn EventPublisher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions,
            publisher,
            ledger: None,
            clock,
        }
    }

    /// Marks fully published events in `ledger`.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn PublicationLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// A fresh, idle unit of work for one request.
    #[must_use]
    pub fn unit_of_work(&self) -> UnitOfWork<F> {
        let uow = UnitOfWork::new(Arc::clone(&self.sessions), Arc::clone(&self.publisher));
        match &self.ledger {
            Some(ledger) => uow.with_ledger(Arc::clone(ledger)),
            None => uow,
        }
    }
}

//! Aggregate root abstraction.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::event::DomainEvent;

/// Trait for aggregate roots that record domain events as they change.
///
/// Every accepted state change goes through [`AggregateRoot::apply`], which
/// folds the event into state, bumps `version` by exactly one and queues
/// the event as pending. The pending list is drained by the unit of work
/// after a successful commit and by nothing else.
pub trait AggregateRoot: Send + Sync + 'static {
    /// The event type this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> Uuid;

    /// Returns the current version (number of events applied).
    fn version(&self) -> i64;

    /// Folds an event into state and increments `version` by one.
    ///
    /// Used both for new events and for reconstitution from history, so it
    /// must not validate or fail.
    fn replay(&mut self, event: &Self::Event);

    /// Returns events recorded since the aggregate was loaded.
    fn pending_events(&self) -> &[Self::Event];

    /// Mutable access to the pending list backing [`AggregateRoot::apply`].
    fn pending_events_mut(&mut self) -> &mut Vec<Self::Event>;

    /// Records a new event: mutates state, advances `version` and queues
    /// the event for publication.
    fn apply(&mut self, event: Self::Event) -> &Self::Event {
        self.replay(&event);
        let pending = self.pending_events_mut();
        pending.push(event);
        &pending[pending.len() - 1]
    }

    /// Version the next recorded event will carry.
    fn next_version(&self) -> i64 {
        self.version() + 1
    }

    /// Version the aggregate had when it was loaded, before any pending
    /// event.
    #[allow(clippy::cast_possible_wrap)]
    fn persisted_version(&self) -> i64 {
        self.version() - self.pending_events().len() as i64
    }

    /// Removes and returns all pending events.
    fn take_pending_events(&mut self) -> Vec<Self::Event> {
        std::mem::take(self.pending_events_mut())
    }
}

/// Shared handle to an aggregate taking part in a unit of work.
///
/// Command handlers mutate the aggregate through [`Tracked::lock`] while the
/// unit of work keeps a second handle so it can drain pending events after
/// commit.
#[derive(Debug)]
pub struct Tracked<A> {
    id: Uuid,
    inner: Arc<Mutex<A>>,
}

impl<A> Clone for Tracked<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: AggregateRoot> Tracked<A> {
    /// Wraps an aggregate for tracking.
    #[must_use]
    pub fn new(aggregate: A) -> Self {
        Self {
            id: aggregate.aggregate_id(),
            inner: Arc::new(Mutex::new(aggregate)),
        }
    }

    /// Returns the identifier of the wrapped aggregate.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Locks the aggregate for reading or mutation.
    pub async fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock().await
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<A>> {
        Arc::clone(&self.inner)
    }
}

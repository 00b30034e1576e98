//! Unit of Work: one database transaction, the repositories bound to it,
//! and the domain events of the aggregates that took part.
//!
//! A unit of work moves through three states:
//!
//! * **idle**: constructed, no transaction;
//! * **active**: [`UnitOfWork::enter`] opened a transaction, repositories
//!   may be requested and aggregates tracked;
//! * **closed**: [`UnitOfWork::exit`] committed or rolled back. The
//!   instance cannot be reused.
//!
//! On a successful exit the transaction is committed first; only then are
//! the pending events of tracked aggregates drained, in tracking order and
//! per-aggregate order, and handed to the [`EventPublisher`]. A publish
//! failure at that point never undoes the commit. It is returned as
//! [`CommitReceipt::publish_failure`] instead.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{AggregateRoot, Tracked};
use crate::error::DomainError;
use crate::event::DomainEvent;
use crate::publisher::{EventPublisher, PublicationLedger};
use crate::repository::EventRecord;
use crate::session::{AggregateRepository, Repository, Session, SessionFactory, SessionHandle};

/// Lifecycle state of a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    /// No transaction has been opened yet.
    Idle,
    /// A transaction is open.
    Active,
    /// The transaction was committed or rolled back.
    Closed,
}

impl UnitOfWorkState {
    /// Lower-case state name used in error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for UnitOfWorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-commit publish failure: the data is durable but some events did
/// not reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishFailure {
    /// Events in the batch.
    pub attempted: usize,
    /// Events the broker did not acknowledge.
    pub undelivered: usize,
}

/// Result of a committed scope.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    /// The batch handed to the publisher, in publication order.
    pub events: Vec<EventRecord>,
    /// Set when the batch was not fully delivered.
    pub publish_failure: Option<PublishFailure>,
}

impl CommitReceipt {
    /// Identifiers of the committed events.
    #[must_use]
    pub fn event_ids(&self) -> Vec<Uuid> {
        self.events.iter().map(|e| e.event_id).collect()
    }

    /// Returns `true` unless a post-commit publish failure occurred.
    #[must_use]
    pub fn is_fully_published(&self) -> bool {
        self.publish_failure.is_none()
    }
}

/// Result of a command that changed one aggregate.
#[derive(Debug)]
pub struct CommandResult {
    /// The aggregate affected by the command.
    pub aggregate_id: Uuid,
    /// Version of the aggregate after the command.
    pub version: i64,
    /// Committed events and their publish outcome.
    pub receipt: CommitReceipt,
}

/// How a scope ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeExit {
    /// The transaction committed.
    Committed(CommitReceipt),
    /// The transaction was rolled back; no event was published.
    RolledBack,
}

#[async_trait]
trait PendingSource: Send + Sync {
    async fn drain(&self) -> Vec<EventRecord>;
}

#[async_trait]
impl<A: AggregateRoot> PendingSource for Mutex<A> {
    async fn drain(&self) -> Vec<EventRecord> {
        let mut aggregate = self.lock().await;
        aggregate
            .take_pending_events()
            .iter()
            .map(DomainEvent::to_record)
            .collect()
    }
}

/// Binds one transaction to the events produced inside it.
///
/// One instance serves exactly one request or operation. Dropping an
/// active unit of work drops its session, which rolls the transaction
/// back.
pub struct UnitOfWork<F: SessionFactory> {
    factory: Arc<F>,
    publisher: Arc<dyn EventPublisher>,
    ledger: Option<Arc<dyn PublicationLedger>>,
    state: UnitOfWorkState,
    session: Option<SessionHandle<F::Session>>,
    repositories: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    tracked: Vec<Arc<dyn PendingSource>>,
    tracked_keys: HashMap<(TypeId, Uuid), usize>,
}

impl<F: SessionFactory> fmt::Debug for UnitOfWork<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state)
            .field("repositories", &self.repositories.len())
            .field("tracked", &self.tracked.len())
            .finish_non_exhaustive()
    }
}

impl<F: SessionFactory> UnitOfWork<F> {
    /// Creates an idle unit of work.
    #[must_use]
    pub fn new(factory: Arc<F>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            factory,
            publisher,
            ledger: None,
            state: UnitOfWorkState::Idle,
            session: None,
            repositories: HashMap::new(),
            tracked: Vec::new(),
            tracked_keys: HashMap::new(),
        }
    }

    /// Records fully delivered batches in `ledger` so the reconciliation
    /// sweep can skip them.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn PublicationLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> UnitOfWorkState {
        self.state
    }

    fn misuse(&self, operation: &'static str) -> DomainError {
        DomainError::UnitOfWork {
            operation,
            state: self.state.as_str(),
        }
    }

    fn active_session(
        &self,
        operation: &'static str,
    ) -> Result<&SessionHandle<F::Session>, DomainError> {
        match (&self.state, &self.session) {
            (UnitOfWorkState::Active, Some(session)) => Ok(session),
            _ => Err(self.misuse(operation)),
        }
    }

    /// Opens the transaction: idle → active.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnitOfWork` unless the unit of work is idle, or
    /// the factory's error if the transaction cannot be opened.
    pub async fn enter(&mut self) -> Result<(), DomainError> {
        if self.state != UnitOfWorkState::Idle {
            return Err(self.misuse("enter"));
        }
        let session = self.factory.begin().await?;
        self.session = Some(SessionHandle::new(session));
        self.repositories.clear();
        self.tracked.clear();
        self.tracked_keys.clear();
        self.state = UnitOfWorkState::Active;
        debug!("unit of work entered");
        Ok(())
    }

    /// Adds an aggregate to the set whose events are published on commit.
    ///
    /// Aggregates are keyed by type and id, so tracking the same aggregate
    /// again has no effect. Only the first handle seen for a key is
    /// drained: a second, separately loaded copy with the same id is
    /// ignored with a warning, and its events are neither published nor
    /// cleared. Load each aggregate once per scope.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnitOfWork` unless the unit of work is active.
    pub fn track<A: AggregateRoot>(&mut self, aggregate: &Tracked<A>) -> Result<(), DomainError> {
        self.active_session("track an aggregate")?;
        let shared = aggregate.shared();
        match self.tracked_keys.entry((TypeId::of::<A>(), aggregate.id())) {
            Entry::Vacant(slot) => {
                slot.insert(self.tracked.len());
                self.tracked.push(shared);
            }
            Entry::Occupied(slot) => {
                let known = Arc::as_ptr(&self.tracked[*slot.get()]);
                if !std::ptr::addr_eq(known, Arc::as_ptr(&shared)) {
                    warn!(
                        aggregate_id = %aggregate.id(),
                        "aggregate already tracked through another handle; this copy's events will not be published"
                    );
                }
            }
        }
        Ok(())
    }

    /// Returns the repository of type `R` bound to this transaction,
    /// constructing and caching it on first use.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnitOfWork` unless the unit of work is active.
    pub fn get_repository<R: Repository<F::Session>>(&mut self) -> Result<R, DomainError> {
        let session = self.active_session("get a repository")?.clone();
        let entry = self
            .repositories
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Box::new(R::bind(session)));
        entry
            .downcast_ref::<R>()
            .cloned()
            .ok_or_else(|| DomainError::Infrastructure("repository cache type mismatch".into()))
    }

    /// Closes the scope: active → closed.
    ///
    /// With `had_error` the transaction is rolled back and tracked
    /// aggregates keep their pending events. Otherwise it is committed and
    /// the pending events are drained and published.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnitOfWork` unless the unit of work is active,
    /// or the session's error if commit or rollback fails. A failed commit
    /// publishes nothing.
    pub async fn exit(&mut self, had_error: bool) -> Result<ScopeExit, DomainError> {
        let session = self.active_session("exit")?.clone();
        self.state = UnitOfWorkState::Closed;
        self.session = None;
        self.repositories.clear();
        let tracked = std::mem::take(&mut self.tracked);
        self.tracked_keys.clear();

        let Some(session) = session.take().await else {
            return Err(self.misuse("exit"));
        };

        if had_error {
            session.rollback().await?;
            info!(tracked = tracked.len(), "unit of work rolled back");
            return Ok(ScopeExit::RolledBack);
        }

        session.commit().await?;

        let mut batch = Vec::new();
        for source in &tracked {
            batch.extend(source.drain().await);
        }
        info!(events = batch.len(), "unit of work committed");

        Ok(ScopeExit::Committed(self.publish(batch).await))
    }

    /// Exits according to `outcome`: rolls back on `Err` and returns the
    /// error unchanged, commits on `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the error from `outcome`, or the error from
    /// [`UnitOfWork::exit`] when committing fails.
    pub async fn finish<T>(
        &mut self,
        outcome: Result<T, DomainError>,
    ) -> Result<(T, CommitReceipt), DomainError> {
        match outcome {
            Err(err) => {
                if let Err(rollback_err) = self.exit(true).await {
                    warn!(error = %rollback_err, "rollback after failed operation also failed");
                }
                Err(err)
            }
            Ok(value) => match self.exit(false).await? {
                ScopeExit::Committed(receipt) => Ok((value, receipt)),
                ScopeExit::RolledBack => Err(self.misuse("commit")),
            },
        }
    }

    /// Tracks `aggregate`, applies `mutate` to it and saves it through
    /// `repository`. Returns the aggregate id and its stored version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnitOfWork` unless the unit of work is active,
    /// the error of `mutate`, or the repository's error.
    pub async fn modify<A, R, M>(
        &mut self,
        repository: &R,
        aggregate: A,
        mutate: M,
    ) -> Result<(Uuid, i64), DomainError>
    where
        A: AggregateRoot,
        R: AggregateRepository<A>,
        M: FnOnce(&mut A) -> Result<(), DomainError> + Send,
    {
        let tracked = Tracked::new(aggregate);
        self.track(&tracked)?;
        let mut guard = tracked.lock().await;
        mutate(&mut guard)?;
        let version = repository.save(&guard).await?;
        Ok((tracked.id(), version))
    }

    /// Tracks and saves a newly created aggregate.
    ///
    /// # Errors
    ///
    /// See [`UnitOfWork::modify`].
    pub async fn add<A, R>(&mut self, repository: &R, aggregate: A) -> Result<(Uuid, i64), DomainError>
    where
        A: AggregateRoot,
        R: AggregateRepository<A>,
    {
        self.modify(repository, aggregate, |_| Ok(())).await
    }

    /// Finishes the scope of a command that changed one aggregate.
    ///
    /// # Errors
    ///
    /// See [`UnitOfWork::finish`].
    pub async fn complete(
        mut self,
        outcome: Result<(Uuid, i64), DomainError>,
    ) -> Result<CommandResult, DomainError> {
        let ((aggregate_id, version), receipt) = self.finish(outcome).await?;
        info!(
            aggregate_id = %aggregate_id,
            version,
            events = receipt.events.len(),
            publish_pending = !receipt.is_fully_published(),
            "command committed"
        );
        Ok(CommandResult {
            aggregate_id,
            version,
            receipt,
        })
    }

    async fn publish(&self, events: Vec<EventRecord>) -> CommitReceipt {
        if events.is_empty() {
            return CommitReceipt {
                events,
                publish_failure: None,
            };
        }

        let report = self.publisher.publish(&events).await;

        let publish_failure = if report.is_complete() {
            None
        } else {
            error!(
                attempted = events.len(),
                undelivered = report.undelivered,
                "post-commit publish failure; committed events await reconciliation"
            );
            Some(PublishFailure {
                attempted: events.len(),
                undelivered: report.undelivered,
            })
        };

        if let Some(ledger) = &self.ledger {
            if !report.delivered.is_empty() {
                if let Err(err) = ledger.mark_published(&report.delivered).await {
                    warn!(error = %err, "failed to mark events as published");
                }
            }
        }

        CommitReceipt {
            events,
            publish_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::event::{EventMetadata, SystemClock};
    use crate::publisher::PublishReport;

    #[derive(Debug, Default)]
    struct SessionLog {
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        fail_commit: bool,
    }

    #[derive(Debug)]
    struct FakeSession(Arc<SessionLog>);

    #[async_trait]
    impl Session for FakeSession {
        async fn commit(self) -> Result<(), DomainError> {
            if self.0.fail_commit {
                return Err(DomainError::Infrastructure("commit failed".into()));
            }
            self.0.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(self) -> Result<(), DomainError> {
            self.0.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct FakeFactory(Arc<SessionLog>);

    #[async_trait]
    impl SessionFactory for FakeFactory {
        type Session = FakeSession;

        async fn begin(&self) -> Result<FakeSession, DomainError> {
            self.0.begins.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSession(Arc::clone(&self.0)))
        }
    }

    #[derive(Debug, Default)]
    struct FakePublisher {
        batches: StdMutex<Vec<Vec<EventRecord>>>,
        drop_last: usize,
    }

    #[async_trait]
    impl EventPublisher for FakePublisher {
        async fn publish(&self, events: &[EventRecord]) -> PublishReport {
            self.batches.lock().unwrap().push(events.to_vec());
            let kept = events.len().saturating_sub(self.drop_last);
            PublishReport {
                delivered: events[..kept].iter().map(|e| e.event_id).collect(),
                undelivered: events.len() - kept,
            }
        }
    }

    #[derive(Debug, Default)]
    struct FakeLedger {
        marked: StdMutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl PublicationLedger for FakeLedger {
        async fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), DomainError> {
            self.marked.lock().unwrap().extend_from_slice(event_ids);
            Ok(())
        }

        async fn unpublished_events(
            &self,
            _occurred_before: DateTime<Utc>,
            _limit: i64,
        ) -> Result<Vec<EventRecord>, DomainError> {
            Ok(vec![])
        }
    }

    #[derive(Debug, Clone)]
    struct ScopedRepository {
        instance: Uuid,
        session: SessionHandle<FakeSession>,
    }

    impl Repository<FakeSession> for ScopedRepository {
        fn bind(session: SessionHandle<FakeSession>) -> Self {
            Self {
                instance: Uuid::new_v4(),
                session,
            }
        }
    }

    #[derive(Debug, Clone)]
    struct Noted(EventMetadata);

    impl DomainEvent for Noted {
        fn event_kind(&self) -> &'static str {
            "note.added"
        }

        fn to_payload(&self) -> serde_json::Value {
            serde_json::json!({})
        }

        fn metadata(&self) -> &EventMetadata {
            &self.0
        }
    }

    #[derive(Debug)]
    struct Note {
        id: Uuid,
        version: i64,
        pending: Vec<Noted>,
    }

    impl Note {
        fn new() -> Self {
            Self {
                id: Uuid::new_v4(),
                version: 0,
                pending: Vec::new(),
            }
        }

        fn add(&mut self) -> Uuid {
            let meta = EventMetadata::new(
                "note.added",
                self.id,
                self.next_version(),
                Uuid::new_v4(),
                &SystemClock,
            );
            self.apply(Noted(meta)).0.event_id
        }
    }

    impl AggregateRoot for Note {
        type Event = Noted;

        fn aggregate_id(&self) -> Uuid {
            self.id
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn replay(&mut self, _event: &Noted) {
            self.version += 1;
        }

        fn pending_events(&self) -> &[Noted] {
            &self.pending
        }

        fn pending_events_mut(&mut self) -> &mut Vec<Noted> {
            &mut self.pending
        }
    }

    #[derive(Debug, Default)]
    struct NoteStore {
        saved: StdMutex<Vec<(Uuid, i64)>>,
    }

    #[async_trait]
    impl AggregateRepository<Note> for NoteStore {
        async fn save(&self, note: &Note) -> Result<i64, DomainError> {
            self.saved.lock().unwrap().push((note.id, note.version));
            Ok(note.version)
        }
    }

    fn unit_of_work(
        log: &Arc<SessionLog>,
        publisher: &Arc<FakePublisher>,
    ) -> UnitOfWork<FakeFactory> {
        UnitOfWork::new(
            Arc::new(FakeFactory(Arc::clone(log))),
            Arc::clone(publisher) as Arc<dyn EventPublisher>,
        )
    }

    #[tokio::test]
    async fn test_methods_outside_active_scope_are_programming_errors() {
        // Arrange
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);
        let note = Tracked::new(Note::new());

        // Act / Assert: idle
        assert!(matches!(
            uow.track(&note),
            Err(DomainError::UnitOfWork { state: "idle", .. })
        ));
        assert!(matches!(
            uow.get_repository::<ScopedRepository>(),
            Err(DomainError::UnitOfWork { state: "idle", .. })
        ));
        assert!(matches!(
            uow.exit(false).await,
            Err(DomainError::UnitOfWork { state: "idle", .. })
        ));

        // Act / Assert: closed
        uow.enter().await.unwrap();
        uow.exit(false).await.unwrap();
        assert_eq!(uow.state(), UnitOfWorkState::Closed);
        assert!(matches!(
            uow.enter().await,
            Err(DomainError::UnitOfWork { state: "closed", .. })
        ));
        assert!(matches!(
            uow.track(&note),
            Err(DomainError::UnitOfWork { state: "closed", .. })
        ));
        assert_eq!(log.begins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enter_twice_is_rejected() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);

        uow.enter().await.unwrap();
        let result = uow.enter().await;

        assert!(matches!(
            result,
            Err(DomainError::UnitOfWork {
                operation: "enter",
                state: "active"
            })
        ));
        assert_eq!(log.begins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_repository_caches_one_instance_per_type() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);
        uow.enter().await.unwrap();

        let first = uow.get_repository::<ScopedRepository>().unwrap();
        let second = uow.get_repository::<ScopedRepository>().unwrap();

        assert_eq!(first.instance, second.instance);
    }

    #[tokio::test]
    async fn test_repository_is_unusable_after_exit() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);
        uow.enter().await.unwrap();
        let repo = uow.get_repository::<ScopedRepository>().unwrap();

        uow.exit(false).await.unwrap();
        let result = repo.session.acquire().await;

        assert!(matches!(result, Err(DomainError::UnitOfWork { .. })));
    }

    #[tokio::test]
    async fn test_commit_publishes_in_tracking_then_event_order_and_clears() {
        // Arrange
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);
        let first = Tracked::new(Note::new());
        let second = Tracked::new(Note::new());
        uow.enter().await.unwrap();

        uow.track(&second).unwrap();
        uow.track(&first).unwrap();
        uow.track(&second).unwrap();
        let second_a = second.lock().await.add();
        let second_b = second.lock().await.add();
        let first_a = first.lock().await.add();
        let expected = vec![second_a, second_b, first_a];

        // Act
        let exit = uow.exit(false).await.unwrap();

        // Assert
        let ScopeExit::Committed(receipt) = exit else {
            panic!("expected commit, got {exit:?}");
        };
        assert_eq!(receipt.event_ids(), expected);
        assert!(receipt.is_fully_published());
        let batches = publisher.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].iter().map(|e| e.event_id).collect::<Vec<_>>(),
            expected
        );
        assert!(first.lock().await.pending_events().is_empty());
        assert!(second.lock().await.pending_events().is_empty());
        assert_eq!(log.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rollback_publishes_nothing_and_keeps_pending_events() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);
        let note = Tracked::new(Note::new());
        uow.enter().await.unwrap();
        uow.track(&note).unwrap();
        note.lock().await.add();

        let exit = uow.exit(true).await.unwrap();

        assert_eq!(exit, ScopeExit::RolledBack);
        assert!(publisher.batches.lock().unwrap().is_empty());
        assert_eq!(note.lock().await.pending_events().len(), 1);
        assert_eq!(log.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(log.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_commit_publishes_nothing_and_keeps_pending_events() {
        let log = Arc::new(SessionLog {
            fail_commit: true,
            ..SessionLog::default()
        });
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);
        let note = Tracked::new(Note::new());
        uow.enter().await.unwrap();
        uow.track(&note).unwrap();
        note.lock().await.add();

        let result = uow.exit(false).await;

        assert!(matches!(result, Err(DomainError::Infrastructure(_))));
        assert!(publisher.batches.lock().unwrap().is_empty());
        assert_eq!(note.lock().await.pending_events().len(), 1);
        assert_eq!(uow.state(), UnitOfWorkState::Closed);
    }

    #[tokio::test]
    async fn test_publish_failure_after_commit_is_reported_not_raised() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher {
            drop_last: 1,
            ..FakePublisher::default()
        });
        let marks = Arc::new(FakeLedger::default());
        let mut uow = unit_of_work(&log, &publisher)
            .with_ledger(Arc::clone(&marks) as Arc<dyn PublicationLedger>);
        let note = Tracked::new(Note::new());
        uow.enter().await.unwrap();
        uow.track(&note).unwrap();
        let delivered = note.lock().await.add();
        note.lock().await.add();

        let exit = uow.exit(false).await.unwrap();

        let ScopeExit::Committed(receipt) = exit else {
            panic!("expected commit, got {exit:?}");
        };
        assert_eq!(
            receipt.publish_failure,
            Some(PublishFailure {
                attempted: 2,
                undelivered: 1
            })
        );
        assert_eq!(log.commits.load(Ordering::SeqCst), 1);
        assert!(note.lock().await.pending_events().is_empty());
        assert_eq!(*marks.marked.lock().unwrap(), vec![delivered]);
    }

    #[tokio::test]
    async fn test_finish_rolls_back_on_error_and_returns_it() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);
        uow.enter().await.unwrap();

        let result: Result<((), CommitReceipt), DomainError> = uow
            .finish(Err(DomainError::BusinessRule("nope".into())))
            .await;

        assert!(matches!(result, Err(DomainError::BusinessRule(_))));
        assert_eq!(log.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_commit_without_events_skips_publisher() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);
        uow.enter().await.unwrap();
        uow.track(&Tracked::new(Note::new())).unwrap();

        let (value, receipt) = uow.finish(Ok(7)).await.unwrap();

        assert_eq!(value, 7);
        assert!(receipt.events.is_empty());
        assert!(publisher.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_handle_with_tracked_id_is_ignored() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let mut uow = unit_of_work(&log, &publisher);
        let original = Tracked::new(Note::new());
        let id = original.id();
        let copy = Tracked::new(Note {
            id,
            version: 0,
            pending: Vec::new(),
        });
        uow.enter().await.unwrap();

        uow.track(&original).unwrap();
        uow.track(&copy).unwrap();
        let published = original.lock().await.add();
        copy.lock().await.add();
        let (_, receipt) = uow.finish(Ok(())).await.unwrap();

        assert_eq!(receipt.event_ids(), vec![published]);
        assert_eq!(copy.lock().await.pending_events().len(), 1);
    }

    #[tokio::test]
    async fn test_modify_saves_and_complete_publishes() {
        // Arrange
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let store = NoteStore::default();
        let mut uow = unit_of_work(&log, &publisher);
        let note = Note::new();
        let id = note.id;
        uow.enter().await.unwrap();

        // Act
        let outcome = uow
            .modify(&store, note, |note| {
                note.add();
                note.add();
                Ok(())
            })
            .await;
        let result = uow.complete(outcome).await.unwrap();

        // Assert
        assert_eq!(result.aggregate_id, id);
        assert_eq!(result.version, 2);
        assert_eq!(result.receipt.events.len(), 2);
        assert_eq!(*store.saved.lock().unwrap(), vec![(id, 2)]);
        assert_eq!(log.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_saved_and_rolls_back() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let store = NoteStore::default();
        let mut uow = unit_of_work(&log, &publisher);
        uow.enter().await.unwrap();

        let outcome = uow
            .modify(&store, Note::new(), |_| {
                Err(DomainError::BusinessRule("note is archived".into()))
            })
            .await;
        let result = uow.complete(outcome).await;

        assert!(matches!(result, Err(DomainError::BusinessRule(_))));
        assert!(store.saved.lock().unwrap().is_empty());
        assert!(publisher.batches.lock().unwrap().is_empty());
        assert_eq!(log.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_saves_new_aggregate_without_mutation() {
        let log = Arc::new(SessionLog::default());
        let publisher = Arc::new(FakePublisher::default());
        let store = NoteStore::default();
        let mut uow = unit_of_work(&log, &publisher);
        let mut note = Note::new();
        note.add();
        uow.enter().await.unwrap();

        let outcome = uow.add(&store, note).await;
        let result = uow.complete(outcome).await.unwrap();

        assert_eq!(result.version, 1);
        assert_eq!(publisher.batches.lock().unwrap()[0].len(), 1);
    }
}

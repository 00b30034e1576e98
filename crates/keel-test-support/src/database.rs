//! In-memory transactional store: event store, projection tables and
//! publication ledger behind one `SessionFactory`.
//!
//! Sessions stage their writes and apply them atomically on commit. The
//! `(aggregate_id, version)` key is checked at append time against
//! committed rows and again at commit time, so two sessions racing on the
//! same stream behave like two Postgres transactions hitting the unique
//! index.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::error::DomainError;
use keel_core::publisher::PublicationLedger;
use keel_core::repository::{
    EventRecord, EventStore, ProjectionRow, ProjectionStore, check_contiguous,
};
use keel_core::session::{Session, SessionFactory};
use uuid::Uuid;

type ProjectionKey = (String, Uuid);

#[derive(Debug, Default)]
struct Shared {
    events: BTreeMap<(Uuid, i64), EventRecord>,
    projections: BTreeMap<ProjectionKey, ProjectionRow>,
    published: HashSet<Uuid>,
    begins: usize,
    commits: usize,
    rollbacks: usize,
    fail_next_commit: bool,
}

impl Shared {
    fn highest_version(&self, aggregate_id: Uuid) -> i64 {
        self.events
            .range((aggregate_id, i64::MIN)..=(aggregate_id, i64::MAX))
            .next_back()
            .map_or(0, |((_, version), _)| *version)
    }
}

/// Committed contents of the store, for before/after comparisons.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseSnapshot {
    /// Every committed event, ordered by aggregate then version.
    pub events: Vec<EventRecord>,
    /// Every committed projection row, ordered by projection then id.
    pub projections: Vec<ProjectionRow>,
}

/// An in-memory database shared by every session it opens.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    shared: Arc<Mutex<Shared>>,
}

impl InMemoryDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns the committed contents.
    #[must_use]
    pub fn snapshot(&self) -> DatabaseSnapshot {
        let shared = self.lock();
        DatabaseSnapshot {
            events: shared.events.values().cloned().collect(),
            projections: shared.projections.values().cloned().collect(),
        }
    }

    /// Returns the committed events of one aggregate, ordered by version.
    #[must_use]
    pub fn events_for(&self, aggregate_id: Uuid) -> Vec<EventRecord> {
        self.lock()
            .events
            .range((aggregate_id, i64::MIN)..=(aggregate_id, i64::MAX))
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Returns a committed projection row.
    #[must_use]
    pub fn projection(&self, projection: &str, aggregate_id: Uuid) -> Option<ProjectionRow> {
        self.lock()
            .projections
            .get(&(projection.to_owned(), aggregate_id))
            .cloned()
    }

    /// Returns `true` if the event has been marked as published.
    #[must_use]
    pub fn is_published(&self, event_id: Uuid) -> bool {
        self.lock().published.contains(&event_id)
    }

    /// Number of transactions opened.
    #[must_use]
    pub fn begins(&self) -> usize {
        self.lock().begins
    }

    /// Number of transactions committed.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    /// Number of transactions rolled back explicitly.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    /// Makes the next commit fail with an infrastructure error and discard
    /// its writes.
    pub fn fail_next_commit(&self) {
        self.lock().fail_next_commit = true;
    }
}

#[async_trait]
impl SessionFactory for InMemoryDatabase {
    type Session = InMemorySession;

    async fn begin(&self) -> Result<InMemorySession, DomainError> {
        self.lock().begins += 1;
        Ok(InMemorySession {
            db: self.clone(),
            events: Vec::new(),
            projections: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl PublicationLedger for InMemoryDatabase {
    async fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), DomainError> {
        self.lock().published.extend(event_ids.iter().copied());
        Ok(())
    }

    async fn unpublished_events(
        &self,
        occurred_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRecord>, DomainError> {
        let shared = self.lock();
        let mut pending: Vec<EventRecord> = shared
            .events
            .values()
            .filter(|e| e.occurred_on < occurred_before && !shared.published.contains(&e.event_id))
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.occurred_on
                .cmp(&b.occurred_on)
                .then(a.aggregate_id.cmp(&b.aggregate_id))
                .then(a.version.cmp(&b.version))
        });
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }
}

/// One open transaction against an [`InMemoryDatabase`].
///
/// Dropping the session discards its staged writes.
#[derive(Debug)]
pub struct InMemorySession {
    db: InMemoryDatabase,
    events: Vec<EventRecord>,
    projections: BTreeMap<ProjectionKey, ProjectionRow>,
}

impl InMemorySession {
    fn staged_highest(&self, aggregate_id: Uuid) -> Option<i64> {
        self.events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max()
    }

    fn merged_rows(&self, projection: &str) -> BTreeMap<Uuid, ProjectionRow> {
        let mut rows: BTreeMap<Uuid, ProjectionRow> = self
            .db
            .lock()
            .projections
            .iter()
            .filter(|((name, _), _)| name == projection)
            .map(|((_, id), row)| (*id, row.clone()))
            .collect();
        for ((name, id), row) in &self.projections {
            if name == projection {
                rows.insert(*id, row.clone());
            }
        }
        rows
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn commit(self) -> Result<(), DomainError> {
        let mut shared = self.db.lock();
        if shared.fail_next_commit {
            shared.fail_next_commit = false;
            return Err(DomainError::Infrastructure("simulated commit failure".into()));
        }
        for event in &self.events {
            if shared
                .events
                .contains_key(&(event.aggregate_id, event.version))
            {
                return Err(DomainError::ConcurrencyConflict {
                    aggregate_id: event.aggregate_id,
                    expected: event.version - 1,
                    actual: shared.highest_version(event.aggregate_id),
                });
            }
        }
        for event in self.events {
            shared
                .events
                .insert((event.aggregate_id, event.version), event);
        }
        shared.projections.extend(self.projections);
        shared.commits += 1;
        Ok(())
    }

    async fn rollback(self) -> Result<(), DomainError> {
        self.db.lock().rollbacks += 1;
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemorySession {
    async fn load_events(&mut self, aggregate_id: Uuid) -> Result<Vec<EventRecord>, DomainError> {
        let mut events = self.db.events_for(aggregate_id);
        events.extend(
            self.events
                .iter()
                .filter(|e| e.aggregate_id == aggregate_id)
                .cloned(),
        );
        Ok(events)
    }

    async fn append_events(
        &mut self,
        aggregate_id: Uuid,
        expected_version: i64,
        events: &[EventRecord],
    ) -> Result<i64, DomainError> {
        check_contiguous(aggregate_id, expected_version, events)?;
        let committed = self.db.lock().highest_version(aggregate_id);
        let actual = self.staged_highest(aggregate_id).unwrap_or(committed);
        if expected_version < actual {
            return Err(DomainError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }
        self.events.extend_from_slice(events);
        Ok(events.last().map_or(expected_version, |e| e.version))
    }
}

#[async_trait]
impl ProjectionStore for InMemorySession {
    async fn upsert_projection(&mut self, row: &ProjectionRow) -> Result<(), DomainError> {
        self.projections
            .insert((row.projection.clone(), row.aggregate_id), row.clone());
        Ok(())
    }

    async fn fetch_projection(
        &mut self,
        projection: &str,
        aggregate_id: Uuid,
    ) -> Result<Option<ProjectionRow>, DomainError> {
        let key = (projection.to_owned(), aggregate_id);
        if let Some(row) = self.projections.get(&key) {
            return Ok(Some(row.clone()));
        }
        Ok(self.db.lock().projections.get(&key).cloned())
    }

    async fn find_projections(
        &mut self,
        projection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<ProjectionRow>, DomainError> {
        Ok(self
            .merged_rows(projection)
            .into_values()
            .filter(|row| row.state.get(field).and_then(serde_json::Value::as_str) == Some(value))
            .collect())
    }

    async fn list_projections(
        &mut self,
        projection: &str,
    ) -> Result<Vec<ProjectionRow>, DomainError> {
        Ok(self.merged_rows(projection).into_values().collect())
    }
}

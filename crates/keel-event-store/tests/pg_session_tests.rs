//! Integration tests for `PgSession` and `PgPublicationLedger`.
//!
//! These need a live `PostgreSQL` reachable through `DATABASE_URL`; run
//! them with `cargo test -- --ignored`.

use chrono::{Duration, SubsecRound, Utc};
use keel_core::error::DomainError;
use keel_core::publisher::PublicationLedger;
use keel_core::repository::{EventRecord, EventStore, ProjectionRow, ProjectionStore};
use keel_core::session::{Session, SessionFactory};
use keel_event_store::schema::{EVENTS_TABLE, PROJECTIONS_TABLE};
use keel_event_store::{PgPublicationLedger, PgSessionFactory};
use sqlx::PgPool;
use uuid::Uuid;

/// Helper to build an `EventRecord` with sensible defaults.
fn make_record(aggregate_id: Uuid, version: i64) -> EventRecord {
    EventRecord {
        event_id: Uuid::new_v4(),
        aggregate_id,
        event_kind: "test.happened".to_string(),
        payload: serde_json::json!({"key": "value"}),
        version,
        correlation_id: Uuid::new_v4(),
        causation_id: Uuid::new_v4(),
        occurred_on: (Utc::now() - Duration::seconds(60)).trunc_subsecs(6),
    }
}

async fn count_rows(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

// --- append_events + load_events ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn test_append_and_load_preserve_version_order(pool: PgPool) {
    let factory = PgSessionFactory::new(pool.clone());
    let aggregate_id = Uuid::new_v4();
    let events = vec![
        make_record(aggregate_id, 1),
        make_record(aggregate_id, 2),
        make_record(aggregate_id, 3),
    ];

    let mut session = factory.begin().await.unwrap();
    let committed = session.append_events(aggregate_id, 0, &events).await.unwrap();
    session.commit().await.unwrap();

    let mut session = factory.begin().await.unwrap();
    let loaded = session.load_events(aggregate_id).await.unwrap();
    assert_eq!(committed, 3);
    assert_eq!(loaded, events);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn test_stale_expected_version_conflicts_without_partial_writes(pool: PgPool) {
    let factory = PgSessionFactory::new(pool.clone());
    let aggregate_id = Uuid::new_v4();
    let mut session = factory.begin().await.unwrap();
    session
        .append_events(aggregate_id, 0, &[make_record(aggregate_id, 1), make_record(aggregate_id, 2)])
        .await
        .unwrap();
    session.commit().await.unwrap();

    let mut session = factory.begin().await.unwrap();
    let result = session
        .append_events(aggregate_id, 1, &[make_record(aggregate_id, 2), make_record(aggregate_id, 3)])
        .await;

    assert!(matches!(
        result,
        Err(DomainError::ConcurrencyConflict {
            expected: 1,
            actual: 2,
            ..
        })
    ));
    // The savepoint kept the outer transaction usable.
    assert_eq!(session.load_events(aggregate_id).await.unwrap().len(), 2);
    session.commit().await.unwrap();
    assert_eq!(count_rows(&pool, EVENTS_TABLE).await, 2);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn test_concurrent_writers_exactly_one_wins(pool: PgPool) {
    let factory = PgSessionFactory::new(pool.clone());
    let aggregate_id = Uuid::new_v4();
    let mut seed = factory.begin().await.unwrap();
    seed.append_events(aggregate_id, 0, &[make_record(aggregate_id, 1)])
        .await
        .unwrap();
    seed.commit().await.unwrap();

    let mut first = factory.begin().await.unwrap();
    first
        .append_events(aggregate_id, 1, &[make_record(aggregate_id, 2)])
        .await
        .unwrap();

    let contender = {
        let factory = factory.clone();
        tokio::spawn(async move {
            let mut second = factory.begin().await.unwrap();
            let result = second
                .append_events(aggregate_id, 1, &[make_record(aggregate_id, 2)])
                .await;
            second.rollback().await.unwrap();
            result
        })
    };
    first.commit().await.unwrap();
    let result = contender.await.unwrap();

    assert!(result.unwrap_err().is_concurrency_conflict());
    assert_eq!(count_rows(&pool, EVENTS_TABLE).await, 2);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn test_rollback_discards_events_and_projection(pool: PgPool) {
    let factory = PgSessionFactory::new(pool.clone());
    let aggregate_id = Uuid::new_v4();

    let mut session = factory.begin().await.unwrap();
    session
        .append_events(aggregate_id, 0, &[make_record(aggregate_id, 1)])
        .await
        .unwrap();
    session
        .upsert_projection(&ProjectionRow {
            projection: "things".into(),
            aggregate_id,
            version: 1,
            state: serde_json::json!({"name": "a"}),
        })
        .await
        .unwrap();
    session.rollback().await.unwrap();

    assert_eq!(count_rows(&pool, EVENTS_TABLE).await, 0);
    assert_eq!(count_rows(&pool, PROJECTIONS_TABLE).await, 0);
}

// --- projections ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn test_upsert_overwrites_and_find_filters_by_field(pool: PgPool) {
    let factory = PgSessionFactory::new(pool);
    let owner = Uuid::new_v4().to_string();
    let id = Uuid::new_v4();
    let mut session = factory.begin().await.unwrap();

    for (version, name) in [(1, "first"), (2, "second")] {
        session
            .upsert_projection(&ProjectionRow {
                projection: "things".into(),
                aggregate_id: id,
                version,
                state: serde_json::json!({"name": name, "owner_id": owner}),
            })
            .await
            .unwrap();
    }
    let fetched = session.fetch_projection("things", id).await.unwrap().unwrap();
    let found = session
        .find_projections("things", "owner_id", &owner)
        .await
        .unwrap();
    let other = session
        .find_projections("things", "owner_id", "nobody")
        .await
        .unwrap();

    assert_eq!(fetched.version, 2);
    assert_eq!(fetched.state["name"], "second");
    assert_eq!(found, vec![fetched]);
    assert!(other.is_empty());
}

// --- publication ledger ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn test_ledger_returns_only_unmarked_events(pool: PgPool) {
    let factory = PgSessionFactory::new(pool.clone());
    let ledger = PgPublicationLedger::new(pool);
    let aggregate_id = Uuid::new_v4();
    let one = make_record(aggregate_id, 1);
    let two = make_record(aggregate_id, 2);
    let mut session = factory.begin().await.unwrap();
    session
        .append_events(aggregate_id, 0, &[one.clone(), two.clone()])
        .await
        .unwrap();
    session.commit().await.unwrap();

    ledger.mark_published(&[one.event_id]).await.unwrap();
    let pending = ledger.unpublished_events(Utc::now(), 10).await.unwrap();

    assert_eq!(pending, vec![two]);
}

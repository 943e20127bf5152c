//! Integration tests for the `PostgreSQL` backend.
//!
//! These tests require Docker to be running and will spin up a `PostgreSQL`
//! container using testcontainers.

use std::collections::HashSet;

use eventide_core::{
    aggregate::{Aggregate, EventSource},
    codec::{EventRegistry, JsonCodec},
    event::DomainEvent,
    handler::{DeclareHandlers, Declarations},
    store::{Backend as _, EventStore, StoreError, UnitOfWork as _},
};
use eventide_postgres::{Backend, PostgresConfig};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct NoteCreated {
    text: String,
}

impl DomainEvent for NoteCreated {
    const KIND: &'static str = "note.created";
}

#[derive(Debug, Serialize, Deserialize)]
struct NoteTextChanged {
    text: String,
}

impl DomainEvent for NoteTextChanged {
    const KIND: &'static str = "note.text-changed";
}

#[derive(Debug, Default)]
struct Note {
    text: String,
}

impl DeclareHandlers for Note {
    fn declare_handlers(handlers: &mut Declarations<Self>) {
        handlers
            .handler("on_created", |note: &mut Note, e: &NoteCreated| {
                note.text.clone_from(&e.text);
            })
            .handler("on_text_changed", |note: &mut Note, e: &NoteTextChanged| {
                note.text.clone_from(&e.text);
            });
    }
}

impl Aggregate for Note {
    const TYPE_NAME: &'static str = "note";
}

/// Test helper to set up a `PostgreSQL` container and connection pool.
struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PostgresConfig::new(url).connect().await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }

    async fn store(&self) -> EventStore<Backend> {
        let backend = Backend::new(self.pool.clone());
        backend.migrate().await.unwrap();
        let registry = EventRegistry::new(JsonCodec)
            .with::<NoteCreated>()
            .unwrap()
            .with::<NoteTextChanged>()
            .unwrap();
        EventStore::new(backend, registry)
    }
}

fn created(text: &str) -> NoteCreated {
    NoteCreated {
        text: text.to_owned(),
    }
}

fn changed(text: &str) -> NoteTextChanged {
    NoteTextChanged {
        text: text.to_owned(),
    }
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let db = TestDb::new().await;
    let backend = Backend::new(db.pool.clone());

    backend.migrate().await.unwrap();
    backend.migrate().await.unwrap();

    let aggregates: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM eventide_aggregates")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    let events: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM eventide_events")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(aggregates.0, 0);
    assert_eq!(events.0, 0);
}

#[tokio::test]
async fn save_and_load_round_trip() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let id = Uuid::new_v4();

    let mut note = EventSource::<Note>::new(id).unwrap();
    note.apply(created("first")).unwrap();
    note.apply(changed("second")).unwrap();
    let committed = store.save(&mut note).await.unwrap();

    assert_eq!(committed.len(), 2);
    assert_eq!(store.version_of(id).await.unwrap(), Some(2));

    let loaded = store.load::<Note>(id).await.unwrap();
    assert_eq!(loaded.version(), 2);
    assert_eq!(loaded.state().text, "second");

    let mut history = store.history(id);
    let first = history.next().await.unwrap().unwrap();
    let second = history.next().await.unwrap().unwrap();
    assert!(history.next().await.is_none());
    assert!(first.event.is::<NoteCreated>());
    assert!(second.event.is::<NoteTextChanged>());
    assert!(first.sequence < second.sequence);
    assert!(first.timestamp <= second.timestamp);
}

#[tokio::test]
async fn stale_save_conflicts_and_writes_nothing() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let id = Uuid::new_v4();

    let mut note = EventSource::<Note>::new(id).unwrap();
    note.apply(created("a")).unwrap();
    note.apply(changed("b")).unwrap();
    store.save(&mut note).await.unwrap();

    let mut winner = store.load::<Note>(id).await.unwrap();
    let mut loser = store.load::<Note>(id).await.unwrap();
    winner.apply(changed("c")).unwrap();
    store.save(&mut winner).await.unwrap();

    loser.apply(changed("d")).unwrap();
    let error = store.save(&mut loser).await.unwrap_err();

    match error {
        StoreError::Concurrency(conflict) => {
            assert_eq!(conflict.expected, 2);
            assert_eq!(conflict.actual, 3);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(store.version_of(id).await.unwrap(), Some(3));
    assert_eq!(store.load::<Note>(id).await.unwrap().state().text, "c");
}

#[tokio::test]
async fn racing_creates_commit_exactly_once() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let id = Uuid::new_v4();

    let mut left = EventSource::<Note>::new(id).unwrap();
    let mut right = EventSource::<Note>::new(id).unwrap();
    left.apply(created("left")).unwrap();
    right.apply(created("right")).unwrap();

    let (left, right) = tokio::join!(store.save(&mut left), store.save(&mut right));

    assert_eq!(
        usize::from(left.is_ok()) + usize::from(right.is_ok()),
        1,
        "exactly one create must win"
    );
    assert_eq!(store.version_of(id).await.unwrap(), Some(1));
}

#[tokio::test]
async fn ids_for_type_and_remove_unused() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let used = Uuid::new_v4();
    let unused = Uuid::new_v4();

    let mut note = EventSource::<Note>::new(used).unwrap();
    note.apply(created("kept")).unwrap();
    store.save(&mut note).await.unwrap();

    // An aggregate record without events, as left by an aborted writer.
    let mut uow = store.backend().begin().await.unwrap();
    uow.create_record(&eventide_core::store::AggregateRecord {
        id: unused,
        type_name: Note::TYPE_NAME.to_owned(),
        version: 0,
    })
    .await
    .unwrap();
    uow.commit().await.unwrap();

    assert_eq!(
        store.ids_for::<Note>().await.unwrap(),
        HashSet::from([used, unused])
    );

    assert_eq!(store.remove_unused_providers().await.unwrap(), 1);
    assert_eq!(store.ids_for::<Note>().await.unwrap(), HashSet::from([used]));
    assert_eq!(store.remove_unused_providers().await.unwrap(), 0);
}

#[tokio::test]
async fn rolled_back_unit_of_work_leaves_no_trace() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let id = Uuid::new_v4();

    let mut uow = store.backend().begin().await.unwrap();
    uow.create_record(&eventide_core::store::AggregateRecord {
        id,
        type_name: Note::TYPE_NAME.to_owned(),
        version: 0,
    })
    .await
    .unwrap();
    uow.rollback().await.unwrap();

    assert_eq!(store.version_of(id).await.unwrap(), None);
}

#[tokio::test]
async fn later_batches_replay_after_future_dated_ones() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let id = Uuid::new_v4();

    let mut note = EventSource::<Note>::new(id).unwrap();
    note.apply(created("first")).unwrap();
    store.save(&mut note).await.unwrap();

    // As if the database clock stepped back after the first batch.
    sqlx::query(
        r"
        UPDATE eventide_events
        SET committed_at = now() + interval '1 hour'
        WHERE aggregate_id = $1
        ",
    )
    .bind(id)
    .execute(&db.pool)
    .await
    .unwrap();

    note.apply(changed("second")).unwrap();
    store.save(&mut note).await.unwrap();

    let history: Vec<_> = store
        .history(id)
        .map(Result::unwrap)
        .collect::<Vec<_>>()
        .await;
    assert_eq!(history.len(), 2);
    assert!(history[0].event.is::<NoteCreated>());
    assert!(history[1].event.is::<NoteTextChanged>());
    assert!(history[0].timestamp <= history[1].timestamp);
    assert_eq!(store.load::<Note>(id).await.unwrap().state().text, "second");
}

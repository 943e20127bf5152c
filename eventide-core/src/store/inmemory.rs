//! In-memory backend for tests and demos.
//!
//! A unit of work takes a per-aggregate lock the first time it touches an id
//! and keeps it until commit or rollback. Writers to the same aggregate are
//! serialized; writers to different aggregates and readers only meet briefly
//! on the shared state lock. Writes are staged in the unit of work and only
//! become visible on commit.
//!
//! # Example
//!
//! ```
//! use eventide_core::store::inmemory;
//!
//! let backend = inmemory::Backend::new();
//! ```

use std::{
    collections::{HashMap, HashSet, hash_map::Entry},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    event::EncodedEvent,
    store::{AggregateRecord, RecordStream, StoredRecord},
};

/// Shared in-memory storage. Clones share state.
#[derive(Clone, Default)]
pub struct Backend {
    state: Arc<Mutex<State>>,
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

#[derive(Default)]
struct State {
    aggregates: HashMap<Uuid, AggregateRecord>,
    events: HashMap<Uuid, Vec<StoredRecord>>,
    next_sequence: i64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl State {
    fn event_count(&self, id: Uuid) -> usize {
        self.events.get(&id).map_or(0, Vec::len)
    }

    fn timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = self.last_timestamp.map_or(now, |last| last.max(now));
        self.last_timestamp = Some(stamp);
        stamp
    }
}

impl Backend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn aggregate_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id).or_default())
    }
}

/// Error type for the in-memory backend.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("no aggregate record for {0}")]
    MissingRecord(Uuid),
}

/// Unit of work holding the locks of the aggregates it touched.
pub struct UnitOfWork {
    backend: Backend,
    held: HashMap<Uuid, OwnedMutexGuard<()>>,
    records: HashMap<Uuid, AggregateRecord>,
    events: Vec<(Uuid, EncodedEvent)>,
}

impl UnitOfWork {
    async fn hold(&mut self, id: Uuid) {
        if let Entry::Vacant(slot) = self.held.entry(id) {
            let lock = self.backend.aggregate_lock(id).await;
            slot.insert(lock.lock_owned().await);
        }
    }

    async fn record(&mut self, id: Uuid) -> Option<AggregateRecord> {
        self.hold(id).await;
        if let Some(staged) = self.records.get(&id) {
            return Some(staged.clone());
        }
        let stored = self.backend.state.lock().await.aggregates.get(&id).cloned()?;
        // Pinned for the rest of the unit of work.
        self.records.insert(id, stored.clone());
        Some(stored)
    }
}

impl super::UnitOfWork for UnitOfWork {
    type Error = InMemoryError;

    async fn lock_record(&mut self, id: Uuid) -> Result<Option<AggregateRecord>, Self::Error> {
        Ok(self.record(id).await)
    }

    async fn create_record(
        &mut self,
        record: &AggregateRecord,
    ) -> Result<AggregateRecord, Self::Error> {
        if let Some(existing) = self.record(record.id).await {
            return Ok(existing);
        }
        self.records.insert(record.id, record.clone());
        Ok(record.clone())
    }

    async fn append(&mut self, id: Uuid, events: &[EncodedEvent]) -> Result<(), Self::Error> {
        self.hold(id).await;
        self.events.extend(events.iter().map(|event| (id, event.clone())));
        Ok(())
    }

    async fn refresh_version(&mut self, id: Uuid) -> Result<u64, Self::Error> {
        let mut record = self
            .record(id)
            .await
            .ok_or(InMemoryError::MissingRecord(id))?;
        let staged = self.events.iter().filter(|(owner, _)| *owner == id).count();
        let stored = self.backend.state.lock().await.event_count(id);
        record.version = (stored + staged) as u64;
        let version = record.version;
        self.records.insert(id, record);
        Ok(version)
    }

    async fn commit(self) -> Result<(), Self::Error> {
        let Self {
            backend,
            held,
            records,
            events,
        } = self;
        tracing::trace!(
            records = records.len(),
            events = events.len(),
            "committing in-memory unit of work"
        );
        let mut state = backend.state.lock().await;
        state.aggregates.extend(records);
        for (aggregate_id, event) in events {
            state.next_sequence += 1;
            let record = StoredRecord {
                sequence: state.next_sequence,
                aggregate_id,
                kind: event.kind,
                payload: event.payload,
                committed_at: state.timestamp(),
            };
            state.events.entry(aggregate_id).or_default().push(record);
        }
        drop(state);
        drop(held);
        Ok(())
    }

    async fn rollback(self) -> Result<(), Self::Error> {
        tracing::trace!(
            events = self.events.len(),
            "discarding in-memory unit of work"
        );
        Ok(())
    }
}

impl super::Backend for Backend {
    type Error = InMemoryError;
    type UnitOfWork = UnitOfWork;

    async fn begin(&self) -> Result<UnitOfWork, Self::Error> {
        Ok(UnitOfWork {
            backend: self.clone(),
            held: HashMap::new(),
            records: HashMap::new(),
            events: Vec::new(),
        })
    }

    fn read_history(&self, id: Uuid) -> RecordStream<'_, Self::Error> {
        let state = Arc::clone(&self.state);
        Box::pin(async_stream::stream! {
            // Records committed after the read starts are not included.
            let len = state.lock().await.event_count(id);
            for index in 0..len {
                let record = state
                    .lock()
                    .await
                    .events
                    .get(&id)
                    .and_then(|events| events.get(index))
                    .cloned();
                if let Some(record) = record {
                    yield Ok::<_, InMemoryError>(record);
                }
            }
        })
    }

    async fn ids_for_type(&self, type_name: &str) -> Result<HashSet<Uuid>, Self::Error> {
        let state = self.state.lock().await;
        Ok(state
            .aggregates
            .values()
            .filter(|record| record.type_name == type_name)
            .map(|record| record.id)
            .collect())
    }

    async fn version(&self, id: Uuid) -> Result<Option<u64>, Self::Error> {
        let state = self.state.lock().await;
        Ok(state.aggregates.get(&id).map(|record| record.version))
    }

    async fn remove_unused(&self) -> Result<u64, Self::Error> {
        let mut state = self.state.lock().await;
        let unused: Vec<Uuid> = state
            .aggregates
            .keys()
            .copied()
            .filter(|id| state.event_count(*id) == 0)
            .collect();
        for id in &unused {
            state.aggregates.remove(id);
        }
        Ok(unused.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::store::{Backend as _, UnitOfWork as _};

    fn record(id: Uuid, version: u64) -> AggregateRecord {
        AggregateRecord {
            id,
            type_name: "note".to_owned(),
            version,
        }
    }

    fn encoded(kind: &str) -> EncodedEvent {
        EncodedEvent {
            kind: kind.to_owned(),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let backend = Backend::new();
        let id = Uuid::new_v4();

        let mut uow = backend.begin().await.unwrap();
        uow.create_record(&record(id, 0)).await.unwrap();
        uow.append(id, &[encoded("a"), encoded("b")]).await.unwrap();
        assert_eq!(uow.refresh_version(id).await.unwrap(), 2);
        uow.commit().await.unwrap();

        assert_eq!(backend.version(id).await.unwrap(), Some(2));
        let kinds: Vec<_> = backend
            .read_history(id)
            .map(|r| r.unwrap().kind)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(kinds, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let backend = Backend::new();
        let id = Uuid::new_v4();

        let mut uow = backend.begin().await.unwrap();
        uow.create_record(&record(id, 0)).await.unwrap();
        uow.append(id, &[encoded("a")]).await.unwrap();
        uow.rollback().await.unwrap();

        assert_eq!(backend.version(id).await.unwrap(), None);
        assert_eq!(backend.read_history(id).collect::<Vec<_>>().await.len(), 0);
    }

    #[tokio::test]
    async fn create_record_returns_existing_record() {
        let backend = Backend::new();
        let id = Uuid::new_v4();
        let mut uow = backend.begin().await.unwrap();
        uow.create_record(&record(id, 3)).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = backend.begin().await.unwrap();
        let existing = uow.create_record(&record(id, 0)).await.unwrap();

        assert_eq!(existing.version, 3);
    }

    #[tokio::test]
    async fn sequences_and_timestamps_never_decrease() {
        let backend = Backend::new();
        let id = Uuid::new_v4();
        for _ in 0..3 {
            let mut uow = backend.begin().await.unwrap();
            uow.create_record(&record(id, 0)).await.unwrap();
            uow.append(id, &[encoded("a"), encoded("b")]).await.unwrap();
            uow.refresh_version(id).await.unwrap();
            uow.commit().await.unwrap();
        }

        let records: Vec<_> = backend
            .read_history(id)
            .map(Result::unwrap)
            .collect::<Vec<_>>()
            .await;

        assert_eq!(records.len(), 6);
        assert!(records.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert!(records.windows(2).all(|w| w[0].committed_at <= w[1].committed_at));
    }

    #[tokio::test]
    async fn remove_unused_keeps_records_with_events() {
        let backend = Backend::new();
        let used = Uuid::new_v4();
        let unused = Uuid::new_v4();

        let mut uow = backend.begin().await.unwrap();
        uow.create_record(&record(used, 0)).await.unwrap();
        uow.create_record(&record(unused, 0)).await.unwrap();
        uow.append(used, &[encoded("a")]).await.unwrap();
        uow.refresh_version(used).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(backend.remove_unused().await.unwrap(), 1);
        assert_eq!(backend.version(used).await.unwrap(), Some(1));
        assert_eq!(backend.version(unused).await.unwrap(), None);
        assert_eq!(backend.remove_unused().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refresh_version_requires_a_record() {
        let backend = Backend::new();
        let mut uow = backend.begin().await.unwrap();

        let error = uow.refresh_version(Uuid::new_v4()).await.unwrap_err();

        assert!(matches!(error, InMemoryError::MissingRecord(_)));
    }

    async fn commit_one(backend: &Backend, id: Uuid, kind: &str) {
        let mut uow = backend.begin().await.unwrap();
        uow.create_record(&record(id, 0)).await.unwrap();
        uow.append(id, &[encoded(kind)]).await.unwrap();
        uow.refresh_version(id).await.unwrap();
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn open_unit_of_work_does_not_block_other_aggregates() {
        let backend = Backend::new();
        let busy = Uuid::new_v4();
        let other = Uuid::new_v4();
        commit_one(&backend, other, "a").await;

        let mut open = backend.begin().await.unwrap();
        open.create_record(&record(busy, 0)).await.unwrap();
        open.append(busy, &[encoded("pending")]).await.unwrap();

        let limit = Duration::from_millis(200);
        let history = timeout(limit, backend.read_history(other).collect::<Vec<_>>())
            .await
            .expect("history read blocked");
        assert_eq!(history.len(), 1);
        let ids = timeout(limit, backend.ids_for_type("note"))
            .await
            .expect("ids_for_type blocked")
            .unwrap();
        assert_eq!(ids, HashSet::from([other]));
        let version = timeout(limit, backend.version(other))
            .await
            .expect("version blocked")
            .unwrap();
        assert_eq!(version, Some(1));
        timeout(limit, commit_one(&backend, other, "b"))
            .await
            .expect("save on another aggregate blocked");

        open.rollback().await.unwrap();
        assert_eq!(backend.version(busy).await.unwrap(), None);
        assert_eq!(backend.version(other).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn writers_to_one_aggregate_are_serialized() {
        let backend = Backend::new();
        let id = Uuid::new_v4();

        let mut first = backend.begin().await.unwrap();
        first.lock_record(id).await.unwrap();

        let mut second = backend.begin().await.unwrap();
        let blocked = timeout(Duration::from_millis(50), second.lock_record(id)).await;
        assert!(blocked.is_err());

        first.create_record(&record(id, 0)).await.unwrap();
        first.append(id, &[encoded("a")]).await.unwrap();
        first.refresh_version(id).await.unwrap();
        first.commit().await.unwrap();

        let seen = second.lock_record(id).await.unwrap();
        assert_eq!(seen.map(|r| r.version), Some(1));
    }
}

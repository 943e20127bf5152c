//! Persistence layer.
//!
//! [`EventStore`] owns the save algorithm (encode, lock, version check,
//! append, version update, commit) and history decoding. Backing stores only
//! provide the primitive steps through the [`Backend`] and [`UnitOfWork`]
//! traits; see [`inmemory`] for the reference implementation.
use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_core::Stream;
use thiserror::Error;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{
    aggregate::{Aggregate, EventSource},
    codec::{Codec, CodecError, EventRegistry, JsonCodec},
    concurrency::ConcurrencyConflict,
    config::StoreConfig,
    event::{EncodedEvent, Event, HistoricalEvent},
    handler::MappingError,
};

pub mod inmemory;

/// One row per aggregate instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateRecord {
    pub id: Uuid,
    pub type_name: String,
    /// Number of events committed for `id`.
    pub version: u64,
}

/// An encoded event as read back from a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    /// Store-assigned insertion order, unique across all aggregates.
    pub sequence: i64,
    pub aggregate_id: Uuid,
    pub kind: String,
    pub payload: Vec<u8>,
    pub committed_at: DateTime<Utc>,
}

/// Lazily evaluated stream of stored records.
pub type RecordStream<'a, E> = Pin<Box<dyn Stream<Item = Result<StoredRecord, E>> + Send + 'a>>;

/// Lazily evaluated, decoded event history.
pub type HistoryStream<'a, E> =
    Pin<Box<dyn Stream<Item = Result<HistoricalEvent, StoreError<E>>> + Send + 'a>>;

/// Storage primitives for a backing store.
pub trait Backend: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transaction handle for a single save.
    type UnitOfWork: UnitOfWork<Error = Self::Error>;

    /// Open a unit of work.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when no transaction can be started.
    fn begin(&self) -> impl Future<Output = Result<Self::UnitOfWork, Self::Error>> + Send;

    /// Stream every record for `id` ordered by `(committed_at, sequence)`.
    ///
    /// Implementations must not buffer the whole history before yielding the
    /// first record.
    fn read_history(&self, id: Uuid) -> RecordStream<'_, Self::Error>;

    /// Ids of every aggregate record with the given type name.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the query fails.
    fn ids_for_type(
        &self,
        type_name: &str,
    ) -> impl Future<Output = Result<HashSet<Uuid>, Self::Error>> + Send;

    /// Persisted version of `id`, or `None` if no record exists.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the query fails.
    fn version(&self, id: Uuid) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send;

    /// Delete aggregate records that have no events and return how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the statement fails.
    fn remove_unused(&self) -> impl Future<Output = Result<u64, Self::Error>> + Send;
}

/// An open transaction against a [`Backend`].
///
/// Dropping a unit of work without calling [`UnitOfWork::commit`] discards
/// every staged write.
pub trait UnitOfWork: Send + Sized {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Read the aggregate record for `id`, locking it for the rest of the
    /// transaction where the backend supports row locks.
    fn lock_record(
        &mut self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<AggregateRecord>, Self::Error>> + Send;

    /// Insert `record` unless a record with the same id already exists, then
    /// return the record now stored (locked, as for
    /// [`UnitOfWork::lock_record`]).
    ///
    /// When a concurrent writer created the record first, the returned record
    /// is theirs.
    fn create_record(
        &mut self,
        record: &AggregateRecord,
    ) -> impl Future<Output = Result<AggregateRecord, Self::Error>> + Send;

    /// Append `events` for `id`, assigning sequence numbers and
    /// non-decreasing commit timestamps.
    fn append(
        &mut self,
        id: Uuid,
        events: &[EncodedEvent],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Set the record's version to the number of events stored for `id`,
    /// returning the new version.
    fn refresh_version(&mut self, id: Uuid) -> impl Future<Output = Result<u64, Self::Error>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Error returned by [`EventStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError<E>
where
    E: std::error::Error + 'static,
{
    /// Another writer committed since the event source was loaded.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyConflict),
    /// The operation did not finish within the configured limit.
    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
    /// The id is already used by an aggregate of another type.
    #[error("aggregate {id} is stored as `{actual}`, not `{expected}`")]
    AggregateTypeMismatch {
        id: Uuid,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("store error: {0}")]
    Backend(#[source] E),
}

impl<E: std::error::Error + 'static> StoreError<E> {
    /// Whether repeating the operation (after reloading) may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency(_) | Self::Timeout { .. })
    }

    /// The conflict, if this is a concurrency failure.
    #[must_use]
    pub const fn as_conflict(&self) -> Option<&ConcurrencyConflict> {
        match self {
            Self::Concurrency(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Event store engine over a [`Backend`].
///
/// ```
/// use eventide_core::{
///     codec::{EventRegistry, JsonCodec},
///     config::StoreConfig,
///     store::{EventStore, inmemory},
/// };
/// use std::time::Duration;
///
/// let store = EventStore::new(inmemory::Backend::new(), EventRegistry::new(JsonCodec))
///     .with_config(StoreConfig::new().with_operation_timeout(Duration::from_secs(5)));
/// assert!(store.config().operation_timeout.is_some());
/// ```
#[derive(Clone)]
pub struct EventStore<B, C = JsonCodec> {
    backend: B,
    registry: Arc<EventRegistry<C>>,
    config: StoreConfig,
}

impl<B, C> EventStore<B, C>
where
    B: Backend,
    C: Codec,
{
    #[must_use]
    pub fn new(backend: B, registry: EventRegistry<C>) -> Self {
        Self {
            backend,
            registry: Arc::new(registry),
            config: StoreConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn registry(&self) -> &EventRegistry<C> {
        &self.registry
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, operation: &'static str, future: F) -> Result<T, StoreError<B::Error>>
    where
        F: Future<Output = Result<T, StoreError<B::Error>>>,
    {
        match self.config.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| {
                tracing::warn!(operation, ?limit, "store operation timed out");
                StoreError::Timeout { operation, limit }
            })?,
            None => future.await,
        }
    }

    /// Persist the event source's uncommitted events.
    ///
    /// The batch commits only if the persisted version still equals the
    /// version the source was loaded at. On success the source's changes are
    /// accepted and the committed events are returned for publication. An
    /// empty buffer returns immediately without touching the backend.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Concurrency`] if another writer committed first
    /// - [`StoreError::AggregateTypeMismatch`] if the id belongs to another
    ///   aggregate type
    /// - [`StoreError::Codec`] if an event cannot be encoded
    /// - [`StoreError::Timeout`] or [`StoreError::Backend`] on storage
    ///   failures
    ///
    /// On error nothing is persisted and the source is left unchanged.
    #[tracing::instrument(
        skip(self, source),
        fields(
            aggregate_id = %source.id(),
            aggregate_type = A::TYPE_NAME,
            expected_version = source.version(),
            event_count = source.uncommitted_events().len(),
        )
    )]
    pub async fn save<A: Aggregate>(
        &self,
        source: &mut EventSource<A>,
    ) -> Result<Vec<Event>, StoreError<B::Error>> {
        if !source.has_uncommitted_changes() {
            tracing::trace!("no uncommitted events; skipping save");
            return Ok(Vec::new());
        }

        let encoded = source
            .uncommitted_events()
            .iter()
            .map(|event| self.registry.encode(event))
            .collect::<Result<Vec<_>, _>>()?;

        let record = AggregateRecord {
            id: source.id(),
            type_name: A::TYPE_NAME.to_owned(),
            version: source.version(),
        };
        let version = self
            .bounded("save", self.commit_batch(&record, &encoded))
            .await?;

        let committed = source.accept_changes();
        tracing::debug!(version, "events committed");
        Ok(committed)
    }

    async fn commit_batch(
        &self,
        record: &AggregateRecord,
        events: &[EncodedEvent],
    ) -> Result<u64, StoreError<B::Error>> {
        let mut uow = self.backend.begin().await.map_err(StoreError::Backend)?;
        match Self::append_checked(&mut uow, record, events).await {
            Ok(version) => {
                uow.commit().await.map_err(StoreError::Backend)?;
                Ok(version)
            }
            Err(error) => {
                if let Err(rollback) = uow.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(error)
            }
        }
    }

    async fn append_checked(
        uow: &mut B::UnitOfWork,
        record: &AggregateRecord,
        events: &[EncodedEvent],
    ) -> Result<u64, StoreError<B::Error>> {
        let persisted = match uow.lock_record(record.id).await.map_err(StoreError::Backend)? {
            Some(existing) => existing,
            None => uow
                .create_record(record)
                .await
                .map_err(StoreError::Backend)?,
        };

        if persisted.type_name != record.type_name {
            return Err(StoreError::AggregateTypeMismatch {
                id: record.id,
                expected: record.type_name.clone(),
                actual: persisted.type_name,
            });
        }
        if persisted.version != record.version {
            tracing::debug!(
                expected = record.version,
                actual = persisted.version,
                "version mismatch; rejecting batch"
            );
            return Err(ConcurrencyConflict {
                expected: record.version,
                actual: persisted.version,
            }
            .into());
        }

        uow.append(record.id, events)
            .await
            .map_err(StoreError::Backend)?;
        uow.refresh_version(record.id)
            .await
            .map_err(StoreError::Backend)
    }

    /// Stream the decoded history of `id`, oldest first.
    ///
    /// The stream is lazy and single-pass; each call starts a new read. An
    /// unknown id yields an empty stream. The first error ends the stream.
    pub fn history(&self, id: Uuid) -> HistoryStream<'_, B::Error> {
        let mut records = self.backend.read_history(id);
        let registry = Arc::clone(&self.registry);
        let limit = self.config.operation_timeout;

        Box::pin(async_stream::stream! {
            loop {
                let next = match limit {
                    Some(limit) => match tokio::time::timeout(limit, records.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            yield Err(StoreError::Timeout { operation: "history", limit });
                            return;
                        }
                    },
                    None => records.next().await,
                };
                let Some(next) = next else {
                    return;
                };
                match next {
                    Ok(record) => match registry.decode(&record.kind, &record.payload) {
                        Ok(event) => {
                            tracing::trace!(kind = %record.kind, sequence = record.sequence, "decoded event");
                            yield Ok(HistoricalEvent {
                                timestamp: record.committed_at,
                                sequence: record.sequence,
                                event,
                            });
                        }
                        Err(error) => {
                            yield Err(StoreError::Codec(error));
                            return;
                        }
                    },
                    Err(error) => {
                        yield Err(StoreError::Backend(error));
                        return;
                    }
                }
            }
        })
    }

    /// Rebuild the event source for `id` from its history.
    ///
    /// Unknown ids yield a fresh source at version 0.
    ///
    /// # Errors
    ///
    /// Returns the first read, decode or dispatch failure.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::TYPE_NAME))]
    pub async fn load<A: Aggregate>(&self, id: Uuid) -> Result<EventSource<A>, StoreError<B::Error>> {
        let mut source = EventSource::new(id)?;
        let mut history = self.history(id);
        while let Some(historical) = history.next().await {
            source.replay(&historical?.event)?;
        }
        tracing::trace!(version = source.version(), "aggregate loaded");
        Ok(source)
    }

    /// Ids of every aggregate stored under `type_name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] or [`StoreError::Timeout`].
    #[tracing::instrument(skip(self))]
    pub async fn ids_for_type(&self, type_name: &str) -> Result<HashSet<Uuid>, StoreError<B::Error>> {
        self.bounded("ids_for_type", async {
            self.backend
                .ids_for_type(type_name)
                .await
                .map_err(StoreError::Backend)
        })
        .await
    }

    /// Ids of every stored `A`.
    ///
    /// # Errors
    ///
    /// See [`EventStore::ids_for_type`].
    pub async fn ids_for<A: Aggregate>(&self) -> Result<HashSet<Uuid>, StoreError<B::Error>> {
        self.ids_for_type(A::TYPE_NAME).await
    }

    /// Persisted version of `id`, or `None` if it was never saved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] or [`StoreError::Timeout`].
    pub async fn version_of(&self, id: Uuid) -> Result<Option<u64>, StoreError<B::Error>> {
        self.bounded("version_of", async {
            self.backend.version(id).await.map_err(StoreError::Backend)
        })
        .await
    }

    /// Delete aggregate records that have no committed events.
    ///
    /// Records with at least one event are never removed. Returns the number
    /// of records deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] or [`StoreError::Timeout`].
    #[tracing::instrument(skip(self))]
    pub async fn remove_unused_providers(&self) -> Result<u64, StoreError<B::Error>> {
        let removed = self
            .bounded("remove_unused_providers", async {
                self.backend.remove_unused().await.map_err(StoreError::Backend)
            })
            .await?;
        tracing::debug!(removed, "removed unused aggregate records");
        Ok(removed)
    }
}

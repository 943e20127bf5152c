#![doc = include_str!("../README.md")]

pub use eventide_core::{
    aggregate,
    aggregate::{Aggregate, EventSource},
    codec,
    codec::{Codec, CodecError, EventRegistry, JsonCodec},
    command,
    command::{CommandError, Handle, Retried},
    concurrency::ConcurrencyConflict,
    config,
    config::{RetryPolicy, StoreConfig},
    event,
    event::{DomainEvent, Event, HistoricalEvent},
    handler,
    handler::{DeclareHandlers, Declarations, HandlerMap, MappingError},
};

pub mod store {
    pub use eventide_core::store::{EventStore, HistoryStream, StoreError};

    // Storage primitives for backend implementors only.
    // Most users should interact with the EventStore API instead.
    #[doc(hidden)]
    pub use eventide_core::store::{AggregateRecord, Backend, RecordStream, StoredRecord, UnitOfWork};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use eventide_postgres::{Backend, Error, PostgresConfig, SCHEMA, UnitOfWork};
    }

    pub use eventide_core::store::inmemory;
}

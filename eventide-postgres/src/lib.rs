//! Postgres-backed storage for eventide.
//!
//! This crate provides [`Backend`], a `PostgreSQL` implementation of
//! [`eventide_core::store::Backend`]. Plug it into
//! [`EventStore`](eventide_core::store::EventStore) to get transactional
//! saves with row-locked version checks and cursor-streamed histories.
//!
//! ```no_run
//! use eventide_core::{
//!     codec::{EventRegistry, JsonCodec},
//!     store::EventStore,
//! };
//! use eventide_postgres::{Backend, PostgresConfig};
//!
//! # async fn run() -> Result<(), eventide_postgres::Error> {
//! let backend = Backend::connect(&PostgresConfig::from_env()?).await?;
//! backend.migrate().await?;
//! let _store = EventStore::new(backend, EventRegistry::new(JsonCodec));
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod store;

pub use config::PostgresConfig;
pub use error::Error;
pub use store::{Backend, SCHEMA, UnitOfWork};

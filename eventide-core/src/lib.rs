//! Core traits and types for the eventide event-sourcing library.
//!
//! This crate provides the foundational abstractions for event sourcing:
//!
//! - [`event`] - The immutable [`Event`](event::Event) value and the
//!   [`DomainEvent`](event::DomainEvent) marker trait
//! - [`codec`] - Payload serialization (`Codec`, `JsonCodec`) and the
//!   kind-keyed [`EventRegistry`](codec::EventRegistry)
//! - [`handler`] - Handler declarations and the per-type
//!   [`HandlerMap`](handler::HandlerMap) used for dispatch
//! - [`aggregate`] - [`Aggregate`](aggregate::Aggregate) and the
//!   [`EventSource`](aggregate::EventSource) wrapper holding version and
//!   uncommitted events
//! - [`command`] - Command handling (`Handle`) and command execution
//! - [`store`] - The [`EventStore`](store::EventStore) engine plus the
//!   `Backend`/`UnitOfWork` persistence contract
//! - [`concurrency`] - Optimistic concurrency conflicts
//! - [`config`] - Store configuration
//!
//! # Example
//!
//! ```
//! use eventide_core::{
//!     codec::{EventRegistry, JsonCodec},
//!     store::{EventStore, inmemory},
//! };
//!
//! let registry = EventRegistry::new(JsonCodec);
//! let store = EventStore::new(inmemory::Backend::new(), registry);
//! ```
//!
//! Most users should depend on the `eventide` crate, which re-exports these
//! types with a cleaner API surface.

pub mod aggregate;
pub mod codec;
pub mod command;
pub mod concurrency;
pub mod config;
pub mod event;
pub mod handler;
pub mod store;

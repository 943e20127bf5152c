//! Domain events.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. [`Event`] is the type-erased, immutable value that flows
//! through handler maps, aggregates and the store. It intentionally avoids
//! persistence concerns; serialization is handled by the
//! [`EventRegistry`](crate::codec::EventRegistry).

use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};

/// Marker trait for concrete event types.
///
/// Each event carries a unique [`Self::KIND`] identifier so the store can
/// route stored bytes back to the correct type when rebuilding aggregates.
/// When an event's schema changes incompatibly, give the new shape a new
/// kind (for example `note.created.v2`) and register the old one as an
/// upcast.
pub trait DomainEvent: fmt::Debug + Send + Sync + 'static {
    const KIND: &'static str;
}

trait Payload: fmt::Debug + Send + Sync {
    fn kind(&self) -> &'static str;
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl<E: DomainEvent> Payload for E {
    fn kind(&self) -> &'static str {
        E::KIND
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<E>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An immutable fact describing a state change.
///
/// Cloning an `Event` is cheap: the payload is shared, never copied or
/// mutated.
#[derive(Clone)]
pub struct Event {
    payload: Arc<dyn Payload>,
}

impl Event {
    pub fn new<E: DomainEvent>(event: E) -> Self {
        Self {
            payload: Arc::new(event),
        }
    }

    /// The type tag identifying the concrete event shape.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Rust type name of the payload, used in diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// Runtime type of the payload.
    #[must_use]
    pub fn payload_type_id(&self) -> TypeId {
        self.payload.as_any().type_id()
    }

    #[must_use]
    pub fn is<E: DomainEvent>(&self) -> bool {
        self.payload_type_id() == TypeId::of::<E>()
    }

    #[must_use]
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.payload.as_any().downcast_ref::<E>()
    }
}

impl<E: DomainEvent> From<E> for Event {
    fn from(event: E) -> Self {
        Self::new(event)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind())
            .field("payload", &self.payload)
            .finish()
    }
}

/// Event serialized for storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedEvent {
    pub kind: String,
    pub payload: Vec<u8>,
}

/// Event read back from the store.
///
/// Ordered by `timestamp`, with `sequence` (the store-assigned insertion
/// order) breaking ties so the order is total and stable.
#[derive(Clone, Debug)]
pub struct HistoricalEvent {
    pub timestamp: DateTime<Utc>,
    pub sequence: i64,
    pub event: Event,
}

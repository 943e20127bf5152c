//! Serialization and deserialization of event payloads.
//!
//! The store never looks inside payloads. A [`Codec`] turns values into
//! bytes, and the [`EventRegistry`] maps each event kind to the concrete
//! type that should be serialized or reconstructed, so dispatch on the read
//! path is a table lookup by kind.

use std::{collections::HashMap, fmt};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::event::{DomainEvent, EncodedEvent, Event};

/// Serialization strategy used for event payloads.
pub trait Codec: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Serialize a value.
    ///
    /// # Errors
    ///
    /// Returns a codec-specific error if serialization fails.
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize;

    /// Deserialize a value.
    ///
    /// # Errors
    ///
    /// Returns a codec-specific error if deserialization fails.
    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize,
    {
        serde_json::to_vec(value)
    }

    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(data)
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error raised while encoding or decoding events.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No type is registered for the kind found on a stored or outgoing
    /// event.
    #[error("unknown event kind `{kind}`")]
    UnknownKind { kind: String },
    /// Two registrations claimed the same kind.
    #[error("event kind `{kind}` is already registered")]
    DuplicateKind { kind: &'static str },
    /// The kind is registered for reading legacy data only.
    #[error("event kind `{kind}` is a legacy kind and cannot be written")]
    NotEncodable { kind: &'static str },
    /// The event's runtime type differs from the type registered for its kind.
    #[error("event kind `{kind}` is registered for `{expected}`, got `{actual}`")]
    TypeMismatch {
        kind: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("failed to serialize `{kind}` event: {source}")]
    Serialize {
        kind: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("failed to deserialize `{kind}` event: {source}")]
    Deserialize {
        kind: String,
        #[source]
        source: BoxError,
    },
}

type EncodeFn<C> = fn(&C, &Event) -> Result<Vec<u8>, CodecError>;
type DecodeFn<C> = fn(&C, &[u8]) -> Result<Event, CodecError>;

struct Entry<C> {
    type_name: &'static str,
    encode: Option<EncodeFn<C>>,
    decode: DecodeFn<C>,
}

impl<C> Clone for Entry<C> {
    fn clone(&self) -> Self {
        Self {
            type_name: self.type_name,
            encode: self.encode,
            decode: self.decode,
        }
    }
}

/// Registry mapping event kinds to their concrete types.
///
/// Registration is eager and validated: each kind may be claimed once.
/// Legacy kinds registered with [`register_upcast`](Self::register_upcast)
/// are decoded and converted to their current shape, but never written.
#[derive(Clone)]
pub struct EventRegistry<C = JsonCodec> {
    codec: C,
    entries: HashMap<&'static str, Entry<C>>,
}

impl<C: Codec> EventRegistry<C> {
    #[must_use]
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn codec(&self) -> &C {
        &self.codec
    }

    /// Register an event type under its [`DomainEvent::KIND`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::DuplicateKind`] if the kind is already taken.
    pub fn register<E>(&mut self) -> Result<&mut Self, CodecError>
    where
        E: DomainEvent + Serialize + DeserializeOwned,
    {
        self.insert(
            E::KIND,
            Entry {
                type_name: std::any::type_name::<E>(),
                encode: Some(encode_as::<C, E>),
                decode: decode_as::<C, E>,
            },
        )?;
        Ok(self)
    }

    /// Register a legacy event shape that is upgraded to `Current` on read.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::DuplicateKind`] if the legacy kind is already
    /// taken.
    pub fn register_upcast<Legacy, Current>(&mut self) -> Result<&mut Self, CodecError>
    where
        Legacy: DomainEvent + DeserializeOwned + Into<Current>,
        Current: DomainEvent,
    {
        self.insert(
            Legacy::KIND,
            Entry {
                type_name: std::any::type_name::<Legacy>(),
                encode: None,
                decode: upcast_as::<C, Legacy, Current>,
            },
        )?;
        Ok(self)
    }

    /// Builder-style variant of [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::DuplicateKind`] if the kind is already taken.
    pub fn with<E>(mut self) -> Result<Self, CodecError>
    where
        E: DomainEvent + Serialize + DeserializeOwned,
    {
        self.register::<E>()?;
        Ok(self)
    }

    fn insert(&mut self, kind: &'static str, entry: Entry<C>) -> Result<(), CodecError> {
        if self.entries.contains_key(kind) {
            return Err(CodecError::DuplicateKind { kind });
        }
        tracing::trace!(kind, type_name = entry.type_name, "event kind registered");
        self.entries.insert(kind, entry);
        Ok(())
    }

    #[must_use]
    pub fn is_registered(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    /// Registered kinds, in no particular order.
    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Serialize an event for storage.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the kind is unknown, legacy, registered
    /// for another type, or the codec fails.
    pub fn encode(&self, event: &Event) -> Result<EncodedEvent, CodecError> {
        let kind = event.kind();
        let entry = self.entries.get(kind).ok_or_else(|| CodecError::UnknownKind {
            kind: kind.to_owned(),
        })?;
        let encode = entry.encode.ok_or(CodecError::NotEncodable { kind })?;
        let payload = encode(&self.codec, event)?;
        Ok(EncodedEvent {
            kind: kind.to_owned(),
            payload,
        })
    }

    /// Reconstruct an event from its stored kind and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownKind`] for unregistered kinds and
    /// [`CodecError::Deserialize`] if the payload does not match the
    /// registered shape.
    pub fn decode(&self, kind: &str, payload: &[u8]) -> Result<Event, CodecError> {
        let entry = self.entries.get(kind).ok_or_else(|| CodecError::UnknownKind {
            kind: kind.to_owned(),
        })?;
        (entry.decode)(&self.codec, payload)
    }
}

impl<C: Codec + Default> Default for EventRegistry<C> {
    fn default() -> Self {
        Self::new(C::default())
    }
}

impl<C: fmt::Debug> fmt::Debug for EventRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.entries.keys().collect();
        kinds.sort_unstable();
        f.debug_struct("EventRegistry")
            .field("codec", &self.codec)
            .field("kinds", &kinds)
            .finish()
    }
}

fn encode_as<C, E>(codec: &C, event: &Event) -> Result<Vec<u8>, CodecError>
where
    C: Codec,
    E: DomainEvent + Serialize,
{
    let typed = event
        .downcast_ref::<E>()
        .ok_or_else(|| CodecError::TypeMismatch {
            kind: E::KIND,
            expected: std::any::type_name::<E>(),
            actual: event.type_name(),
        })?;
    codec
        .serialize(typed)
        .map_err(|source| CodecError::Serialize {
            kind: E::KIND,
            source: Box::new(source),
        })
}

fn decode_as<C, E>(codec: &C, payload: &[u8]) -> Result<Event, CodecError>
where
    C: Codec,
    E: DomainEvent + DeserializeOwned,
{
    codec
        .deserialize::<E>(payload)
        .map(Event::new)
        .map_err(|source| CodecError::Deserialize {
            kind: E::KIND.to_owned(),
            source: Box::new(source),
        })
}

fn upcast_as<C, Legacy, Current>(codec: &C, payload: &[u8]) -> Result<Event, CodecError>
where
    C: Codec,
    Legacy: DomainEvent + DeserializeOwned + Into<Current>,
    Current: DomainEvent,
{
    let legacy = codec
        .deserialize::<Legacy>(payload)
        .map_err(|source| CodecError::Deserialize {
            kind: Legacy::KIND.to_owned(),
            source: Box::new(source),
        })?;
    Ok(Event::new::<Current>(legacy.into()))
}

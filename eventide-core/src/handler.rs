//! Event handler declarations and type-directed dispatch.
//!
//! Aggregates describe the operations that apply events to them by
//! implementing [`DeclareHandlers`]. Each [`Declaration`] records the
//! operation's name, how it is bound (to an instance or to the type), and the
//! event types it takes. [`HandlerMap::build`] validates the declarations
//! once and produces an ordered map from event kind to [`Handler`].
//!
//! Handlers receive the aggregate as an argument instead of capturing it, so
//! a map is structural and can be shared by every instance of the type.
//! [`HandlerMap::for_type`] builds it lazily and caches it per type;
//! [`HandlerMap::bind`] pairs it with a single instance for invocation.
//!
//! ```
//! use eventide_core::{
//!     event::{DomainEvent, Event},
//!     handler::{DeclareHandlers, Declarations, HandlerMap},
//! };
//!
//! #[derive(Debug)]
//! struct Opened;
//! impl DomainEvent for Opened {
//!     const KIND: &'static str = "door.opened";
//! }
//!
//! #[derive(Default)]
//! struct Door {
//!     open: bool,
//! }
//!
//! impl DeclareHandlers for Door {
//!     fn declare_handlers(handlers: &mut Declarations<Self>) {
//!         handlers.handler("on_opened", |door: &mut Door, _: &Opened| door.open = true);
//!     }
//! }
//!
//! let map = HandlerMap::<Door>::for_type().unwrap();
//! let mut door = Door::default();
//! map.bind(&mut door).invoke(&Event::new(Opened)).unwrap();
//! assert!(door.open);
//! ```

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

use thiserror::Error;

use crate::event::{DomainEvent, Event};

/// Error raised while building a handler map or dispatching through it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// A handler was declared on the type rather than on an instance.
    #[error("illegal static handler `{aggregate}::{method}`: handlers must be bound to an instance")]
    IllegalStaticHandler {
        aggregate: &'static str,
        method: &'static str,
    },
    /// A handler was declared with a parameter count other than one.
    #[error(
        "illegal handler arity for `{aggregate}::{method}`: expected exactly one event \
         parameter, found {arity}"
    )]
    IllegalHandlerArity {
        aggregate: &'static str,
        method: &'static str,
        arity: usize,
    },
    /// Two handlers were declared for the same event kind.
    #[error("duplicate handler for `{kind}` on `{aggregate}` (`{first}` and `{second}`)")]
    DuplicateHandler {
        aggregate: &'static str,
        kind: &'static str,
        first: &'static str,
        second: &'static str,
    },
    /// A handler was invoked with an event of a different runtime type.
    #[error("argument type mismatch: handler expects `{expected}`, got `{actual}`")]
    ArgumentTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    /// A handler was invoked with the wrong number of events.
    #[error("handler expects {expected} argument(s), got {actual}")]
    ArgumentCount { expected: usize, actual: usize },
    /// No handler is registered for the event's kind.
    #[error("`{aggregate}` has no handler for `{kind}`")]
    NoHandler {
        aggregate: &'static str,
        kind: &'static str,
    },
    /// A handler was requested by a position past the end of the map.
    #[error("`{aggregate}` has no handler at index {index} ({len} declared)")]
    NoHandlerAt {
        aggregate: &'static str,
        index: usize,
        len: usize,
    },
}

/// How a declared operation is bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Receiver {
    /// Operates on an aggregate instance.
    Instance,
    /// Type-level operation with no instance.
    Associated,
}

/// Identity of an event type, as seen by a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventType {
    kind: &'static str,
    type_name: &'static str,
    type_id: TypeId,
}

impl EventType {
    #[must_use]
    pub fn of<E: DomainEvent>() -> Self {
        Self {
            kind: E::KIND,
            type_name: std::any::type_name::<E>(),
            type_id: TypeId::of::<E>(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }
}

type Invoker<A> = Arc<dyn Fn(&mut A, &[&Event]) -> Result<(), MappingError> + Send + Sync>;

/// A declared operation, before validation.
pub struct Declaration<A> {
    method: &'static str,
    receiver: Receiver,
    params: Vec<EventType>,
    invoker: Invoker<A>,
}

impl<A> Declaration<A> {
    #[must_use]
    pub const fn method(&self) -> &'static str {
        self.method
    }

    #[must_use]
    pub const fn receiver(&self) -> Receiver {
        self.receiver
    }

    #[must_use]
    pub fn params(&self) -> &[EventType] {
        &self.params
    }
}

impl<A> fmt::Debug for Declaration<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("method", &self.method)
            .field("receiver", &self.receiver)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

fn argument<'e, E: DomainEvent>(
    args: &[&'e Event],
    index: usize,
    arity: usize,
) -> Result<&'e E, MappingError> {
    let event: &'e Event = *args.get(index).ok_or(MappingError::ArgumentCount {
        expected: arity,
        actual: args.len(),
    })?;
    event
        .downcast_ref::<E>()
        .ok_or_else(|| MappingError::ArgumentTypeMismatch {
            expected: std::any::type_name::<E>(),
            actual: event.type_name(),
        })
}

/// Ordered list of handler declarations for an aggregate type.
pub struct Declarations<A> {
    aggregate: &'static str,
    items: Vec<Declaration<A>>,
}

impl<A: 'static> Declarations<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            aggregate: std::any::type_name::<A>(),
            items: Vec::new(),
        }
    }

    /// Declare an instance handler for events of type `E`.
    pub fn handler<E, F>(&mut self, method: &'static str, apply: F) -> &mut Self
    where
        E: DomainEvent,
        F: Fn(&mut A, &E) + Send + Sync + 'static,
    {
        self.push(Declaration {
            method,
            receiver: Receiver::Instance,
            params: vec![EventType::of::<E>()],
            invoker: Arc::new(move |target, args| {
                let event = argument::<E>(args, 0, 1)?;
                apply(target, event);
                Ok(())
            }),
        })
    }

    /// Declare a type-level operation taking an `E`.
    ///
    /// Such declarations are rejected when the map is built.
    pub fn associated<E, F>(&mut self, method: &'static str, apply: F) -> &mut Self
    where
        E: DomainEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.push(Declaration {
            method,
            receiver: Receiver::Associated,
            params: vec![EventType::of::<E>()],
            invoker: Arc::new(move |_, args| {
                apply(argument::<E>(args, 0, 1)?);
                Ok(())
            }),
        })
    }

    /// Declare an instance operation that takes no event.
    ///
    /// Such declarations are rejected when the map is built.
    pub fn nullary<F>(&mut self, method: &'static str, apply: F) -> &mut Self
    where
        F: Fn(&mut A) + Send + Sync + 'static,
    {
        self.push(Declaration {
            method,
            receiver: Receiver::Instance,
            params: Vec::new(),
            invoker: Arc::new(move |target, _| {
                apply(target);
                Ok(())
            }),
        })
    }

    /// Declare an instance operation that takes two events.
    ///
    /// Such declarations are rejected when the map is built.
    pub fn binary<E1, E2, F>(&mut self, method: &'static str, apply: F) -> &mut Self
    where
        E1: DomainEvent,
        E2: DomainEvent,
        F: Fn(&mut A, &E1, &E2) + Send + Sync + 'static,
    {
        self.push(Declaration {
            method,
            receiver: Receiver::Instance,
            params: vec![EventType::of::<E1>(), EventType::of::<E2>()],
            invoker: Arc::new(move |target, args| {
                let first = argument::<E1>(args, 0, 2)?;
                let second = argument::<E2>(args, 1, 2)?;
                apply(target, first, second);
                Ok(())
            }),
        })
    }

    /// Append a pre-built declaration.
    pub fn push(&mut self, declaration: Declaration<A>) -> &mut Self {
        self.items.push(declaration);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Declaration<A>> {
        self.items.iter()
    }
}

impl<A: 'static> Default for Declarations<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability of types that declare event handlers.
pub trait DeclareHandlers: Sized + 'static {
    /// Register this type's handlers, in the order they should be listed.
    fn declare_handlers(handlers: &mut Declarations<Self>);
}

/// A validated, single-event handler.
pub struct Handler<A> {
    method: &'static str,
    event_type: EventType,
    invoker: Invoker<A>,
}

impl<A> Handler<A> {
    #[must_use]
    pub const fn method(&self) -> &'static str {
        self.method
    }

    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Apply `event` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::ArgumentTypeMismatch`] if the event's runtime
    /// type is not exactly the handled type. The handler body does not run
    /// in that case.
    pub fn invoke(&self, target: &mut A, event: &Event) -> Result<(), MappingError> {
        if event.payload_type_id() != self.event_type.type_id {
            return Err(MappingError::ArgumentTypeMismatch {
                expected: self.event_type.type_name,
                actual: event.type_name(),
            });
        }
        tracing::trace!(method = self.method, kind = event.kind(), "invoking event handler");
        (self.invoker)(target, &[event])
    }
}

impl<A> fmt::Debug for Handler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("method", &self.method)
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

type MapCache = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

fn cache() -> &'static RwLock<MapCache> {
    static CACHE: OnceLock<RwLock<MapCache>> = OnceLock::new();
    CACHE.get_or_init(RwLock::default)
}

/// Ordered mapping from event kind to the handler that applies it.
///
/// Iteration follows declaration order.
pub struct HandlerMap<A> {
    aggregate: &'static str,
    handlers: Vec<Handler<A>>,
    by_kind: HashMap<&'static str, usize>,
}

impl<A: 'static> HandlerMap<A> {
    /// Validate `declarations` and build the map.
    ///
    /// # Errors
    ///
    /// - [`MappingError::IllegalStaticHandler`] for type-level declarations
    /// - [`MappingError::IllegalHandlerArity`] for declarations with zero or
    ///   several parameters
    /// - [`MappingError::DuplicateHandler`] when two declarations handle the
    ///   same kind
    pub fn build(declarations: Declarations<A>) -> Result<Self, MappingError> {
        let aggregate = declarations.aggregate;
        let mut handlers = Vec::with_capacity(declarations.items.len());
        let mut by_kind = HashMap::with_capacity(declarations.items.len());

        for declaration in declarations.items {
            if declaration.receiver == Receiver::Associated {
                return Err(MappingError::IllegalStaticHandler {
                    aggregate,
                    method: declaration.method,
                });
            }
            let [event_type] = declaration.params[..] else {
                return Err(MappingError::IllegalHandlerArity {
                    aggregate,
                    method: declaration.method,
                    arity: declaration.params.len(),
                });
            };
            if let Some(&existing) = by_kind.get(event_type.kind) {
                let first: &Handler<A> = &handlers[existing];
                return Err(MappingError::DuplicateHandler {
                    aggregate,
                    kind: event_type.kind,
                    first: first.method,
                    second: declaration.method,
                });
            }
            by_kind.insert(event_type.kind, handlers.len());
            handlers.push(Handler {
                method: declaration.method,
                event_type,
                invoker: declaration.invoker,
            });
        }

        tracing::debug!(aggregate, handlers = handlers.len(), "handler map built");
        Ok(Self {
            aggregate,
            handlers,
            by_kind,
        })
    }

    /// Build a map from `A`'s own declarations.
    ///
    /// # Errors
    ///
    /// See [`HandlerMap::build`].
    pub fn from_declarations() -> Result<Self, MappingError>
    where
        A: DeclareHandlers,
    {
        let mut declarations = Declarations::new();
        A::declare_handlers(&mut declarations);
        Self::build(declarations)
    }

    /// The shared map for `A`, built on first use.
    ///
    /// Failed builds are not cached, so the same error is reported on every
    /// call.
    ///
    /// # Errors
    ///
    /// See [`HandlerMap::build`].
    pub fn for_type() -> Result<Arc<Self>, MappingError>
    where
        A: DeclareHandlers,
    {
        let key = TypeId::of::<A>();

        // Fast path: check cache with read lock.
        {
            let cache = cache().read().unwrap_or_else(PoisonError::into_inner);
            if let Some(map) = cache.get(&key).cloned()
                && let Ok(map) = map.downcast::<Self>()
            {
                return Ok(map);
            }
        }

        let built = Arc::new(Self::from_declarations()?);
        let mut cache = cache().write().unwrap_or_else(PoisonError::into_inner);
        let entry = cache
            .entry(key)
            .or_insert_with(|| Arc::clone(&built) as Arc<dyn Any + Send + Sync>);
        Ok(Arc::clone(entry).downcast::<Self>().unwrap_or(built))
    }

    /// Name of the aggregate type the map was built for.
    #[must_use]
    pub const fn aggregate(&self) -> &'static str {
        self.aggregate
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handlers in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Handler<A>> {
        self.handlers.iter()
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&Handler<A>> {
        self.by_kind.get(kind).map(|&index| &self.handlers[index])
    }

    #[must_use]
    pub fn handles(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    /// Route `event` to its handler and apply it to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::NoHandler`] if no handler is registered for
    /// the event's kind, or [`MappingError::ArgumentTypeMismatch`] if the
    /// registered handler expects another type.
    pub fn dispatch(&self, target: &mut A, event: &Event) -> Result<(), MappingError> {
        let handler = self.get(event.kind()).ok_or(MappingError::NoHandler {
            aggregate: self.aggregate,
            kind: event.kind(),
        })?;
        handler.invoke(target, event)
    }

    /// Bind the map to one aggregate instance.
    pub fn bind<'a>(&'a self, target: &'a mut A) -> BoundHandlers<'a, A> {
        BoundHandlers { map: self, target }
    }
}

impl<A> fmt::Debug for HandlerMap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMap")
            .field("aggregate", &self.aggregate)
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// A [`HandlerMap`] bound to a single aggregate instance.
pub struct BoundHandlers<'a, A> {
    map: &'a HandlerMap<A>,
    target: &'a mut A,
}

impl<A: 'static> BoundHandlers<'_, A> {
    /// Apply `event` to the bound instance.
    ///
    /// # Errors
    ///
    /// See [`HandlerMap::dispatch`].
    pub fn invoke(&mut self, event: &Event) -> Result<(), MappingError> {
        self.map.dispatch(self.target, event)
    }

    /// Apply `event` through the handler at `index` in declaration order,
    /// bypassing the kind lookup.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::ArgumentTypeMismatch`] if the event is not of
    /// the handler's type, or [`MappingError::NoHandlerAt`] if `index` is
    /// out of range.
    pub fn invoke_at(&mut self, index: usize, event: &Event) -> Result<(), MappingError> {
        let handler = self.map.handlers.get(index).ok_or(MappingError::NoHandlerAt {
            aggregate: self.map.aggregate(),
            index,
            len: self.map.len(),
        })?;
        handler.invoke(self.target, event)
    }

    #[must_use]
    pub fn target(&self) -> &A {
        self.target
    }
}

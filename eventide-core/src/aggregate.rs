//! Aggregates and the event sources that carry them.
//!
//! An [`Aggregate`] is plain domain state plus a handler table (see
//! [`DeclareHandlers`]). [`EventSource`] wraps it with the bookkeeping the
//! store needs: the aggregate id, the committed version, and the buffer of
//! events applied since the last save.

use std::{fmt, sync::Arc};

use uuid::Uuid;

use crate::{
    event::{Event, HistoricalEvent},
    handler::{DeclareHandlers, HandlerMap, MappingError},
};

/// Command-side entity rebuilt from its events.
///
/// ```
/// use eventide_core::{
///     aggregate::Aggregate,
///     event::DomainEvent,
///     handler::{DeclareHandlers, Declarations},
/// };
///
/// #[derive(Debug)]
/// struct Deposited {
///     amount: i64,
/// }
///
/// impl DomainEvent for Deposited {
///     const KIND: &'static str = "account.deposited";
/// }
///
/// #[derive(Default)]
/// struct Account {
///     balance: i64,
/// }
///
/// impl DeclareHandlers for Account {
///     fn declare_handlers(handlers: &mut Declarations<Self>) {
///         handlers.handler("on_deposited", |account: &mut Account, e: &Deposited| {
///             account.balance += e.amount;
///         });
///     }
/// }
///
/// impl Aggregate for Account {
///     const TYPE_NAME: &'static str = "account";
/// }
/// ```
pub trait Aggregate: DeclareHandlers + Default + Send + Sync + 'static {
    /// Type name persisted alongside each aggregate record.
    ///
    /// Changing it orphans existing records, so treat it as part of the
    /// storage schema.
    const TYPE_NAME: &'static str;
}

/// An aggregate instance together with its version and pending events.
pub struct EventSource<A> {
    id: Uuid,
    version: u64,
    state: A,
    uncommitted: Vec<Event>,
    handlers: Arc<HandlerMap<A>>,
}

impl<A: Aggregate> EventSource<A> {
    /// A fresh event source at version 0.
    ///
    /// # Errors
    ///
    /// Returns a [`MappingError`] if `A`'s handler declarations are invalid.
    pub fn new(id: Uuid) -> Result<Self, MappingError> {
        Ok(Self {
            id,
            version: 0,
            state: A::default(),
            uncommitted: Vec::new(),
            handlers: HandlerMap::for_type()?,
        })
    }

    /// Rebuild an event source by replaying `history` in order.
    ///
    /// # Errors
    ///
    /// Returns a [`MappingError`] if the handler declarations are invalid or
    /// an event cannot be dispatched.
    pub fn from_history<I>(id: Uuid, history: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = HistoricalEvent>,
    {
        let mut source = Self::new(id)?;
        for historical in history {
            source.replay(&historical.event)?;
        }
        Ok(source)
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Number of events committed for this aggregate when it was loaded (or
    /// last saved).
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub const fn state(&self) -> &A {
        &self.state
    }

    #[must_use]
    pub fn handlers(&self) -> &HandlerMap<A> {
        &self.handlers
    }

    /// Apply a new event to the state and buffer it for the next save.
    ///
    /// The buffer is left untouched if dispatch fails.
    ///
    /// # Errors
    ///
    /// Returns a [`MappingError`] if the event has no handler or its type
    /// does not match the handler's.
    pub fn apply(&mut self, event: impl Into<Event>) -> Result<(), MappingError> {
        let event = event.into();
        self.handlers.dispatch(&mut self.state, &event)?;
        self.uncommitted.push(event);
        Ok(())
    }

    /// Apply several events in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// See [`EventSource::apply`]. Events before the failing one stay
    /// applied and buffered.
    pub fn apply_all<I>(&mut self, events: I) -> Result<(), MappingError>
    where
        I: IntoIterator<Item = Event>,
    {
        events.into_iter().try_for_each(|event| self.apply(event))
    }

    /// Apply an already committed event: the version advances and nothing is
    /// buffered.
    ///
    /// # Errors
    ///
    /// See [`EventSource::apply`].
    pub fn replay(&mut self, event: &Event) -> Result<(), MappingError> {
        self.handlers.dispatch(&mut self.state, event)?;
        self.version += 1;
        Ok(())
    }

    #[must_use]
    pub fn uncommitted_events(&self) -> &[Event] {
        &self.uncommitted
    }

    #[must_use]
    pub fn has_uncommitted_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Mark buffered events as committed.
    ///
    /// Advances the version by the number of buffered events and returns
    /// them.
    pub fn accept_changes(&mut self) -> Vec<Event> {
        let accepted = std::mem::take(&mut self.uncommitted);
        self.version += accepted.len() as u64;
        accepted
    }
}

impl<A: fmt::Debug> fmt::Debug for EventSource<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("uncommitted", &self.uncommitted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{event::DomainEvent, handler::Declarations};

    #[derive(Debug)]
    struct Added(i32);

    impl DomainEvent for Added {
        const KIND: &'static str = "counter.added";
    }

    #[derive(Debug)]
    struct Unknown;

    impl DomainEvent for Unknown {
        const KIND: &'static str = "counter.unknown";
    }

    #[derive(Debug, Default)]
    struct Counter {
        total: i32,
    }

    impl DeclareHandlers for Counter {
        fn declare_handlers(handlers: &mut Declarations<Self>) {
            handlers.handler("on_added", |c: &mut Counter, e: &Added| c.total += e.0);
        }
    }

    impl Aggregate for Counter {
        const TYPE_NAME: &'static str = "counter";
    }

    fn historical(event: impl Into<Event>, sequence: i64) -> HistoricalEvent {
        HistoricalEvent {
            timestamp: Utc::now(),
            sequence,
            event: event.into(),
        }
    }

    #[test]
    fn new_source_is_empty() {
        let id = Uuid::new_v4();
        let source = EventSource::<Counter>::new(id).unwrap();

        assert_eq!(source.id(), id);
        assert_eq!(source.version(), 0);
        assert!(!source.has_uncommitted_changes());
        assert_eq!(source.state().total, 0);
    }

    #[test]
    fn apply_mutates_and_buffers() {
        let mut source = EventSource::<Counter>::new(Uuid::new_v4()).unwrap();

        source.apply(Added(2)).unwrap();
        source
            .apply_all([Event::new(Added(3)), Event::new(Added(4))])
            .unwrap();

        assert_eq!(source.state().total, 9);
        assert_eq!(source.uncommitted_events().len(), 3);
        assert_eq!(source.version(), 0);
    }

    #[test]
    fn failed_apply_leaves_buffer_untouched() {
        let mut source = EventSource::<Counter>::new(Uuid::new_v4()).unwrap();
        source.apply(Added(1)).unwrap();

        let error = source.apply(Unknown).unwrap_err();

        assert!(matches!(error, MappingError::NoHandler { .. }));
        assert_eq!(source.uncommitted_events().len(), 1);
        assert_eq!(source.state().total, 1);
    }

    #[test]
    fn accept_changes_advances_version() {
        let mut source = EventSource::<Counter>::new(Uuid::new_v4()).unwrap();
        source.apply(Added(1)).unwrap();
        source.apply(Added(1)).unwrap();

        let accepted = source.accept_changes();

        assert_eq!(accepted.len(), 2);
        assert_eq!(source.version(), 2);
        assert!(source.uncommitted_events().is_empty());
    }

    #[test]
    fn from_history_replays_in_order() {
        let history = vec![historical(Added(5), 1), historical(Added(-2), 2)];

        let source = EventSource::<Counter>::from_history(Uuid::new_v4(), history).unwrap();

        assert_eq!(source.version(), 2);
        assert_eq!(source.state().total, 3);
        assert!(!source.has_uncommitted_changes());
    }

    #[test]
    fn from_history_rejects_unhandled_events() {
        let history = vec![historical(Added(5), 1), historical(Unknown, 2)];

        let result = EventSource::<Counter>::from_history(Uuid::new_v4(), history);

        assert!(matches!(result, Err(MappingError::NoHandler { .. })));
    }
}

//! Command handling.
//!
//! A command is validated against the current state of an aggregate by its
//! [`Handle`] implementation, which returns the events to apply. The store's
//! [`execute`](EventStore::execute) runs the load, handle, apply and save
//! cycle. Conflicts are surfaced to the caller; opt into reload-and-retry
//! with [`execute_with_retry`](EventStore::execute_with_retry).

use thiserror::Error;
use uuid::Uuid;

use crate::{
    aggregate::Aggregate,
    codec::Codec,
    config::RetryPolicy,
    event::Event,
    store::{Backend, EventStore, StoreError},
};

/// Entry point for command handling.
///
/// Each command type gets its own implementation, letting the aggregate
/// express validation logic in a strongly typed way.
///
/// ```ignore
/// impl Handle<ChangeNoteText> for Note {
///     type Error = NoteError;
///
///     fn handle(&self, command: &ChangeNoteText) -> Result<Vec<Event>, Self::Error> {
///         if command.text.is_empty() {
///             return Err(NoteError::EmptyText);
///         }
///         Ok(vec![NoteTextChanged { text: command.text.clone() }.into()])
///     }
/// }
/// ```
pub trait Handle<C>: Aggregate {
    /// Domain rejection.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate `command` against the current state and produce events.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` if the command is invalid for the current
    /// state.
    fn handle(&self, command: &C) -> Result<Vec<Event>, Self::Error>;
}

/// Error from [`EventStore::execute`].
#[derive(Debug, Error)]
pub enum CommandError<D, E>
where
    D: std::error::Error + 'static,
    E: std::error::Error + 'static,
{
    /// The aggregate rejected the command.
    #[error("command rejected: {0}")]
    Rejected(#[source] D),
    #[error(transparent)]
    Store(#[from] StoreError<E>),
}

impl<D, E> CommandError<D, E>
where
    D: std::error::Error + 'static,
    E: std::error::Error + 'static,
{
    /// Whether the failure was a concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Concurrency(_)))
    }
}

/// Outcome of [`EventStore::execute_with_retry`].
#[derive(Debug)]
pub struct Retried {
    /// Events committed by the successful attempt.
    pub events: Vec<Event>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

impl<B, C> EventStore<B, C>
where
    B: Backend,
    C: Codec,
{
    /// Load the aggregate, handle `command` and save the resulting events.
    ///
    /// Returns the committed events. A command producing no events commits
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Rejected`] if the aggregate rejects the
    /// command, or [`CommandError::Store`] for load, apply or save failures
    /// (including concurrency conflicts).
    #[tracing::instrument(skip(self, command), fields(aggregate_type = A::TYPE_NAME))]
    pub async fn execute<A, Cmd>(
        &self,
        id: Uuid,
        command: &Cmd,
    ) -> Result<Vec<Event>, CommandError<A::Error, B::Error>>
    where
        A: Handle<Cmd>,
        Cmd: Sync,
    {
        let mut source = self.load::<A>(id).await?;
        let events = source.state().handle(command).map_err(CommandError::Rejected)?;
        source
            .apply_all(events)
            .map_err(|error| CommandError::Store(StoreError::Mapping(error)))?;
        Ok(self.save(&mut source).await?)
    }

    /// Like [`EventStore::execute`], reloading and retrying on concurrency
    /// conflicts up to `policy.max_retries` times.
    ///
    /// Only conflicts are retried. Rejections and other store errors are
    /// returned immediately.
    ///
    /// # Errors
    ///
    /// See [`EventStore::execute`]. After the last retry the conflict itself
    /// is returned.
    pub async fn execute_with_retry<A, Cmd>(
        &self,
        id: Uuid,
        command: &Cmd,
        policy: RetryPolicy,
    ) -> Result<Retried, CommandError<A::Error, B::Error>>
    where
        A: Handle<Cmd>,
        Cmd: Sync,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.execute::<A, Cmd>(id, command).await {
                Ok(events) => return Ok(Retried { events, attempts }),
                Err(error) if error.is_conflict() && attempts <= policy.max_retries => {
                    tracing::debug!(
                        %id,
                        attempts,
                        max_retries = policy.max_retries,
                        "concurrency conflict; reloading and retrying"
                    );
                    if !policy.backoff.is_zero() {
                        tokio::time::sleep(policy.backoff).await;
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

//! A small note-taking domain: create notes, change their text, and list
//! them from the store.
//!
//! Set `RUST_LOG=eventide_core=debug` to watch the store at work.

use eventide::{
    Aggregate, CommandError, DeclareHandlers, Declarations, DomainEvent, Event, EventRegistry,
    Handle, JsonCodec, RetryPolicy,
    store::{EventStore, inmemory},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct NewNoteAdded {
    text: String,
}

impl DomainEvent for NewNoteAdded {
    const KIND: &'static str = "note.added";
}

#[derive(Debug, Serialize, Deserialize)]
struct NoteTextChanged {
    text: String,
}

impl DomainEvent for NoteTextChanged {
    const KIND: &'static str = "note.text-changed";
}

#[derive(Debug, Default)]
struct Note {
    text: Option<String>,
}

impl DeclareHandlers for Note {
    fn declare_handlers(handlers: &mut Declarations<Self>) {
        handlers
            .handler("on_new_note_added", |note: &mut Note, e: &NewNoteAdded| {
                note.text = Some(e.text.clone());
            })
            .handler("on_note_text_changed", |note: &mut Note, e: &NoteTextChanged| {
                note.text = Some(e.text.clone());
            });
    }
}

impl Aggregate for Note {
    const TYPE_NAME: &'static str = "note";
}

#[derive(Debug, Error)]
enum NoteError {
    #[error("note already exists")]
    AlreadyExists,
    #[error("note does not exist")]
    NotFound,
}

struct CreateNewNote {
    text: String,
}

impl Handle<CreateNewNote> for Note {
    type Error = NoteError;

    fn handle(&self, command: &CreateNewNote) -> Result<Vec<Event>, Self::Error> {
        if self.text.is_some() {
            return Err(NoteError::AlreadyExists);
        }
        Ok(vec![
            NewNoteAdded {
                text: command.text.clone(),
            }
            .into(),
        ])
    }
}

struct ChangeNoteText {
    new_text: String,
}

impl Handle<ChangeNoteText> for Note {
    type Error = NoteError;

    fn handle(&self, command: &ChangeNoteText) -> Result<Vec<Event>, Self::Error> {
        match &self.text {
            None => Err(NoteError::NotFound),
            Some(text) if *text == command.new_text => Ok(Vec::new()),
            Some(_) => Ok(vec![
                NoteTextChanged {
                    text: command.new_text.clone(),
                }
                .into(),
            ]),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let registry = EventRegistry::new(JsonCodec)
        .with::<NewNoteAdded>()?
        .with::<NoteTextChanged>()?;
    let store = EventStore::new(inmemory::Backend::new(), registry);

    let groceries = Uuid::new_v4();
    let reminders = Uuid::new_v4();
    store
        .execute::<Note, _>(
            groceries,
            &CreateNewNote {
                text: "milk".to_owned(),
            },
        )
        .await?;
    store
        .execute::<Note, _>(
            reminders,
            &CreateNewNote {
                text: "call the plumber".to_owned(),
            },
        )
        .await?;
    store
        .execute_with_retry::<Note, _>(
            groceries,
            &ChangeNoteText {
                new_text: "milk, eggs".to_owned(),
            },
            RetryPolicy::default(),
        )
        .await?;

    match store
        .execute::<Note, _>(
            Uuid::new_v4(),
            &ChangeNoteText {
                new_text: "lost".to_owned(),
            },
        )
        .await
    {
        Err(CommandError::Rejected(reason)) => println!("rejected as expected: {reason}"),
        other => println!("unexpected outcome: {other:?}"),
    }

    for id in store.ids_for::<Note>().await? {
        let note = store.load::<Note>(id).await?;
        println!(
            "{id} (version {}): {}",
            note.version(),
            note.state().text.as_deref().unwrap_or_default()
        );
    }

    Ok(())
}

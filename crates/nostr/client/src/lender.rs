//! Notes handed out by merged streams.

use std::sync::Arc;

use nostr::Event;

use crate::error::Result;
use crate::local::{LocalStore, NoteKey};

/// A note that is either still in the local database or already owned.
///
/// Local notes are read in place through [`with_borrowed`](Self::with_borrowed);
/// network notes that never reached the database are carried as owned copies.
#[derive(Clone)]
pub enum NoteLender {
    Local {
        store: Arc<dyn LocalStore>,
        key: NoteKey,
    },
    Owned(Arc<Event>),
}

impl NoteLender {
    pub fn local(store: Arc<dyn LocalStore>, key: NoteKey) -> Self {
        Self::Local { store, key }
    }

    pub fn owned(event: Event) -> Self {
        Self::Owned(Arc::new(event))
    }

    /// Database key, for notes that live in the local database.
    pub fn key(&self) -> Option<NoteKey> {
        match self {
            Self::Local { key, .. } => Some(*key),
            Self::Owned(_) => None,
        }
    }

    /// Run `f` on the note. Returns `None` when a local note has vanished.
    pub fn with_borrowed<R>(&self, f: impl FnOnce(&Event) -> R) -> Result<Option<R>> {
        match self {
            Self::Local { store, key } => {
                let mut f = Some(f);
                let mut out = None;
                store.with_note(*key, &mut |event: &Event| {
                    if let Some(f) = f.take() {
                        out = Some(f(event));
                    }
                })?;
                Ok(out)
            }
            Self::Owned(event) => Ok(Some(f(event))),
        }
    }

    pub fn to_owned_event(&self) -> Result<Option<Event>> {
        self.with_borrowed(Event::clone)
    }
}

impl std::fmt::Debug for NoteLender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { key, .. } => f
                .debug_struct("Local")
                .field("key", key)
                .finish_non_exhaustive(),
            Self::Owned(event) => f.debug_tuple("Owned").field(&event.id).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, text_note};

    #[test]
    fn local_notes_are_read_in_place() {
        let store = MemoryStore::new();
        let key = store.insert(text_note(1, 100, "stored"));
        let lender = NoteLender::local(store.clone(), key);

        assert_eq!(lender.key(), Some(key));
        let content = lender.with_borrowed(|event| event.content.clone()).unwrap();
        assert_eq!(content.as_deref(), Some("stored"));

        let missing = NoteLender::local(store, key + 10);
        assert_eq!(missing.to_owned_event().unwrap(), None);
    }

    #[test]
    fn owned_notes_need_no_database() {
        let lender = NoteLender::owned(text_note(2, 100, "owned"));
        assert_eq!(lender.key(), None);
        assert_eq!(
            lender.to_owned_event().unwrap().map(|event| event.created_at),
            Some(100)
        );
    }

    #[test]
    fn closed_database_surfaces_as_error() {
        let store = MemoryStore::new();
        let key = store.insert(text_note(1, 100, "stored"));
        store.close();
        let lender = NoteLender::local(store, key);
        assert!(lender.with_borrowed(|_| ()).is_err());
    }
}

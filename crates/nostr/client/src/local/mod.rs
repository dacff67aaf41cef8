//! The embedded event database, seen through the calls this crate makes.

mod adapter;

use std::pin::Pin;

use futures_util::Stream;
use nostr::{Event, Filter, RelayUrl};

use crate::error::Result;

pub use adapter::LocalStreamAdapter;

/// Database key of a stored note.
pub type NoteKey = u64;

/// Item of a local database subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalItem {
    Event(NoteKey),
    /// The stored matches have all been delivered.
    Eose,
}

pub type LocalSubscription = Pin<Box<dyn Stream<Item = LocalItem> + Send>>;

/// Local event database.
///
/// Calls fail with [`ClientError::DatabaseClosed`](crate::ClientError::DatabaseClosed)
/// while the database is closed; callers retry later.
pub trait LocalStore: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Keys of stored notes matching any of `filters`, at most `limit`.
    fn query(&self, filters: &[Filter], limit: usize) -> Result<Vec<NoteKey>>;

    /// Stored matches, then [`LocalItem::Eose`], then matches as they are
    /// ingested. The stream ends if the database closes.
    fn subscribe(&self, filters: &[Filter]) -> Result<LocalSubscription>;

    /// Run `f` on the note behind `key` without copying it. Returns `false`
    /// when there is no such note.
    fn with_note(&self, key: NoteKey, f: &mut dyn FnMut(&Event)) -> Result<bool>;

    fn lookup_by_id(&self, id: &str) -> Result<Option<NoteKey>>;

    fn was_seen_on_any_of(&self, key: NoteKey, relays: &[RelayUrl]) -> Result<bool>;

    /// Ingest an event received from `relay`.
    fn process_event(&self, relay: &RelayUrl, event: &Event) -> Result<()>;

    /// Owned copy of the note behind `key`.
    fn lookup_by_key(&self, key: NoteKey) -> Result<Option<Event>> {
        let mut found = None;
        self.with_note(key, &mut |event: &Event| found = Some(event.clone()))?;
        Ok(found)
    }
}

/// The newest of `keys` by `created_at`; on a tie the later key wins.
pub fn newest_note(store: &dyn LocalStore, keys: &[NoteKey]) -> Result<Option<(NoteKey, Event)>> {
    let mut newest: Option<(NoteKey, Event)> = None;
    for &key in keys {
        let Some(event) = store.lookup_by_key(key)? else {
            continue;
        };
        let replace = newest
            .as_ref()
            .is_none_or(|(_, current)| event.created_at >= current.created_at);
        if replace {
            newest = Some((key, event));
        }
    }
    Ok(newest)
}

//! Nostr protocol primitives shared by the client crates.
//!
//! - [`nip01`]: events, filters and event addresses
//! - [`nip65`]: relay list metadata
//! - [`nip77`]: negentropy set reconciliation
//! - [`relay_url`]: canonical relay addresses

pub mod nip01;
pub mod nip65;
pub mod nip77;
pub mod relay_url;
mod tag_parsing;

pub use nip01::{
    EMPTY_PUBKEY, Event, EventAddress, Filter, KIND_CONTACTS, KIND_METADATA, KIND_RELAY_LIST,
    KIND_TEXT_NOTE, decode_id,
};
pub use nip65::{RelayList, RelayListError, RelayListItem, RelayMarker};
pub use relay_url::{RelayUrl, RelayUrlError};

//! NIP-77: Negentropy Syncing
//!
//! Range-based set reconciliation between a client and a relay. Each side
//! holds a sorted list of `(created_at, id)` items; the exchange narrows
//! down the ranges where the two lists differ until both sides know which
//! ids the other is missing.
//!
//! Internal module boundaries:
//! - `error`: shared protocol error and result types
//! - `codec`: varint codec primitives
//! - `model`: bounds, ranges, messages, fingerprints and JSON envelopes
//! - `storage`: the sealed item set a session reads from
//! - `reconciliation`: the stateful session driving the exchange
//!
//! # Protocol Flow
//!
//! ```text
//! Client                                  Relay
//!   |                                       |
//!   |  NEG-OPEN (filter, initial msg) ---→ |
//!   |                                       | (compare fingerprints)
//!   | ←--- NEG-MSG (ranges with fps)       |
//!   |                                       |
//!   |  NEG-MSG (refined ranges) ---------→ |
//!   |  ...continues until complete...      |
//!   |                                       |
//!   |  NEG-CLOSE ------------------------→ |
//! ```
//!
//! # Usage Example
//!
//! ```
//! use nostr::nip77::{Negentropy, NegentropyConfig, NegentropyStorage};
//!
//! let mut ours = NegentropyStorage::new();
//! ours.add(1000, [0x01; 32])?;
//! ours.seal()?;
//!
//! let mut theirs = NegentropyStorage::new();
//! theirs.add(2000, [0x02; 32])?;
//! theirs.seal()?;
//!
//! let mut client = Negentropy::new(&ours, NegentropyConfig::default())?;
//! let mut relay = Negentropy::new(&theirs, NegentropyConfig::default())?;
//!
//! let mut message = client.initiate();
//! loop {
//!     let reply = relay.reconcile(&message)?;
//!     message = client.reconcile(&reply)?;
//!     if client.is_complete() {
//!         break;
//!     }
//! }
//! assert_eq!(client.need_ids(), &[[0x02; 32]]);
//! assert_eq!(client.have_ids(), &[[0x01; 32]]);
//! # Ok::<(), nostr::nip77::Nip77Error>(())
//! ```
//!
//! # References
//!
//! - NIP-77: <https://github.com/nostr-protocol/nips/blob/master/77.md>
//! - Negentropy Protocol: <https://github.com/hoytech/negentropy>

mod codec;
mod error;
mod model;
mod reconciliation;
mod storage;

pub use codec::{decode_varint, encode_varint, varint_len};
pub use error::{Nip77Error, Result};
pub use model::{
    Bound, Fingerprint, Item, NegEnvelope, NegentropyMessage, PROTOCOL_VERSION_1, Range,
    RangePayload, RecordId, TIMESTAMP_INFINITY, calculate_fingerprint,
};
pub use reconciliation::{MIN_FRAME_SIZE_LIMIT, Negentropy, NegentropyConfig};
pub use storage::{DEFAULT_POPULATE_LIMIT, NegentropySource, NegentropyStorage};

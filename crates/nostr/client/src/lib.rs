//! Nostr relay pool and local-first subscription streaming.
//!
//! The pieces, bottom up:
//! - [`pool::RelayPool`] keeps relay connections alive, routes requests and
//!   records which relay delivered which event
//! - [`local::LocalStreamAdapter`] turns a [`local::LocalStore`] into a
//!   restartable stream
//! - [`manager::SubscriptionManager`] merges both sources into one stream,
//!   optionally narrowing the network side with `since` or NIP-77
//!   negentropy reconciliation
//! - [`preloader::EntityPreloader`] and [`outbox::OutboxRelayHints`] fetch
//!   author metadata and find author relays on the side

pub mod coalesce;
pub mod config;
pub mod error;
pub mod lender;
pub mod local;
pub mod manager;
pub mod negentropy;
pub mod network;
pub mod outbox;
pub mod pool;
pub mod preloader;
pub mod relay;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, Result};
pub use lender::NoteLender;
pub use local::{LocalItem, LocalStore, LocalStreamAdapter, NoteKey};
pub use manager::{
    FindEvent, FoundEvent, NetworkOptimization, PreloadStrategy, StreamItem, StreamMode,
    StreamOptions, SubscriptionManager,
};
pub use network::{ManualNetworkMonitor, NetworkMonitor, PathStatus};
pub use outbox::{OutboxRelayHintProvider, OutboxRelayHints};
pub use pool::{PoolConfig, PoolItem, RelayPool};
pub use preloader::EntityPreloader;
pub use relay::{
    ClientMessage, ConnectionState, RelayConfig, RelayConnection, RelayDescriptor, RelayMessage,
};
pub use stream::TaskStream;
pub use transport::{Connector, WebSocketConnector};

//! Client error types.

use nostr::RelayUrl;
use nostr::RelayUrlError;
use nostr::nip77::Nip77Error;
use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid relay URL: {0}")]
    InvalidRelayUrl(#[from] RelayUrlError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("relay {0} is already in the pool")]
    RelayExists(RelayUrl),

    #[error("relay {0} is not in the pool")]
    RelayNotFound(RelayUrl),

    #[error("relay error: {0}")]
    RelayError(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("local database is closed")]
    DatabaseClosed,

    #[error("local database error: {0}")]
    Database(String),

    #[error("negentropy error: {0}")]
    Negentropy(#[from] Nip77Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;

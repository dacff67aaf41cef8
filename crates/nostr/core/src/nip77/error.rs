use thiserror::Error;

/// NIP-77 error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Nip77Error {
    #[error("Invalid protocol version: {0:#04x}")]
    InvalidProtocolVersion(u8),

    #[error("Unexpected end of message while reading {0}")]
    UnexpectedEnd(&'static str),

    #[error("Invalid mode: {0}")]
    InvalidMode(u64),

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Varint overflow")]
    VarintOverflow,

    #[error("Invalid bound: {0}")]
    InvalidBound(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid {kind} envelope: {reason}")]
    InvalidEnvelope { kind: &'static str, reason: String },

    #[error("Storage is already sealed")]
    StorageSealed,

    #[error("Storage must be sealed before reconciliation")]
    StorageNotSealed,

    #[error("Invalid negentropy config: {0}")]
    InvalidConfig(String),

    #[error("Item source failed: {0}")]
    Source(String),
}

pub type Result<T> = std::result::Result<T, Nip77Error>;

//! Canonical relay addresses.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayUrlError {
    #[error("invalid relay url {0}: {1}")]
    Parse(String, String),

    #[error("unsupported relay url scheme {0}, expected ws or wss")]
    UnsupportedScheme(String),

    #[error("relay url {0} has no host")]
    MissingHost(String),
}

/// A `ws://` or `wss://` relay address.
///
/// The canonical string doubles as the relay's identity inside a pool.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn parse(input: &str) -> Result<Self, RelayUrlError> {
        let url = Url::parse(input.trim())
            .map_err(|error| RelayUrlError::Parse(input.to_string(), error.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(RelayUrlError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(RelayUrlError::MissingHost(input.to_string()));
        }

        let mut canonical = url.to_string();
        if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
            canonical.pop();
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RelayUrl {
    type Err = RelayUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayUrl({})", self.0)
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

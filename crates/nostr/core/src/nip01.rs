//! NIP-01 events, filters and addresses.

use crate::tag_parsing::{tag_value_at, tag_values};
use serde::{Deserialize, Serialize};

/// Profile metadata.
pub const KIND_METADATA: u16 = 0;
/// Short text note.
pub const KIND_TEXT_NOTE: u16 = 1;
/// Follow list.
pub const KIND_CONTACTS: u16 = 3;
/// NIP-65 relay list metadata.
pub const KIND_RELAY_LIST: u16 = 10002;

/// A signed Nostr event as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Decode the hex event id into raw bytes.
    pub fn id_bytes(&self) -> Option<[u8; 32]> {
        decode_id(&self.id)
    }

    /// Values of every `p` tag, in tag order.
    pub fn referenced_pubkeys(&self) -> Vec<String> {
        tag_values(&self.tags, "p")
    }

    /// The `d` tag value, or the empty string when the tag is missing.
    pub fn identifier(&self) -> &str {
        tag_value_at(&self.tags, "d", 1).unwrap_or("")
    }

    /// Kinds 30000..40000 are addressed by `kind:pubkey:d-tag`.
    pub fn is_addressable(&self) -> bool {
        (30_000..40_000).contains(&self.kind)
    }
}

/// Decode a 64-character hex identifier.
pub fn decode_id(hex_id: &str) -> Option<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(hex_id, &mut out).ok()?;
    Some(out)
}

/// The all-zero pubkey, used as a placeholder identity.
pub const EMPTY_PUBKEY: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Coordinates of a parameterized replaceable event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventAddress {
    pub kind: u16,
    pub author: String,
    pub identifier: String,
}

impl EventAddress {
    pub fn new(kind: u16, author: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            author: author.into(),
            identifier: identifier.into(),
        }
    }

    /// Filter selecting candidates for this address.
    pub fn filter(&self) -> Filter {
        Filter::new()
            .kinds([self.kind])
            .authors([self.author.clone()])
            .identifiers([self.identifier.clone()])
    }

    pub fn matches(&self, event: &Event) -> bool {
        event.kind == self.kind
            && event.pubkey == self.author
            && event.identifier() == self.identifier
    }
}

/// A subscription filter.
///
/// Every present field narrows the match; absent fields match anything.
/// `since` and `until` are inclusive bounds on `created_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub referenced_ids: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    #[serde(rename = "#t", default, skip_serializing_if = "Option::is_none")]
    pub hashtags: Option<Vec<String>>,
    #[serde(rename = "#d", default, skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn referenced_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.referenced_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn pubkeys<I, S>(mut self, pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pubkeys = Some(pubkeys.into_iter().map(Into::into).collect());
        self
    }

    pub fn hashtags<I, S>(mut self, hashtags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hashtags = Some(hashtags.into_iter().map(Into::into).collect());
        self
    }

    pub fn identifiers<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identifiers = Some(identifiers.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Copy of this filter whose `since` is raised to at least `since`.
    pub fn with_since(&self, since: u64) -> Self {
        let mut copy = self.clone();
        copy.since = Some(copy.since.map_or(since, |current| current.max(since)));
        copy
    }

    /// Check an event against every present constraint.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| id == &event.id)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.iter().any(|author| author == &event.pubkey)
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        let tag_constraints = [
            ("e", &self.referenced_ids),
            ("p", &self.pubkeys),
            ("t", &self.hashtags),
            ("d", &self.identifiers),
        ];
        tag_constraints.into_iter().all(|(name, wanted)| match wanted {
            None => true,
            Some(wanted) => tag_values(&event.tags, name)
                .iter()
                .any(|value| wanted.contains(value)),
        })
    }
}

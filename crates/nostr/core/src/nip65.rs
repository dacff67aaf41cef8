//! NIP-65 relay list metadata (kind 10002).

use crate::nip01::{Event, KIND_RELAY_LIST};
use crate::relay_url::{RelayUrl, RelayUrlError};
use crate::tag_parsing::has_name;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayListError {
    #[error("event kind {0} is not a relay list")]
    NotRelayList(u16),

    #[error(transparent)]
    InvalidRelayUrl(#[from] RelayUrlError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMarker {
    Read,
    Write,
    ReadWrite,
}

impl RelayMarker {
    /// Unknown or missing markers mean both directions.
    fn from_tag_item(item: Option<&str>) -> Self {
        match item {
            Some("read") => Self::Read,
            Some("write") => Self::Write,
            _ => Self::ReadWrite,
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayListItem {
    pub url: RelayUrl,
    pub marker: RelayMarker,
}

/// Relays an author declares, in tag order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayList {
    pub items: Vec<RelayListItem>,
}

impl RelayList {
    pub fn from_event(event: &Event) -> Result<Self, RelayListError> {
        if event.kind != KIND_RELAY_LIST {
            return Err(RelayListError::NotRelayList(event.kind));
        }

        let mut items = Vec::new();
        for tag in event.tags.iter().filter(|tag| has_name(tag, "r")) {
            let Some(raw_url) = tag.get(1) else {
                continue;
            };
            items.push(RelayListItem {
                url: RelayUrl::parse(raw_url)?,
                marker: RelayMarker::from_tag_item(tag.get(2).map(String::as_str)),
            });
        }
        Ok(Self { items })
    }

    /// Read-capable relays, deduplicated in first-seen order.
    pub fn read_relays(&self) -> Vec<RelayUrl> {
        let mut out: Vec<RelayUrl> = Vec::new();
        for item in self.items.iter().filter(|item| item.marker.can_read()) {
            if !out.contains(&item.url) {
                out.push(item.url.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_list(tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "00".repeat(32),
            pubkey: "11".repeat(32),
            created_at: 1,
            kind: KIND_RELAY_LIST,
            tags: tags
                .into_iter()
                .map(|tag| tag.into_iter().map(str::to_string).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn read_relays_skip_write_only_and_dedupe() {
        let event = relay_list(vec![
            vec!["r", "wss://a.example"],
            vec!["r", "wss://b.example", "write"],
            vec!["r", "wss://c.example", "read"],
            vec!["r", "wss://a.example/", "read"],
            vec!["p", "ignored"],
        ]);
        let list = RelayList::from_event(&event).unwrap();
        let urls: Vec<_> = list.read_relays().iter().map(|url| url.to_string()).collect();
        assert_eq!(urls, vec!["wss://a.example", "wss://c.example"]);
    }

    #[test]
    fn rejects_wrong_kind_and_bad_urls() {
        let mut event = relay_list(vec![]);
        event.kind = 3;
        assert_eq!(RelayList::from_event(&event), Err(RelayListError::NotRelayList(3)));

        let bad = relay_list(vec![vec!["r", "https://not-a-relay.example"]]);
        assert!(matches!(
            RelayList::from_event(&bad),
            Err(RelayListError::InvalidRelayUrl(_))
        ));
    }
}

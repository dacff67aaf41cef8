//! Outbox relay hints: where an author says they can be read from.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{EMPTY_PUBKEY, Event, Filter, KIND_RELAY_LIST, RelayList, RelayUrl};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::local::{LocalStore, newest_note};

/// Outbox hint configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// How long a cached relay list is trusted. Zero keeps entries forever.
    pub ttl: Duration,
    /// Stored relay lists inspected per author when picking the newest.
    pub max_results_to_inspect: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_results_to_inspect: 32,
        }
    }
}

/// Source of relay hints for authors.
#[async_trait]
pub trait OutboxRelayHintProvider: Send + Sync {
    /// Read relays per pubkey. Authors without a known list are absent.
    async fn relay_urls(&self, pubkeys: &[String]) -> HashMap<String, Vec<RelayUrl>>;

    /// Cache the relay list in `event`, replacing what is there.
    async fn record_relay_list_event(&self, event: &Event);

    /// Forget `pubkeys`, or everything when empty.
    async fn invalidate(&self, pubkeys: &[String]);
}

struct CacheEntry {
    relays: Vec<RelayUrl>,
    stored_at: Instant,
}

/// Relay hints read from NIP-65 lists in the local database.
pub struct OutboxRelayHints {
    store: Arc<dyn LocalStore>,
    config: OutboxConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl OutboxRelayHints {
    pub fn new(store: Arc<dyn LocalStore>, config: OutboxConfig) -> Self {
        Self {
            store,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        self.config.ttl.is_zero() || entry.stored_at.elapsed() < self.config.ttl
    }

    fn lookup_stored(&self, pubkey: &str) -> Result<Option<Vec<RelayUrl>>> {
        let filter = Filter::new().kinds([KIND_RELAY_LIST]).authors([pubkey]);
        let keys = self
            .store
            .query(&[filter], self.config.max_results_to_inspect)?;
        let Some((_, event)) = newest_note(self.store.as_ref(), &keys)? else {
            return Ok(None);
        };
        match RelayList::from_event(&event) {
            Ok(list) => Ok(Some(list.read_relays())),
            Err(error) => {
                warn!(pubkey, %error, "undecodable relay list");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl OutboxRelayHintProvider for OutboxRelayHints {
    async fn relay_urls(&self, pubkeys: &[String]) -> HashMap<String, Vec<RelayUrl>> {
        let mut unique = HashSet::new();
        let wanted: Vec<&String> = pubkeys
            .iter()
            .filter(|pubkey| !pubkey.is_empty() && pubkey.as_str() != EMPTY_PUBKEY)
            .filter(|pubkey| unique.insert(pubkey.as_str()))
            .collect();

        let mut hints = HashMap::new();
        let mut cache = self.cache.lock().await;
        for pubkey in wanted {
            if let Some(entry) = cache.get(pubkey)
                && self.is_fresh(entry)
            {
                if !entry.relays.is_empty() {
                    hints.insert(pubkey.clone(), entry.relays.clone());
                }
                continue;
            }

            match self.lookup_stored(pubkey) {
                Ok(Some(relays)) => {
                    cache.insert(
                        pubkey.clone(),
                        CacheEntry {
                            relays: relays.clone(),
                            stored_at: Instant::now(),
                        },
                    );
                    if !relays.is_empty() {
                        hints.insert(pubkey.clone(), relays);
                    }
                }
                Ok(None) => {
                    cache.remove(pubkey);
                }
                Err(error) => warn!(%pubkey, %error, "relay list lookup failed"),
            }
        }
        hints
    }

    async fn record_relay_list_event(&self, event: &Event) {
        if event.kind != KIND_RELAY_LIST {
            return;
        }
        match RelayList::from_event(event) {
            Ok(list) => {
                debug!(pubkey = %event.pubkey, "relay list cached");
                self.cache.lock().await.insert(
                    event.pubkey.clone(),
                    CacheEntry {
                        relays: list.read_relays(),
                        stored_at: Instant::now(),
                    },
                );
            }
            Err(error) => warn!(pubkey = %event.pubkey, %error, "undecodable relay list"),
        }
    }

    async fn invalidate(&self, pubkeys: &[String]) {
        let mut cache = self.cache.lock().await;
        if pubkeys.is_empty() {
            cache.clear();
        } else {
            for pubkey in pubkeys {
                cache.remove(pubkey);
            }
        }
    }
}

impl std::fmt::Debug for OutboxRelayHints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelayHints")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

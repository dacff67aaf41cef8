//! NIP-77 reconciliation with relays over the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nostr::nip77::{
    Item, NegEnvelope, Negentropy, NegentropyConfig, NegentropySource, NegentropyStorage,
};
use nostr::{Event, Filter, RelayUrl};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::local::LocalStore;
use crate::pool::RelayPool;
use crate::relay::{ClientMessage, RelayMessage};

/// Negentropy sync configuration.
#[derive(Debug, Clone)]
pub struct NegentropySyncConfig {
    /// Longest wait for each relay reply.
    pub round_timeout: Duration,
    /// Ids per `REQ` when fetching what the relay has and we lack.
    pub fetch_batch_size: usize,
    /// How long a relay stays marked as not speaking negentropy.
    pub unsupported_ttl: Duration,
    pub negentropy: NegentropyConfig,
}

impl Default for NegentropySyncConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(10),
            fetch_batch_size: 100,
            unsupported_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            negentropy: NegentropyConfig {
                frame_size_limit: 32 * 1024,
                idlist_threshold: 16,
                split_count: 4,
            },
        }
    }
}

/// Relays that failed a negentropy session recently.
#[derive(Debug)]
pub struct NegentropySupportCache {
    ttl: Duration,
    unsupported: Mutex<HashMap<RelayUrl, Instant>>,
}

impl NegentropySupportCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            unsupported: Mutex::new(HashMap::new()),
        }
    }

    pub async fn mark_unsupported(&self, relay: &RelayUrl) {
        self.unsupported
            .lock()
            .await
            .insert(relay.clone(), Instant::now());
    }

    pub async fn is_unsupported(&self, relay: &RelayUrl) -> bool {
        let mut unsupported = self.unsupported.lock().await;
        match unsupported.get(relay) {
            Some(marked) if marked.elapsed() < self.ttl => true,
            Some(_) => {
                unsupported.remove(relay);
                false
            }
            None => false,
        }
    }

    pub async fn clear(&self) {
        self.unsupported.lock().await.clear();
    }
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Hex ids we hold and the relay lacks.
    pub have_ids: Vec<String>,
    /// Hex ids the relay holds and we lack.
    pub need_ids: Vec<String>,
}

/// Runs negentropy sessions against pool relays.
#[derive(Clone)]
pub struct NegentropySync {
    pool: RelayPool,
    config: NegentropySyncConfig,
    support: Arc<NegentropySupportCache>,
}

impl NegentropySync {
    pub fn new(pool: RelayPool, config: NegentropySyncConfig) -> Self {
        let support = Arc::new(NegentropySupportCache::new(config.unsupported_ttl));
        Self {
            pool,
            config,
            support,
        }
    }

    pub fn config(&self) -> &NegentropySyncConfig {
        &self.config
    }

    pub fn support(&self) -> &NegentropySupportCache {
        &self.support
    }

    /// Reconcile `storage` against what `relay` holds for `filter`.
    ///
    /// `storage` must be sealed. Any failure marks the relay unsupported so
    /// callers fall back to plain `REQ`s for a while.
    pub async fn reconcile(
        &self,
        relay: &RelayUrl,
        filter: &Filter,
        storage: &NegentropyStorage,
    ) -> Result<SyncOutcome> {
        let id = format!("neg-{}", Uuid::new_v4());
        let mut replies = self.pool.open_channel(&id, vec![relay.clone()]).await?;
        let session = SessionGuard {
            pool: self.pool.clone(),
            id,
            relay: relay.clone(),
            finished: false,
        };
        let result = self
            .run_session(&session.id, relay, filter, storage, &mut replies)
            .await;
        session.finish().await;

        match &result {
            Ok(outcome) => debug!(
                relay = %relay,
                have = outcome.have_ids.len(),
                need = outcome.need_ids.len(),
                "negentropy sync complete"
            ),
            Err(error) => {
                warn!(relay = %relay, %error, "negentropy sync failed, falling back to REQ");
                self.support.mark_unsupported(relay).await;
            }
        }
        result
    }

    async fn run_session(
        &self,
        id: &str,
        relay: &RelayUrl,
        filter: &Filter,
        storage: &NegentropyStorage,
        replies: &mut mpsc::UnboundedReceiver<(RelayUrl, RelayMessage)>,
    ) -> Result<SyncOutcome> {
        let connection = self
            .pool
            .relay(relay)
            .await
            .ok_or_else(|| ClientError::RelayNotFound(relay.clone()))?;
        let mut session = Negentropy::new(storage, self.config.negentropy)?;

        let open = NegEnvelope::Open {
            subscription_id: id.to_string(),
            filter: filter.clone(),
            message: session.initiate_hex(),
        };
        connection.send(&ClientMessage::Neg(open)).await?;

        loop {
            let reply = tokio::time::timeout(self.config.round_timeout, replies.recv())
                .await
                .map_err(|_| ClientError::Timeout(format!("negentropy reply from {relay}")))?;
            let Some((_, message)) = reply else {
                return Err(ClientError::Subscription(format!(
                    "negentropy session {id} lost its handler"
                )));
            };

            match message {
                RelayMessage::Neg(NegEnvelope::Msg { message, .. }) => {
                    let next = session.reconcile_hex(&message)?;
                    if session.is_complete() {
                        break;
                    }
                    let reply = NegEnvelope::Msg {
                        subscription_id: id.to_string(),
                        message: next,
                    };
                    connection.send(&ClientMessage::Neg(reply)).await?;
                }
                RelayMessage::Neg(NegEnvelope::Err { reason, .. }) => {
                    return Err(ClientError::RelayError(format!("NEG-ERR: {reason}")));
                }
                RelayMessage::Closed(_, reason) => {
                    return Err(ClientError::RelayError(format!("CLOSED: {reason}")));
                }
                _ => {}
            }
        }

        let close = NegEnvelope::Close {
            subscription_id: id.to_string(),
        };
        if let Err(error) = connection.send(&ClientMessage::Neg(close)).await {
            debug!(relay = %relay, %error, "failed to send NEG-CLOSE");
        }

        Ok(SyncOutcome {
            have_ids: session.have_ids().iter().map(hex::encode).collect(),
            need_ids: session.need_ids().iter().map(hex::encode).collect(),
        })
    }
}

/// Owns the pool handler of one session. Dropped before
/// [`finish`](Self::finish), it removes the handler and sends `NEG-CLOSE`
/// from a spawned task.
struct SessionGuard {
    pool: RelayPool,
    id: String,
    relay: RelayUrl,
    finished: bool,
}

impl SessionGuard {
    async fn finish(mut self) {
        self.finished = true;
        self.pool.remove_handler(&self.id).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pool = self.pool.clone();
        let id = std::mem::take(&mut self.id);
        let relay = self.relay.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { abandon_session(&pool, id, &relay).await });
            }
            Err(_) => warn!(sub_id = %id, "negentropy session leaked outside a runtime"),
        }
    }
}

async fn abandon_session(pool: &RelayPool, id: String, relay: &RelayUrl) {
    pool.remove_handler(&id).await;
    let Some(connection) = pool.relay(relay).await else {
        return;
    };
    let close = NegEnvelope::Close {
        subscription_id: id,
    };
    if let Err(error) = connection.send(&ClientMessage::Neg(close)).await {
        debug!(relay = %relay, %error, "failed to send NEG-CLOSE for abandoned session");
    } else {
        debug!(relay = %relay, "abandoned negentropy session closed");
    }
}

impl std::fmt::Debug for NegentropySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegentropySync")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// `REQ` filters fetching `ids` in batches of `batch_size`.
pub fn need_filters(ids: &[String], batch_size: usize) -> Vec<Filter> {
    ids.chunks(batch_size.max(1))
        .map(|chunk| Filter::new().ids(chunk.iter().cloned()))
        .collect()
}

/// The reconciliation item for `event`, if its id and timestamp fit.
pub fn negentropy_item(event: &Event) -> Option<Item> {
    let timestamp = u32::try_from(event.created_at).ok()?;
    Some(Item::new(timestamp, event.id_bytes()?))
}

/// Local database as a negentropy item source.
pub struct StoreItems<'a>(pub &'a dyn LocalStore);

impl NegentropySource for StoreItems<'_> {
    type Error = ClientError;

    fn negentropy_items(&self, filter: &Filter, limit: usize) -> Result<Vec<Item>> {
        let keys = self.0.query(std::slice::from_ref(filter), limit)?;
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            self.0.with_note(key, &mut |event: &Event| {
                if let Some(item) = negentropy_item(event) {
                    items.push(item);
                }
            })?;
        }
        Ok(items)
    }
}

//! Batched profile metadata prefetching for authors seen in streams.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter, KIND_METADATA};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::coalesce::CoalescingQueue;
use crate::local::LocalStore;
use crate::pool::RelayPool;

/// Entity preloader configuration.
#[derive(Debug, Clone)]
pub struct PreloaderConfig {
    /// Flush as soon as more pubkeys than this are pending.
    pub batch_size_threshold: usize,
    /// Flush whatever is pending this often.
    pub flush_interval: Duration,
    /// Bound of the intake queue; the oldest pubkeys are dropped first.
    pub max_queue_items: usize,
}

impl Default for PreloaderConfig {
    fn default() -> Self {
        Self {
            batch_size_threshold: 500,
            flush_interval: Duration::from_secs(1),
            max_queue_items: 1_000,
        }
    }
}

/// Issues the metadata request for a flushed batch.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch_metadata(&self, pubkeys: Vec<String>);
}

/// One `REQ` for kind 0 across the batch. Results land in the local store.
#[async_trait]
impl MetadataFetcher for RelayPool {
    async fn fetch_metadata(&self, pubkeys: Vec<String>) {
        let filter = Filter::new().kinds([KIND_METADATA]).authors(pubkeys);
        let sub_id = self.fetch_oneshot(vec![filter], None).await;
        debug!(%sub_id, "metadata fetch sent");
    }
}

struct PreloaderInner {
    store: Arc<dyn LocalStore>,
    fetcher: Arc<dyn MetadataFetcher>,
    config: PreloaderConfig,
    queue: CoalescingQueue<String>,
    pending: Mutex<BTreeSet<String>>,
}

impl PreloaderInner {
    fn has_metadata(&self, pubkey: &str) -> bool {
        let filter = Filter::new().kinds([KIND_METADATA]).authors([pubkey]);
        match self.store.query(&[filter], 1) {
            Ok(keys) => !keys.is_empty(),
            Err(error) => {
                debug!(pubkey, %error, "metadata check failed, preloading anyway");
                false
            }
        }
    }

    async fn flush(&self) {
        let batch: Vec<String> = std::mem::take(&mut *self.pending.lock().await)
            .into_iter()
            .collect();
        if batch.is_empty() {
            return;
        }
        debug!(pubkeys = batch.len(), "flushing metadata preload batch");
        self.fetcher.fetch_metadata(batch).await;
    }
}

struct PreloaderTasks {
    drain: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

/// Collects pubkeys from streamed notes and fetches their metadata in
/// batches.
pub struct EntityPreloader {
    inner: Arc<PreloaderInner>,
    tasks: Mutex<Option<PreloaderTasks>>,
}

impl EntityPreloader {
    pub fn new(
        store: Arc<dyn LocalStore>,
        fetcher: Arc<dyn MetadataFetcher>,
        config: PreloaderConfig,
    ) -> Self {
        let queue = CoalescingQueue::new(config.max_queue_items);
        Self {
            inner: Arc::new(PreloaderInner {
                store,
                fetcher,
                config,
                queue,
                pending: Mutex::new(BTreeSet::new()),
            }),
            tasks: Mutex::new(None),
        }
    }

    /// Queue the author and `p`-tagged pubkeys of `note` that have no
    /// stored metadata. Metadata notes themselves are ignored.
    pub async fn preload(&self, note: &Event) {
        if note.kind == KIND_METADATA {
            return;
        }
        let mut unique = HashSet::new();
        let pubkeys: Vec<String> = std::iter::once(note.pubkey.clone())
            .chain(note.referenced_pubkeys())
            .filter(|pubkey| unique.insert(pubkey.clone()))
            .filter(|pubkey| !self.inner.has_metadata(pubkey))
            .collect();
        if !pubkeys.is_empty() {
            self.inner.queue.add_all(pubkeys).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn queued(&self) -> usize {
        self.inner.queue.len().await
    }

    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Start the drain and flush tasks. Does nothing when running.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return;
        }
        let drain = tokio::spawn(drain_queue(Arc::clone(&self.inner)));
        let ticker = tokio::spawn(flush_periodically(Arc::clone(&self.inner)));
        *tasks = Some(PreloaderTasks { drain, ticker });
        debug!("entity preloader started");
    }

    /// Stop both tasks and wait for them to finish.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        tasks.drain.abort();
        tasks.ticker.abort();
        for task in [tasks.drain, tasks.ticker] {
            if let Err(error) = task.await
                && !error.is_cancelled()
            {
                warn!(%error, "entity preloader task failed");
            }
        }
        debug!("entity preloader stopped");
    }
}

impl std::fmt::Debug for EntityPreloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityPreloader")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

async fn drain_queue(inner: Arc<PreloaderInner>) {
    loop {
        let batch = inner.queue.next_batch().await;
        let full = {
            let mut pending = inner.pending.lock().await;
            pending.extend(batch);
            pending.len() > inner.config.batch_size_threshold
        };
        if full {
            inner.flush().await;
        }
    }
}

async fn flush_periodically(inner: Arc<PreloaderInner>) {
    let mut ticker = tokio::time::interval(inner.config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        inner.flush().await;
    }
}

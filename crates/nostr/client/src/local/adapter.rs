use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use nostr::Filter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{LocalItem, LocalStore};
use crate::stream::{STREAM_BUFFER, TaskStream};

/// Keeps a local database subscription alive across database closures.
///
/// The produced stream carries [`LocalItem::Eose`] exactly once, after the
/// first batch of stored matches. When the database is closed, or its
/// subscription ends, the adapter waits `retry_delay` and subscribes again
/// until the stream is dropped.
#[derive(Clone)]
pub struct LocalStreamAdapter {
    store: Arc<dyn LocalStore>,
    retry_delay: Duration,
}

impl LocalStreamAdapter {
    pub fn new(store: Arc<dyn LocalStore>, retry_delay: Duration) -> Self {
        Self { store, retry_delay }
    }

    pub fn stream(&self, filters: Vec<Filter>) -> TaskStream<LocalItem> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let task = tokio::spawn(run(
            Arc::clone(&self.store),
            filters,
            self.retry_delay,
            tx,
        ));
        TaskStream::new(rx).with_task(task)
    }
}

async fn run(
    store: Arc<dyn LocalStore>,
    filters: Vec<Filter>,
    retry_delay: Duration,
    tx: mpsc::Sender<LocalItem>,
) {
    let mut eose_sent = false;
    loop {
        if store.is_closed() {
            debug!("local database closed, waiting to subscribe");
            tokio::time::sleep(retry_delay).await;
            continue;
        }

        let mut subscription = match store.subscribe(&filters) {
            Ok(subscription) => subscription,
            Err(error) => {
                warn!(%error, "local subscription failed");
                tokio::time::sleep(retry_delay).await;
                continue;
            }
        };

        while let Some(item) = subscription.next().await {
            if item == LocalItem::Eose {
                if eose_sent {
                    continue;
                }
                eose_sent = true;
            }
            if tx.send(item).await.is_err() {
                return;
            }
        }

        if tx.is_closed() {
            return;
        }
        debug!("local subscription ended, restarting");
        tokio::time::sleep(retry_delay).await;
    }
}

impl std::fmt::Debug for LocalStreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStreamAdapter")
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

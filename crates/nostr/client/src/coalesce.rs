//! Bounded many-producer queue drained in batches by one consumer.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};
use tracing::warn;

/// Pending items awaiting a single consumer.
///
/// When the queue is full the oldest pending item is evicted to make room.
/// Items are handed out in submission order, each exactly once.
#[derive(Debug)]
pub struct CoalescingQueue<T> {
    pending: Mutex<VecDeque<T>>,
    notify: Notify,
    max_items: usize,
}

impl<T> CoalescingQueue<T> {
    pub fn new(max_items: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_items: max_items.max(1),
        }
    }

    pub async fn add(&self, item: T) {
        self.add_all(std::iter::once(item)).await;
    }

    pub async fn add_all(&self, items: impl IntoIterator<Item = T>) {
        let mut evicted = 0usize;
        {
            let mut pending = self.pending.lock().await;
            for item in items {
                if pending.len() >= self.max_items {
                    pending.pop_front();
                    evicted += 1;
                }
                pending.push_back(item);
            }
        }
        if evicted > 0 {
            warn!(
                evicted,
                max_items = self.max_items,
                "coalescing queue full, dropped oldest items"
            );
        }
        self.notify.notify_one();
    }

    /// Wait until at least one item is pending, then take everything.
    pub async fn next_batch(&self) -> Vec<T> {
        loop {
            let batch = self.drain().await;
            if !batch.is_empty() {
                return batch;
            }
            self.notify.notified().await;
        }
    }

    /// Take everything pending without waiting.
    pub async fn drain(&self) -> Vec<T> {
        self.pending.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }
}

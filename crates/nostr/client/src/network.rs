//! Network reachability as seen by the pool.

use tokio::sync::watch;

/// Coarse reachability of the network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Satisfied,
    Unsatisfied,
    RequiresConnection,
}

impl PathStatus {
    pub fn is_satisfied(self) -> bool {
        self == Self::Satisfied
    }
}

/// Source of path status changes.
///
/// The pool re-checks its relays whenever the receiver returned by
/// [`watch`](NetworkMonitor::watch) changes.
pub trait NetworkMonitor: Send + Sync {
    fn current_path_status(&self) -> PathStatus;

    fn watch(&self) -> watch::Receiver<PathStatus>;
}

/// Monitor whose status is set by the embedding application.
#[derive(Debug)]
pub struct ManualNetworkMonitor {
    status: watch::Sender<PathStatus>,
}

impl ManualNetworkMonitor {
    pub fn new(initial: PathStatus) -> Self {
        let (status, _) = watch::channel(initial);
        Self { status }
    }

    pub fn set_status(&self, status: PathStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::new(PathStatus::Satisfied)
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn current_path_status(&self) -> PathStatus {
        *self.status.borrow()
    }

    fn watch(&self) -> watch::Receiver<PathStatus> {
        self.status.subscribe()
    }
}

//! Relay pool: peer connections, request routing and seen tracking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use nostr::{Event, Filter, RelayUrl};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::local::LocalStore;
use crate::network::{ManualNetworkMonitor, NetworkMonitor, PathStatus};
use crate::relay::{
    ClientMessage, ConnectionState, PoolEvent, RelayConfig, RelayConnection, RelayDescriptor,
    RelayMessage, RelayVariant,
};
use crate::stream::{STREAM_BUFFER, TaskStream};
use crate::transport::{Connector, WebSocketConnector};

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Relay configuration template.
    pub relay_config: RelayConfig,
    /// Requests buffered per disconnected relay; later ones are dropped.
    pub max_queued_requests: usize,
    /// A relay connecting for longer than this is restarted by the sweep.
    pub stale_connecting_after: Duration,
    /// Period of the reconnect sweep, on top of network path changes.
    pub sweep_interval: Duration,
    /// Longest wait for every connected relay to send EOSE.
    pub eose_timeout: Duration,
    /// How long to wait for ephemeral relays to come up.
    pub ephemeral_connect_wait: Duration,
    pub ephemeral_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay_config: RelayConfig::default(),
            max_queued_requests: 10,
            stale_connecting_after: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            eose_timeout: Duration::from_secs(5),
            ephemeral_connect_wait: Duration::from_secs(2),
            ephemeral_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Item of a pool subscription stream.
#[derive(Debug, Clone)]
pub enum PoolItem {
    Event { relay: RelayUrl, event: Event },
    /// Every connected target relay has sent its stored events, or the
    /// EOSE timeout elapsed.
    Eose,
}

/// Which relays forwarded which events.
///
/// Each `(relay, event)` pair counts once no matter how often it is seen.
#[derive(Debug, Default)]
pub struct SeenSet {
    by_event: HashMap<String, HashSet<RelayUrl>>,
    per_relay: HashMap<RelayUrl, u64>,
}

impl SeenSet {
    /// Returns `true` when the pair was not recorded before.
    pub fn insert(&mut self, relay: &RelayUrl, event_id: &str) -> bool {
        let relays = self.by_event.entry(event_id.to_string()).or_default();
        if !relays.insert(relay.clone()) {
            return false;
        }
        *self.per_relay.entry(relay.clone()).or_default() += 1;
        true
    }

    /// Relays that forwarded `event_id`, sorted.
    pub fn relays_for(&self, event_id: &str) -> Vec<RelayUrl> {
        let mut relays: Vec<RelayUrl> = self
            .by_event
            .get(event_id)
            .map(|relays| relays.iter().cloned().collect())
            .unwrap_or_default();
        relays.sort();
        relays
    }

    pub fn count(&self, relay: &RelayUrl) -> u64 {
        self.per_relay.get(relay).copied().unwrap_or(0)
    }

    /// Number of distinct `(relay, event)` pairs.
    pub fn len(&self) -> usize {
        self.by_event.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }
}

type HandlerSender = mpsc::UnboundedSender<(RelayUrl, RelayMessage)>;

struct Handler {
    /// Re-sent as `REQ` whenever a target relay connects. Empty for
    /// handlers that only route replies.
    filters: Vec<Filter>,
    targets: Option<Vec<RelayUrl>>,
    sender: Option<HandlerSender>,
    /// Relays that still owe EOSE to a one-shot fetch.
    oneshot_pending: Option<HashSet<RelayUrl>>,
}

impl Handler {
    fn targets_relay(&self, descriptor: &RelayDescriptor) -> bool {
        match &self.targets {
            Some(targets) => targets.contains(&descriptor.url),
            None => descriptor.read && !descriptor.is_ephemeral(),
        }
    }
}

#[derive(Default)]
struct PoolState {
    relays: HashMap<RelayUrl, Arc<RelayConnection>>,
    handlers: HashMap<String, Handler>,
    queues: HashMap<RelayUrl, VecDeque<ClientMessage>>,
    seen: SeenSet,
}

impl PoolState {
    fn targets(
        &self,
        to: Option<&[RelayUrl]>,
        skip_ephemeral: bool,
        message: &ClientMessage,
    ) -> Vec<Arc<RelayConnection>> {
        let candidates: Vec<&Arc<RelayConnection>> = match to {
            Some(urls) => {
                let mut unique = HashSet::new();
                urls.iter()
                    .filter(|url| unique.insert(*url))
                    .filter_map(|url| self.relays.get(url))
                    .collect()
            }
            None => self
                .relays
                .values()
                .filter(|relay| !(skip_ephemeral && relay.descriptor().is_ephemeral()))
                .collect(),
        };
        candidates
            .into_iter()
            .filter(|relay| relay.descriptor().accepts(message))
            .cloned()
            .collect()
    }
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    network: Arc<dyn NetworkMonitor>,
    store: Option<Arc<dyn LocalStore>>,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

/// Aborts the pool's background tasks once the last handle is gone.
struct BackgroundTasks(Vec<JoinHandle<()>>);

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Builder for [`RelayPool`].
pub struct RelayPoolBuilder {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    network: Arc<dyn NetworkMonitor>,
    store: Option<Arc<dyn LocalStore>>,
}

impl RelayPoolBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn network_monitor(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = network;
        self
    }

    /// Store that ingests every event the pool receives.
    pub fn local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the pool. Must be called inside a Tokio runtime.
    pub fn build(self) -> RelayPool {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            config: self.config,
            connector: self.connector,
            network: self.network,
            store: self.store,
            state: Mutex::new(PoolState::default()),
            events,
        });

        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&inner), events_rx));
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&inner)));
        RelayPool {
            inner,
            _tasks: Arc::new(BackgroundTasks(vec![dispatcher, sweeper])),
        }
    }
}

/// Shared multi-relay pool.
///
/// Cloning is cheap; clones share the same relays and subscriptions.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
    _tasks: Arc<BackgroundTasks>,
}

impl RelayPool {
    pub fn builder(config: PoolConfig) -> RelayPoolBuilder {
        RelayPoolBuilder {
            config,
            connector: Arc::new(WebSocketConnector::default()),
            network: Arc::new(ManualNetworkMonitor::default()),
            store: None,
        }
    }

    /// Pool over WebSockets with an always-online network monitor.
    pub fn new(config: PoolConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn network_status(&self) -> PathStatus {
        self.inner.network.current_path_status()
    }

    /// Add a relay in the `NotConnected` state.
    pub async fn add_relay(&self, descriptor: RelayDescriptor) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.relays.contains_key(&descriptor.url) {
            return Err(ClientError::RelayExists(descriptor.url));
        }
        let url = descriptor.url.clone();
        let relay = RelayConnection::new(
            descriptor,
            self.inner.config.relay_config.clone(),
            Arc::clone(&self.inner.connector),
            self.inner.events.clone(),
        );
        state.relays.insert(url.clone(), Arc::new(relay));
        debug!(relay = %url, "relay added");
        Ok(())
    }

    /// Disconnect and forget a relay.
    pub async fn remove_relay(&self, url: &RelayUrl) -> Result<()> {
        let relay = {
            let mut state = self.inner.state.lock().await;
            let relay = state
                .relays
                .remove(url)
                .ok_or_else(|| ClientError::RelayNotFound(url.clone()))?;
            state.queues.remove(url);
            state.handlers.retain(|_, handler| match &mut handler.oneshot_pending {
                Some(pending) => {
                    pending.remove(url);
                    !pending.is_empty()
                }
                None => true,
            });
            relay
        };
        relay.disconnect().await;
        debug!(relay = %url, "relay removed");
        Ok(())
    }

    pub async fn relay(&self, url: &RelayUrl) -> Option<Arc<RelayConnection>> {
        self.inner.state.lock().await.relays.get(url).cloned()
    }

    /// Descriptors of every relay, ephemeral ones included.
    pub async fn all_relays(&self) -> Vec<RelayDescriptor> {
        let mut descriptors: Vec<RelayDescriptor> = self
            .inner
            .state
            .lock()
            .await
            .relays
            .values()
            .map(|relay| relay.descriptor().clone())
            .collect();
        descriptors.sort_by(|a, b| a.url.cmp(&b.url));
        descriptors
    }

    /// Descriptors of the relays the user configured.
    pub async fn our_descriptors(&self) -> Vec<RelayDescriptor> {
        self.all_relays()
            .await
            .into_iter()
            .filter(|descriptor| !descriptor.is_ephemeral())
            .collect()
    }

    /// Start connecting `to` (or every relay). Broken relays are skipped.
    pub async fn connect(&self, to: Option<&[RelayUrl]>) {
        for relay in self.select(to).await {
            if relay.is_broken() {
                debug!(relay = %relay.url(), "skipping broken relay");
                continue;
            }
            match relay.state().await {
                ConnectionState::Connected | ConnectionState::Connecting { .. } => {}
                ConnectionState::NotConnected | ConnectionState::Failed => {
                    relay.start_connect().await;
                }
            }
        }
    }

    pub async fn disconnect(&self, to: Option<&[RelayUrl]>) {
        for relay in self.select(to).await {
            relay.disconnect().await;
        }
    }

    /// Drop and re-open connections. Broken relays are left alone unless
    /// `force` is set.
    pub async fn reconnect(&self, to: Option<&[RelayUrl]>, force: bool) {
        for relay in self.select(to).await {
            if relay.is_broken() {
                if !force {
                    continue;
                }
                relay.clear_broken();
            }
            relay.disconnect().await;
            relay.start_connect().await;
        }
    }

    /// Send `message` to `to` (or every suitable relay).
    ///
    /// Relays that are not connected get the message queued until they
    /// connect. Returns the relays the message was routed to.
    pub async fn send(
        &self,
        message: ClientMessage,
        to: Option<&[RelayUrl]>,
        skip_ephemeral: bool,
    ) -> Vec<Arc<RelayConnection>> {
        self.route(&message, to, skip_ephemeral, true).await
    }

    /// Publish an event to the write relays.
    pub async fn publish(&self, event: Event, to: Option<&[RelayUrl]>) -> Vec<RelayUrl> {
        self.send(ClientMessage::Event(Box::new(event)), to, true)
            .await
            .iter()
            .map(|relay| relay.url().clone())
            .collect()
    }

    /// Subscribe on `to` (or every read relay) and stream the results.
    ///
    /// Events are deduplicated by id. Dropping the stream closes the
    /// subscription on every relay.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        to: Option<Vec<RelayUrl>>,
        id: Option<String>,
    ) -> Result<TaskStream<PoolItem>> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (sender, messages) = mpsc::unbounded_channel();
        let handler = Handler {
            filters: filters.clone(),
            targets: to.clone(),
            sender: Some(sender),
            oneshot_pending: None,
        };
        if !self.register_handler(&id, handler).await {
            return Err(ClientError::Subscription(format!(
                "subscription {id} already exists"
            )));
        }

        let desired = self
            .send(ClientMessage::req(id.clone(), filters), to.as_deref(), true)
            .await;
        debug!(sub_id = %id, relays = desired.len(), "pool subscription opened");

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let task = tokio::spawn(forward_subscription(
            messages,
            desired,
            tx,
            self.inner.config.eose_timeout,
        ));
        let pool = self.clone();
        Ok(TaskStream::new(rx).with_task(task).on_drop(move || {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    pool.close_subscription(&id, to.as_deref()).await;
                });
            }
        }))
    }

    /// Fire a `REQ` nobody listens to at the connected relays among `to`.
    /// Results only reach the local store.
    ///
    /// Each relay's subscription is closed after its EOSE. Relays that have
    /// not reported within the EOSE timeout are closed then.
    pub async fn fetch_oneshot(&self, filters: Vec<Filter>, to: Option<Vec<RelayUrl>>) -> String {
        let id = Uuid::new_v4().to_string();
        let message = ClientMessage::req(id.clone(), filters);
        let targets = self
            .inner
            .state
            .lock()
            .await
            .targets(to.as_deref(), true, &message);
        let (connected, _) = partition_connected(&targets).await;
        if connected.is_empty() {
            debug!(sub_id = %id, "no connected relay for one-shot fetch");
            return id;
        }

        let urls: Vec<RelayUrl> = connected.iter().map(|relay| relay.url().clone()).collect();
        let handler = Handler {
            filters: Vec::new(),
            oneshot_pending: Some(urls.iter().cloned().collect()),
            targets: Some(urls),
            sender: None,
        };
        self.register_handler(&id, handler).await;
        for relay in &connected {
            if let Err(error) = relay.send(&message).await {
                warn!(relay = %relay.url(), %error, "failed to send one-shot fetch");
            }
        }
        tokio::spawn(expire_oneshot(
            Arc::downgrade(&self.inner),
            id.clone(),
            self.inner.config.eose_timeout,
        ));
        id
    }

    /// Ids of the registered subscription handlers.
    pub async fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .state
            .lock()
            .await
            .handlers
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Close a subscription opened with [`subscribe`](Self::subscribe).
    pub async fn close_subscription(&self, id: &str, to: Option<&[RelayUrl]>) {
        {
            let mut state = self.inner.state.lock().await;
            state.handlers.remove(id);
            for queue in state.queues.values_mut() {
                queue.retain(|message| message.subscription_id() != Some(id));
            }
        }
        self.route(&ClientMessage::Close(id.to_string()), to, true, false)
            .await;
        debug!(sub_id = %id, "pool subscription closed");
    }

    /// Relays that forwarded the event with this id.
    pub async fn relays_that_saw(&self, event_id: &str) -> Vec<RelayUrl> {
        self.inner.state.lock().await.seen.relays_for(event_id)
    }

    /// Distinct events received from `relay`.
    pub async fn received_count(&self, relay: &RelayUrl) -> u64 {
        self.inner.state.lock().await.seen.count(relay)
    }

    pub async fn queued_requests(&self, relay: &RelayUrl) -> usize {
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(relay)
            .map_or(0, VecDeque::len)
    }

    /// Read relays a subscription on `to` would target.
    pub async fn read_relays(&self, to: Option<&[RelayUrl]>) -> Vec<Arc<RelayConnection>> {
        let sample = ClientMessage::Close(String::new());
        self.inner.state.lock().await.targets(to, true, &sample)
    }

    /// Add `urls` as ephemeral relays and wait briefly for them to connect.
    ///
    /// Relays already in the pool are left as they are and are not removed
    /// on release.
    pub async fn acquire_ephemeral_relays(&self, urls: &[RelayUrl]) -> EphemeralRelays {
        // The guard exists before the first relay is added so that a
        // cancelled acquire still cleans up.
        let mut guard = EphemeralRelays {
            pool: self.clone(),
            urls: Vec::new(),
            released: false,
        };
        for url in urls {
            match self.add_relay(RelayDescriptor::ephemeral(url.clone())).await {
                Ok(()) => guard.urls.push(url.clone()),
                Err(ClientError::RelayExists(_)) => {}
                Err(error) => warn!(relay = %url, %error, "could not add ephemeral relay"),
            }
        }

        if !guard.urls.is_empty() {
            self.connect(Some(guard.urls.as_slice())).await;
            let deadline = Instant::now() + self.inner.config.ephemeral_connect_wait;
            while Instant::now() < deadline && !self.all_connected(&guard.urls).await {
                tokio::time::sleep(self.inner.config.ephemeral_poll_interval).await;
            }
        }
        guard
    }

    /// Remove relays added by [`acquire_ephemeral_relays`](Self::acquire_ephemeral_relays).
    pub async fn release_ephemeral_relays(&self, urls: &[RelayUrl]) {
        for url in urls {
            let ephemeral = self
                .relay(url)
                .await
                .is_some_and(|relay| relay.descriptor().variant == RelayVariant::Ephemeral);
            if ephemeral && let Err(error) = self.remove_relay(url).await {
                debug!(relay = %url, %error, "ephemeral relay already gone");
            }
        }
    }

    pub(crate) async fn open_channel(
        &self,
        id: &str,
        to: Vec<RelayUrl>,
    ) -> Result<mpsc::UnboundedReceiver<(RelayUrl, RelayMessage)>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler = Handler {
            filters: Vec::new(),
            targets: Some(to),
            sender: Some(sender),
            oneshot_pending: None,
        };
        if self.register_handler(id, handler).await {
            Ok(receiver)
        } else {
            Err(ClientError::Subscription(format!(
                "subscription {id} already exists"
            )))
        }
    }

    pub(crate) async fn remove_handler(&self, id: &str) {
        self.inner.state.lock().await.handlers.remove(id);
    }

    async fn register_handler(&self, id: &str, handler: Handler) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.handlers.contains_key(id) {
            debug!(sub_id = %id, "duplicate subscription id ignored");
            return false;
        }
        state.handlers.insert(id.to_string(), handler);
        true
    }

    async fn select(&self, to: Option<&[RelayUrl]>) -> Vec<Arc<RelayConnection>> {
        let state = self.inner.state.lock().await;
        match to {
            Some(urls) => urls
                .iter()
                .filter_map(|url| state.relays.get(url).cloned())
                .collect(),
            None => state.relays.values().cloned().collect(),
        }
    }

    async fn all_connected(&self, urls: &[RelayUrl]) -> bool {
        for relay in self.select(Some(urls)).await {
            if !relay.is_connected().await {
                return false;
            }
        }
        true
    }

    async fn route(
        &self,
        message: &ClientMessage,
        to: Option<&[RelayUrl]>,
        skip_ephemeral: bool,
        queue_if_disconnected: bool,
    ) -> Vec<Arc<RelayConnection>> {
        let targets = self
            .inner
            .state
            .lock()
            .await
            .targets(to, skip_ephemeral, message);
        let (connected, disconnected) = partition_connected(&targets).await;

        if queue_if_disconnected && !disconnected.is_empty() {
            let max = self.inner.config.max_queued_requests;
            let mut state = self.inner.state.lock().await;
            for relay in &disconnected {
                if !state.relays.contains_key(relay.url()) {
                    continue;
                }
                let queue = state.queues.entry(relay.url().clone()).or_default();
                if queue.len() >= max {
                    warn!(relay = %relay.url(), max, "request queue full, dropping request");
                } else {
                    queue.push_back(message.clone());
                }
            }
        }

        for relay in connected {
            if let Err(error) = relay.send(message).await {
                warn!(relay = %relay.url(), %error, "failed to send to relay");
            }
        }
        targets
    }
}

impl PoolInner {
    async fn on_connected(&self, url: &RelayUrl) {
        let (relay, outgoing) = {
            let mut state = self.state.lock().await;
            let Some(relay) = state.relays.get(url).cloned() else {
                return;
            };
            let queued: Vec<ClientMessage> =
                state.queues.remove(url).map(Vec::from).unwrap_or_default();
            let replayed: HashSet<&str> = queued
                .iter()
                .filter_map(ClientMessage::subscription_id)
                .collect();
            let resubscribe: Vec<ClientMessage> = state
                .handlers
                .iter()
                .filter(|(id, handler)| {
                    !handler.filters.is_empty()
                        && !replayed.contains(id.as_str())
                        && handler.targets_relay(relay.descriptor())
                })
                .map(|(id, handler)| ClientMessage::req(id.clone(), handler.filters.clone()))
                .collect();
            debug!(
                relay = %url,
                replayed = queued.len(),
                resubscribed = resubscribe.len(),
                "relay ready"
            );
            let mut outgoing = queued;
            outgoing.extend(resubscribe);
            (relay, outgoing)
        };

        for message in &outgoing {
            if let Err(error) = relay.send(message).await {
                warn!(relay = %url, %error, "failed to replay request");
            }
        }
    }

    async fn on_message(&self, relay: RelayUrl, message: RelayMessage) {
        match message {
            RelayMessage::Event(sub_id, event) => {
                let sender = {
                    let mut state = self.state.lock().await;
                    state.seen.insert(&relay, &event.id);
                    state
                        .handlers
                        .get(&sub_id)
                        .and_then(|handler| handler.sender.clone())
                };
                if let Some(store) = &self.store
                    && let Err(error) = store.process_event(&relay, &event)
                {
                    warn!(relay = %relay, %error, "local store rejected event");
                }
                if let Some(sender) = sender {
                    let _ = sender.send((relay, RelayMessage::Event(sub_id, event)));
                }
            }
            RelayMessage::Eose(sub_id) => {
                let (sender, close) = {
                    let mut state = self.state.lock().await;
                    match state.handlers.get_mut(&sub_id) {
                        Some(Handler {
                            oneshot_pending: Some(pending),
                            ..
                        }) => {
                            pending.remove(&relay);
                            if pending.is_empty() {
                                state.handlers.remove(&sub_id);
                            }
                            (None, state.relays.get(&relay).cloned())
                        }
                        Some(handler) => (handler.sender.clone(), None),
                        None => (None, None),
                    }
                };
                if let Some(connection) = close
                    && let Err(error) = connection.send(&ClientMessage::Close(sub_id.clone())).await
                {
                    debug!(relay = %relay, %error, "failed to close one-shot subscription");
                }
                if let Some(sender) = sender {
                    let _ = sender.send((relay, RelayMessage::Eose(sub_id)));
                }
            }
            RelayMessage::Closed(sub_id, reason) => {
                debug!(relay = %relay, sub_id = %sub_id, %reason, "relay closed subscription");
                self.forward(&sub_id, relay, RelayMessage::Closed(sub_id.clone(), reason))
                    .await;
            }
            RelayMessage::Neg(envelope) => {
                let sub_id = envelope.subscription_id().to_string();
                self.forward(&sub_id, relay, RelayMessage::Neg(envelope))
                    .await;
            }
            RelayMessage::Ok(event_id, accepted, reason) => {
                debug!(relay = %relay, %event_id, accepted, %reason, "relay acknowledged event");
            }
            RelayMessage::Notice(notice) => info!(relay = %relay, %notice, "relay notice"),
            RelayMessage::Auth(_) => debug!(relay = %relay, "relay requested authentication"),
        }
    }

    async fn forward(&self, sub_id: &str, relay: RelayUrl, message: RelayMessage) {
        let sender = {
            let mut state = self.state.lock().await;
            let sender = state
                .handlers
                .get(sub_id)
                .and_then(|handler| handler.sender.clone());
            // A relay closing a one-shot fetch counts as its EOSE.
            if let Some(Handler {
                oneshot_pending: Some(pending),
                ..
            }) = state.handlers.get_mut(sub_id)
            {
                pending.remove(&relay);
                if pending.is_empty() {
                    state.handlers.remove(sub_id);
                }
            }
            sender
        };
        if let Some(sender) = sender {
            let _ = sender.send((relay, message));
        }
    }

    async fn sweep(&self) {
        if !self.network.current_path_status().is_satisfied() {
            return;
        }
        let relays: Vec<Arc<RelayConnection>> =
            self.state.lock().await.relays.values().cloned().collect();
        for relay in relays {
            if !relay.is_wanted() || relay.is_broken() {
                continue;
            }
            match relay.state().await {
                ConnectionState::Connecting { since }
                    if since.elapsed() > self.config.stale_connecting_after =>
                {
                    debug!(relay = %relay.url(), "restarting stale connection attempt");
                    relay.start_connect().await;
                }
                ConnectionState::Failed | ConnectionState::NotConnected => {
                    relay.start_connect().await;
                }
                ConnectionState::Connecting { .. } | ConnectionState::Connected => {}
            }
        }
    }
}

async fn dispatch(pool: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        match event {
            PoolEvent::Connected(url) => inner.on_connected(&url).await,
            PoolEvent::Message(url, message) => inner.on_message(url, message).await,
        }
    }
}

async fn sweep_loop(pool: Weak<PoolInner>) {
    let (mut path, interval) = match pool.upgrade() {
        Some(inner) => (inner.network.watch(), inner.config.sweep_interval),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; relays are connected explicitly.
    ticker.tick().await;
    let mut monitor_alive = true;

    loop {
        tokio::select! {
            changed = path.changed(), if monitor_alive => {
                if changed.is_err() {
                    monitor_alive = false;
                    continue;
                }
                debug!(status = ?*path.borrow_and_update(), "network path changed");
            }
            _ = ticker.tick() => {}
        }
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.sweep().await;
    }
}

async fn forward_subscription(
    mut messages: mpsc::UnboundedReceiver<(RelayUrl, RelayMessage)>,
    desired: Vec<Arc<RelayConnection>>,
    out: mpsc::Sender<PoolItem>,
    eose_timeout: Duration,
) {
    let mut seen_ids = HashSet::new();
    let mut reported = HashSet::new();
    let mut eose_sent = desired.is_empty();
    if eose_sent && out.send(PoolItem::Eose).await.is_err() {
        return;
    }

    let deadline = tokio::time::sleep(eose_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some((relay, message)) = message else {
                    break;
                };
                match message {
                    RelayMessage::Event(_, event) => {
                        if seen_ids.insert(event.id.clone())
                            && out.send(PoolItem::Event { relay, event }).await.is_err()
                        {
                            break;
                        }
                    }
                    RelayMessage::Eose(_) | RelayMessage::Closed(..) => {
                        reported.insert(relay);
                        if !eose_sent && all_reported(&desired, &reported).await {
                            eose_sent = true;
                            if out.send(PoolItem::Eose).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
            () = &mut deadline, if !eose_sent => {
                eose_sent = true;
                debug!("EOSE timeout, releasing subscription");
                if out.send(PoolItem::Eose).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Split `relays` by connection state, preserving order.
async fn partition_connected(
    relays: &[Arc<RelayConnection>],
) -> (Vec<Arc<RelayConnection>>, Vec<Arc<RelayConnection>>) {
    let mut connected = Vec::new();
    let mut disconnected = Vec::new();
    for relay in relays {
        if relay.is_connected().await {
            connected.push(Arc::clone(relay));
        } else {
            disconnected.push(Arc::clone(relay));
        }
    }
    (connected, disconnected)
}

/// Drop a one-shot fetch whose relays have not all reported in time and
/// close it where it is still open.
async fn expire_oneshot(pool: Weak<PoolInner>, id: String, after: Duration) {
    tokio::time::sleep(after).await;
    let Some(inner) = pool.upgrade() else {
        return;
    };
    let open: Vec<Arc<RelayConnection>> = {
        let mut state = inner.state.lock().await;
        let open = match state.handlers.get(&id) {
            Some(Handler {
                oneshot_pending: Some(pending),
                ..
            }) => pending
                .iter()
                .filter_map(|url| state.relays.get(url).cloned())
                .collect(),
            _ => return,
        };
        state.handlers.remove(&id);
        open
    };
    debug!(sub_id = %id, relays = open.len(), "one-shot fetch expired");
    let close = ClientMessage::Close(id);
    for relay in open {
        if let Err(error) = relay.send(&close).await {
            debug!(relay = %relay.url(), %error, "failed to close expired one-shot");
        }
    }
}

/// Every desired relay that is connected has reported EOSE.
async fn all_reported(desired: &[Arc<RelayConnection>], reported: &HashSet<RelayUrl>) -> bool {
    for relay in desired {
        if !reported.contains(relay.url()) && relay.is_connected().await {
            return false;
        }
    }
    true
}

/// Ephemeral relays held for one lookup.
///
/// Call [`release`](Self::release) when done. Dropping the guard without
/// releasing removes the relays from a spawned task.
pub struct EphemeralRelays {
    pool: RelayPool,
    urls: Vec<RelayUrl>,
    released: bool,
}

impl EphemeralRelays {
    /// Relays this guard added and will remove.
    pub fn urls(&self) -> &[RelayUrl] {
        &self.urls
    }

    pub async fn release(mut self) {
        self.released = true;
        let urls = std::mem::take(&mut self.urls);
        self.pool.release_ephemeral_relays(&urls).await;
    }
}

impl Drop for EphemeralRelays {
    fn drop(&mut self) {
        if self.released || self.urls.is_empty() {
            return;
        }
        let urls = std::mem::take(&mut self.urls);
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { pool.release_ephemeral_relays(&urls).await });
            }
            Err(_) => warn!(relays = urls.len(), "ephemeral relays leaked outside a runtime"),
        }
    }
}

impl std::fmt::Debug for EphemeralRelays {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralRelays")
            .field("urls", &self.urls)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

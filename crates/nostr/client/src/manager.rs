//! Local-first subscriptions merging the local database with the relay pool.

use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{Stream, StreamExt, future};
use nostr::nip77::{Item, NegentropyStorage};
use nostr::{Event, EventAddress, Filter, KIND_METADATA, KIND_RELAY_LIST, RelayUrl};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::lender::NoteLender;
use crate::local::{LocalItem, LocalStore, LocalStreamAdapter, NoteKey, newest_note};
use crate::negentropy::{NegentropySync, need_filters, negentropy_item};
use crate::outbox::{OutboxRelayHintProvider, OutboxRelayHints};
use crate::pool::{PoolItem, RelayPool};
use crate::preloader::EntityPreloader;
use crate::stream::{STREAM_BUFFER, TaskStream};

/// How the network side of a subscription is narrowed by local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkOptimization {
    /// Only ask relays for events newer than the newest local match.
    Since,
    /// Reconcile with each relay and fetch only what is missing.
    Negentropy,
}

/// Which sources feed a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Both sources; caught up once the local database is.
    LocalFirst(Option<NetworkOptimization>),
    /// Both sources; caught up once both are, or the local database is and
    /// the network is unreachable.
    LocalAndNetworkParallel(Option<NetworkOptimization>),
    LocalOnly,
}

impl StreamMode {
    pub fn optimization(self) -> Option<NetworkOptimization> {
        match self {
            Self::LocalFirst(optimization) | Self::LocalAndNetworkParallel(optimization) => {
                optimization
            }
            Self::LocalOnly => None,
        }
    }

    pub fn uses_network(self) -> bool {
        self != Self::LocalOnly
    }
}

impl Default for StreamMode {
    fn default() -> Self {
        Self::LocalFirst(None)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PreloadStrategy {
    #[default]
    NoPreloading,
    /// Hand every streamed note to the entity preloader.
    Preload,
}

/// Item of a merged subscription.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(NoteLender),
    /// Caught up, per the subscription's [`StreamMode`].
    GenericEose,
    LocalEose,
    NetworkEose,
}

/// Merged stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Subtracted from the newest local timestamp in since mode.
    pub since_margin: Duration,
    /// Wait before resubscribing to a closed local database.
    pub local_retry_delay: Duration,
    /// Wait before restarting an ended network session.
    pub network_retry_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            since_margin: Duration::from_secs(120),
            local_retry_delay: Duration::from_secs(1),
            network_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Per-subscription options.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Relays to ask; every read relay when unset.
    pub to: Option<Vec<RelayUrl>>,
    /// Hard cutoff for the whole stream.
    pub timeout: Option<Duration>,
    pub mode: StreamMode,
    pub preload: PreloadStrategy,
}

pub type LenderStream = Pin<Box<dyn Stream<Item = NoteLender> + Send>>;

/// Point lookups served by [`SubscriptionManager::find_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindEvent {
    Profile(String),
    Event(String),
}

#[derive(Debug, Clone)]
pub enum FoundEvent {
    Profile { pubkey: String, note: NoteLender },
    Event(NoteLender),
}

/// Whether a merged subscription counts as caught up.
pub fn generic_eose_ready(
    mode: StreamMode,
    local_eose: bool,
    network_eose: bool,
    network_reachable: bool,
) -> bool {
    match mode {
        StreamMode::LocalOnly | StreamMode::LocalFirst(_) => local_eose,
        StreamMode::LocalAndNetworkParallel(_) => {
            local_eose && (network_eose || !network_reachable)
        }
    }
}

struct ManagerInner {
    pool: RelayPool,
    store: Arc<dyn LocalStore>,
    config: StreamConfig,
    local: LocalStreamAdapter,
    negentropy: NegentropySync,
    preloader: Arc<EntityPreloader>,
    outbox: Arc<dyn OutboxRelayHintProvider>,
    relay_list_task: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point for local-first subscriptions and lookups.
///
/// Cloning is cheap; clones share the preloader and outbox cache.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    /// `pool` should ingest into `store` so network results become local
    /// notes.
    pub fn new(pool: RelayPool, store: Arc<dyn LocalStore>, config: &ClientConfig) -> Self {
        let outbox = Arc::new(OutboxRelayHints::new(
            Arc::clone(&store),
            config.outbox.clone(),
        ));
        Self::with_outbox(pool, store, config, outbox)
    }

    pub fn with_outbox(
        pool: RelayPool,
        store: Arc<dyn LocalStore>,
        config: &ClientConfig,
        outbox: Arc<dyn OutboxRelayHintProvider>,
    ) -> Self {
        let preloader = EntityPreloader::new(
            Arc::clone(&store),
            Arc::new(pool.clone()),
            config.preloader.clone(),
        );
        Self {
            inner: Arc::new(ManagerInner {
                local: LocalStreamAdapter::new(Arc::clone(&store), config.stream.local_retry_delay),
                negentropy: NegentropySync::new(pool.clone(), config.negentropy.clone()),
                pool,
                store,
                config: config.stream.clone(),
                preloader: Arc::new(preloader),
                outbox,
                relay_list_task: Mutex::new(None),
            }),
        }
    }

    pub fn pool(&self) -> &RelayPool {
        &self.inner.pool
    }

    pub fn outbox(&self) -> &Arc<dyn OutboxRelayHintProvider> {
        &self.inner.outbox
    }

    pub fn preloader(&self) -> &EntityPreloader {
        &self.inner.preloader
    }

    pub fn negentropy(&self) -> &NegentropySync {
        &self.inner.negentropy
    }

    /// Start the entity preloader and the relay list listener.
    pub async fn start(&self) {
        self.inner.preloader.start().await;
        let mut task = self.inner.relay_list_task.lock().await;
        if task.is_none() {
            *task = Some(tokio::spawn(feed_relay_lists(Arc::clone(&self.inner))));
        }
    }

    /// Stop background work and wait for it to finish.
    pub async fn stop(&self) {
        self.inner.preloader.stop().await;
        let task = self.inner.relay_list_task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            if let Err(error) = task.await
                && !error.is_cancelled()
            {
                warn!(%error, "relay list listener failed");
            }
        }
    }

    /// Merged stream of notes and EOSE markers.
    ///
    /// Runs until dropped or until `options.timeout` elapses.
    pub fn stream(&self, filters: Vec<Filter>, options: StreamOptions) -> TaskStream<StreamItem> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let (local_eose, _) = watch::channel(false);
        let merge = Arc::new(Merge {
            ctx: Arc::clone(&self.inner),
            state: Mutex::new(MergeState {
                yielded: RecentIds::new(MAX_TRACKED_IDS),
                local_eose: false,
                network_eose: false,
                generic_sent: false,
                latest_created_at: None,
                negentropy_items: vec![Vec::new(); filters.len()],
            }),
            filters,
            to: options.to,
            mode: options.mode,
            preload: options.preload == PreloadStrategy::Preload,
            out: tx,
            local_eose,
        });

        let mut stream = TaskStream::new(rx)
            .with_task(tokio::spawn(run_local(Arc::clone(&merge))))
            .with_timeout(options.timeout);
        if merge.mode.uses_network() {
            stream = stream.with_task(tokio::spawn(run_network(merge)));
        }
        stream
    }

    /// Notes until the subscription is caught up, then the stream ends.
    pub fn stream_existing_events(
        &self,
        filters: Vec<Filter>,
        options: StreamOptions,
    ) -> LenderStream {
        let stream = self
            .stream(filters, options)
            .take_while(|item| future::ready(!matches!(item, StreamItem::GenericEose)))
            .filter_map(|item| future::ready(into_note(item)));
        Box::pin(stream)
    }

    /// Notes until `timeout` elapses, whatever the EOSE state.
    pub fn timed_stream(
        &self,
        filters: Vec<Filter>,
        timeout: Duration,
        options: StreamOptions,
    ) -> LenderStream {
        let options = StreamOptions {
            timeout: Some(timeout),
            ..options
        };
        Box::pin(
            self.stream(filters, options)
                .filter_map(|item| future::ready(into_note(item))),
        )
    }

    /// Notes until the stream is dropped.
    pub fn stream_indefinitely(
        &self,
        filters: Vec<Filter>,
        options: StreamOptions,
    ) -> LenderStream {
        let options = StreamOptions {
            timeout: None,
            ..options
        };
        Box::pin(
            self.stream(filters, options)
                .filter_map(|item| future::ready(into_note(item))),
        )
    }

    /// Owned copies of every note until caught up.
    pub async fn query(&self, filters: Vec<Filter>, options: StreamOptions) -> Result<Vec<Event>> {
        let lenders: Vec<NoteLender> = self
            .stream_existing_events(filters, options)
            .collect()
            .await;
        let mut events = Vec::with_capacity(lenders.len());
        for lender in lenders {
            if let Some(event) = lender.to_owned_event()? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Find a note by id, locally first, then on our relays plus
    /// `find_from`, which are only connected for this lookup.
    pub async fn lookup_note(
        &self,
        id: &str,
        find_from: Option<Vec<RelayUrl>>,
    ) -> Result<Option<NoteLender>> {
        if let Some(key) = self.local_lookup(|store| store.lookup_by_id(id))? {
            return Ok(Some(NoteLender::local(Arc::clone(&self.inner.store), key)));
        }
        let filter = Filter::new().ids([id]).limit(1);
        self.fetch_newest(filter, find_from.unwrap_or_default()).await
    }

    /// Newest version of a parameterized replaceable event.
    ///
    /// Relays from the author's outbox hints join the network search.
    pub async fn lookup_address(&self, address: &EventAddress) -> Result<Option<NoteLender>> {
        if let Some(lender) =
            self.newest_local(&address.filter(), |event| address.matches(event))?
        {
            return Ok(Some(lender));
        }
        let hints = self.author_hints(&address.author).await;
        self.fetch_newest(address.filter(), hints).await
    }

    pub async fn find_event(&self, query: FindEvent) -> Result<Option<FoundEvent>> {
        match query {
            FindEvent::Event(id) => Ok(self.lookup_note(&id, None).await?.map(FoundEvent::Event)),
            FindEvent::Profile(pubkey) => {
                let filter = Filter::new()
                    .kinds([KIND_METADATA])
                    .authors([pubkey.as_str()]);
                let note = match self.newest_local(&filter, |_| true)? {
                    Some(note) => Some(note),
                    None => {
                        let hints = self.author_hints(&pubkey).await;
                        self.fetch_newest(filter.limit(1), hints).await?
                    }
                };
                Ok(note.map(|note| FoundEvent::Profile { pubkey, note }))
            }
        }
    }

    pub async fn relays_that_saw(&self, event_id: &str) -> Vec<RelayUrl> {
        self.inner.pool.relays_that_saw(event_id).await
    }

    /// Run a local lookup, treating a closed database as a miss.
    fn local_lookup<T>(
        &self,
        lookup: impl FnOnce(&dyn LocalStore) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        match lookup(self.inner.store.as_ref()) {
            Err(ClientError::DatabaseClosed) => {
                debug!("local database closed, skipping local lookup");
                Ok(None)
            }
            other => other,
        }
    }

    fn newest_local(
        &self,
        filter: &Filter,
        accept: impl Fn(&Event) -> bool,
    ) -> Result<Option<NoteLender>> {
        let store = &self.inner.store;
        let newest = self.local_lookup(|store| {
            let keys = store.query(std::slice::from_ref(filter), usize::MAX)?;
            newest_note(store, &keys)
        })?;
        Ok(newest
            .filter(|(_, event)| accept(event))
            .map(|(key, _)| NoteLender::local(Arc::clone(store), key)))
    }

    async fn author_hints(&self, pubkey: &str) -> Vec<RelayUrl> {
        self.inner
            .outbox
            .relay_urls(&[pubkey.to_string()])
            .await
            .remove(pubkey)
            .unwrap_or_default()
    }

    /// Network search on our read relays plus `extra` ephemeral relays.
    async fn fetch_newest(
        &self,
        filter: Filter,
        extra: Vec<RelayUrl>,
    ) -> Result<Option<NoteLender>> {
        let pool = &self.inner.pool;
        let mut options = StreamOptions {
            mode: StreamMode::LocalAndNetworkParallel(None),
            ..StreamOptions::default()
        };
        let guard = if extra.is_empty() {
            None
        } else {
            let guard = pool.acquire_ephemeral_relays(&extra).await;
            let mut to: Vec<RelayUrl> = pool
                .read_relays(None)
                .await
                .iter()
                .map(|relay| relay.url().clone())
                .collect();
            for url in extra {
                if !to.contains(&url) {
                    to.push(url);
                }
            }
            options.to = Some(to);
            Some(guard)
        };

        let mut newest: Option<(u64, NoteLender)> = None;
        let mut notes = self.stream_existing_events(vec![filter], options);
        let mut failure = None;
        while let Some(lender) = notes.next().await {
            match lender.with_borrowed(|event| event.created_at) {
                Ok(Some(created_at)) => {
                    if newest.as_ref().is_none_or(|(current, _)| created_at >= *current) {
                        newest = Some((created_at, lender));
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        drop(notes);

        if let Some(guard) = guard {
            guard.release().await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(newest.map(|(_, lender)| lender)),
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn into_note(item: StreamItem) -> Option<NoteLender> {
    match item {
        StreamItem::Event(lender) => Some(lender),
        StreamItem::GenericEose | StreamItem::LocalEose | StreamItem::NetworkEose => None,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

async fn feed_relay_lists(ctx: Arc<ManagerInner>) {
    let mut lists = ctx
        .local
        .stream(vec![Filter::new().kinds([KIND_RELAY_LIST])]);
    while let Some(item) = lists.next().await {
        let LocalItem::Event(key) = item else {
            continue;
        };
        match ctx.store.lookup_by_key(key) {
            Ok(Some(event)) => ctx.outbox.record_relay_list_event(&event).await,
            Ok(None) => {}
            Err(error) => debug!(%error, "relay list vanished before it was read"),
        }
    }
}

/// Ids a merged subscription remembers for deduplication.
const MAX_TRACKED_IDS: usize = 10_000;

/// Insertion-ordered id set that forgets its oldest entry past `capacity`.
struct RecentIds {
    capacity: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` when `id` was not remembered.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

struct MergeState {
    yielded: RecentIds,
    local_eose: bool,
    network_eose: bool,
    generic_sent: bool,
    latest_created_at: Option<u64>,
    /// Local items per filter, kept for negentropy.
    negentropy_items: Vec<Vec<Item>>,
}

/// Shared state of one merged subscription.
struct Merge {
    ctx: Arc<ManagerInner>,
    filters: Vec<Filter>,
    to: Option<Vec<RelayUrl>>,
    mode: StreamMode,
    preload: bool,
    out: mpsc::Sender<StreamItem>,
    state: Mutex<MergeState>,
    local_eose: watch::Sender<bool>,
}

/// How a network session ended.
enum Flow {
    Ended,
    Cancelled,
}

struct LocalNote {
    id: String,
    created_at: u64,
    item: Option<Item>,
    matched: Vec<usize>,
}

impl Merge {
    /// Yield `lender` unless its id went out before. Returns `false` once
    /// the consumer is gone.
    async fn emit(&self, lender: NoteLender, id: &str, event: Option<Event>) -> bool {
        {
            let mut state = self.state.lock().await;
            if !state.yielded.insert(id) {
                return true;
            }
            if self.out.send(StreamItem::Event(lender)).await.is_err() {
                return false;
            }
        }
        if self.preload
            && let Some(event) = event
        {
            self.ctx.preloader.preload(&event).await;
        }
        true
    }

    async fn emit_network(&self, event: Event) -> bool {
        let lender = match self.ctx.store.lookup_by_id(&event.id) {
            Ok(Some(key)) => NoteLender::local(Arc::clone(&self.ctx.store), key),
            Ok(None) | Err(_) => NoteLender::owned(event.clone()),
        };
        let id = event.id.clone();
        self.emit(lender, &id, Some(event)).await
    }

    async fn observe_local(&self, note: &LocalNote) {
        let mut state = self.state.lock().await;
        state.latest_created_at = Some(
            state
                .latest_created_at
                .map_or(note.created_at, |latest| latest.max(note.created_at)),
        );
        if let Some(item) = note.item {
            for &index in &note.matched {
                if let Some(items) = state.negentropy_items.get_mut(index) {
                    items.push(item);
                }
            }
        }
    }

    async fn mark_local_eose(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.local_eose {
            return true;
        }
        state.local_eose = true;
        self.local_eose.send_replace(true);
        if self.out.send(StreamItem::LocalEose).await.is_err() {
            return false;
        }
        self.send_generic_if_ready(&mut state).await
    }

    async fn mark_network_eose(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.network_eose {
            return true;
        }
        state.network_eose = true;
        if self.out.send(StreamItem::NetworkEose).await.is_err() {
            return false;
        }
        self.send_generic_if_ready(&mut state).await
    }

    async fn send_generic_if_ready(&self, state: &mut MergeState) -> bool {
        let reachable = self.ctx.pool.network_status().is_satisfied();
        if state.generic_sent
            || !generic_eose_ready(self.mode, state.local_eose, state.network_eose, reachable)
        {
            return true;
        }
        state.generic_sent = true;
        debug!(mode = ?self.mode, "merged subscription caught up");
        self.out.send(StreamItem::GenericEose).await.is_ok()
    }

    async fn negentropy_storage(&self, index: usize) -> Result<NegentropyStorage> {
        let state = self.state.lock().await;
        let mut storage = NegentropyStorage::new();
        for item in state.negentropy_items.get(index).into_iter().flatten() {
            storage.add(item.timestamp, item.id)?;
        }
        storage.seal()?;
        Ok(storage)
    }

    /// Whether a local note belongs in a stream aimed at `self.to`: one of
    /// those relays must have delivered it.
    fn seen_on_targets(&self, key: NoteKey) -> bool {
        let Some(to) = &self.to else {
            return true;
        };
        match self.ctx.store.was_seen_on_any_of(key, to) {
            Ok(seen) => seen,
            Err(error) => {
                debug!(%error, key, "relay provenance unavailable");
                false
            }
        }
    }

    fn read_local(&self, key: NoteKey) -> Result<Option<(LocalNote, Option<Event>)>> {
        let mut found = None;
        self.ctx.store.with_note(key, &mut |event: &Event| {
            let note = LocalNote {
                id: event.id.clone(),
                created_at: event.created_at,
                item: negentropy_item(event),
                matched: self
                    .filters
                    .iter()
                    .enumerate()
                    .filter(|(_, filter)| filter.matches(event))
                    .map(|(index, _)| index)
                    .collect(),
            };
            let copy = self.preload.then(|| event.clone());
            found = Some((note, copy));
        })?;
        Ok(found)
    }

    /// Forward a pool subscription. Returns at EOSE when `until_eose` is
    /// set, otherwise when the pool stream ends.
    async fn forward(&self, mut stream: TaskStream<PoolItem>, until_eose: bool) -> Flow {
        while let Some(item) = stream.next().await {
            match item {
                PoolItem::Event { event, .. } => {
                    if !self.emit_network(event).await {
                        return Flow::Cancelled;
                    }
                }
                PoolItem::Eose if until_eose => return Flow::Ended,
                PoolItem::Eose => {
                    if !self.mark_network_eose().await {
                        return Flow::Cancelled;
                    }
                }
            }
        }
        Flow::Ended
    }

    async fn network_filters(&self) -> Vec<Filter> {
        match self.mode.optimization() {
            Some(NetworkOptimization::Since) => {
                let latest = self.state.lock().await.latest_created_at;
                match latest {
                    Some(latest) => {
                        let since = latest.saturating_sub(self.ctx.config.since_margin.as_secs());
                        self.filters.iter().map(|filter| filter.with_since(since)).collect()
                    }
                    None => self.filters.clone(),
                }
            }
            Some(NetworkOptimization::Negentropy) | None => self.filters.clone(),
        }
    }

    async fn network_session(&self) -> Flow {
        if self.mode.optimization() == Some(NetworkOptimization::Negentropy) {
            return self.negentropy_session().await;
        }
        let filters = self.network_filters().await;
        match self.ctx.pool.subscribe(filters, self.to.clone(), None).await {
            Ok(stream) => self.forward(stream, false).await,
            Err(error) => {
                warn!(%error, "network subscription failed");
                Flow::Ended
            }
        }
    }

    /// Reconcile with every relay, fetch what is missing, then follow live
    /// events.
    async fn negentropy_session(&self) -> Flow {
        let pool = &self.ctx.pool;
        let sync = &self.ctx.negentropy;
        let mut fallback = Vec::new();

        for relay in pool.read_relays(self.to.as_deref()).await {
            let url = relay.url().clone();
            if sync.support().is_unsupported(&url).await || !relay.is_connected().await {
                fallback.push(url);
                continue;
            }

            let mut need = Vec::new();
            let mut reconciled = true;
            for (index, filter) in self.filters.iter().enumerate() {
                let outcome = match self.negentropy_storage(index).await {
                    Ok(storage) => sync.reconcile(&url, filter, &storage).await,
                    Err(error) => Err(error),
                };
                match outcome {
                    Ok(outcome) => need.extend(outcome.need_ids),
                    Err(error) => {
                        debug!(relay = %url, %error, "negentropy unavailable, using REQ");
                        reconciled = false;
                        break;
                    }
                }
            }
            if !reconciled {
                fallback.push(url);
                continue;
            }
            if need.is_empty() {
                continue;
            }

            let filters = need_filters(&need, sync.config().fetch_batch_size);
            match pool.subscribe(filters, Some(vec![url]), None).await {
                Ok(stream) => {
                    if let Flow::Cancelled = self.forward(stream, true).await {
                        return Flow::Cancelled;
                    }
                }
                Err(error) => warn!(%error, "missing event fetch failed"),
            }
        }

        if !fallback.is_empty() {
            match pool.subscribe(self.filters.clone(), Some(fallback), None).await {
                Ok(stream) => {
                    if let Flow::Cancelled = self.forward(stream, true).await {
                        return Flow::Cancelled;
                    }
                }
                Err(error) => warn!(%error, "fallback subscription failed"),
            }
        }
        if !self.mark_network_eose().await {
            return Flow::Cancelled;
        }

        let now = unix_now();
        let live: Vec<Filter> = self.filters.iter().map(|filter| filter.with_since(now)).collect();
        match pool.subscribe(live, self.to.clone(), None).await {
            Ok(stream) => self.forward(stream, false).await,
            Err(error) => {
                warn!(%error, "live subscription failed");
                Flow::Ended
            }
        }
    }
}

async fn run_local(merge: Arc<Merge>) {
    let mut local = merge.ctx.local.stream(merge.filters.clone());
    while let Some(item) = local.next().await {
        match item {
            LocalItem::Event(key) => {
                if !merge.seen_on_targets(key) {
                    continue;
                }
                let (note, copy) = match merge.read_local(key) {
                    Ok(Some(found)) => found,
                    Ok(None) => continue,
                    Err(error) => {
                        debug!(%error, key, "local note unreadable");
                        continue;
                    }
                };
                merge.observe_local(&note).await;
                let lender = NoteLender::local(Arc::clone(&merge.ctx.store), key);
                if !merge.emit(lender, &note.id, copy).await {
                    return;
                }
            }
            LocalItem::Eose => {
                if !merge.mark_local_eose().await {
                    return;
                }
            }
        }
    }
}

async fn run_network(merge: Arc<Merge>) {
    if merge.mode.optimization().is_some() {
        let mut local_eose = merge.local_eose.subscribe();
        let caught_up = local_eose.wait_for(|done| *done).await.is_ok();
        if !caught_up {
            return;
        }
    }
    loop {
        match merge.network_session().await {
            Flow::Cancelled => return,
            Flow::Ended => {
                debug!("network session ended, restarting");
                tokio::time::sleep(merge.ctx.config.network_retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests;

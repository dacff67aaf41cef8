//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{sink, stream};
use nostr::nip77::{Negentropy, NegentropyConfig, NegentropyStorage};
use nostr::{Event, Filter, KIND_TEXT_NOTE, RelayUrl};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::error::{ClientError, Result};
use crate::local::{LocalItem, LocalStore, LocalSubscription, NoteKey};
use crate::negentropy::negentropy_item;
use crate::transport::{BoxSink, BoxStream, Connector};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds, sleeping 10ms between attempts.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn hex_id(n: u64) -> String {
    format!("{n:064x}")
}

pub fn pubkey(n: u64) -> String {
    format!("{:064x}", n + 0xA000)
}

pub fn event(n: u64, kind: u16, created_at: u64, author: &str) -> Event {
    Event {
        id: hex_id(n),
        pubkey: author.to_string(),
        created_at,
        kind,
        tags: Vec::new(),
        content: String::new(),
        sig: String::new(),
    }
}

pub fn text_note(n: u64, created_at: u64, content: &str) -> Event {
    Event {
        content: content.to_string(),
        ..event(n, KIND_TEXT_NOTE, created_at, &pubkey(1))
    }
}

pub fn relay_url(url: &str) -> RelayUrl {
    RelayUrl::parse(url).unwrap()
}

#[derive(Default)]
struct StoreInner {
    notes: Vec<Event>,
    by_id: HashMap<String, NoteKey>,
    seen_on: HashMap<NoteKey, HashSet<RelayUrl>>,
    subscribers: Vec<(Vec<Filter>, mpsc::UnboundedSender<LocalItem>)>,
}

/// Event store keyed by insertion order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store `event` (once per id) and notify live subscribers.
    pub fn insert(&self, event: Event) -> NoteKey {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&key) = inner.by_id.get(&event.id) {
            return key;
        }
        let key = inner.notes.len() as NoteKey;
        inner.by_id.insert(event.id.clone(), key);
        inner.subscribers.retain(|(filters, tx)| {
            !matches_any(filters, &event) || tx.send(LocalItem::Event(key)).is_ok()
        });
        inner.notes.push(event);
        key
    }

    /// Close the database, ending every subscription.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.lock().unwrap().subscribers.clear();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().notes.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().by_id.contains_key(id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ClientError::DatabaseClosed)
        } else {
            Ok(())
        }
    }
}

fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}

impl LocalStore for MemoryStore {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn query(&self, filters: &[Filter], limit: usize) -> Result<Vec<NoteKey>> {
        self.ensure_open()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .notes
            .iter()
            .enumerate()
            .filter(|(_, event)| matches_any(filters, event))
            .map(|(key, _)| key as NoteKey)
            .take(limit)
            .collect())
    }

    fn subscribe(&self, filters: &[Filter]) -> Result<LocalSubscription> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        for (key, event) in inner.notes.iter().enumerate() {
            if matches_any(filters, event) {
                let _ = tx.send(LocalItem::Event(key as NoteKey));
            }
        }
        let _ = tx.send(LocalItem::Eose);
        inner.subscribers.push((filters.to_vec(), tx));
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    fn with_note(&self, key: NoteKey, f: &mut dyn FnMut(&Event)) -> Result<bool> {
        self.ensure_open()?;
        let inner = self.inner.lock().unwrap();
        match inner.notes.get(key as usize) {
            Some(event) => {
                f(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn lookup_by_id(&self, id: &str) -> Result<Option<NoteKey>> {
        self.ensure_open()?;
        Ok(self.inner.lock().unwrap().by_id.get(id).copied())
    }

    fn was_seen_on_any_of(&self, key: NoteKey, relays: &[RelayUrl]) -> Result<bool> {
        self.ensure_open()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .seen_on
            .get(&key)
            .is_some_and(|seen| relays.iter().any(|relay| seen.contains(relay))))
    }

    fn process_event(&self, relay: &RelayUrl, event: &Event) -> Result<()> {
        self.ensure_open()?;
        let key = self.insert(event.clone());
        self.inner
            .lock()
            .unwrap()
            .seen_on
            .entry(key)
            .or_default()
            .insert(relay.clone());
        Ok(())
    }
}

/// Relay double speaking REQ/CLOSE/EVENT and answering negentropy with the
/// core engine.
pub struct MemoryRelay {
    url: RelayUrl,
    events: Mutex<Vec<Event>>,
    received: Mutex<Vec<String>>,
    connections: Mutex<HashMap<usize, mpsc::UnboundedSender<String>>>,
    subscriptions: Mutex<HashMap<(usize, String), Vec<Filter>>>,
    negentropy_sessions: Mutex<HashMap<(usize, String), NegentropyStorage>>,
    next_connection: AtomicUsize,
    connect_attempts: AtomicUsize,
    online: AtomicBool,
    sends_eose: AtomicBool,
    supports_negentropy: AtomicBool,
    negentropy_silent: AtomicBool,
    stalls: AtomicBool,
}

impl MemoryRelay {
    fn new(url: RelayUrl) -> Self {
        Self {
            url,
            events: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            negentropy_sessions: Mutex::new(HashMap::new()),
            next_connection: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
            online: AtomicBool::new(true),
            sends_eose: AtomicBool::new(true),
            supports_negentropy: AtomicBool::new(true),
            negentropy_silent: AtomicBool::new(false),
            stalls: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// Events the relay holds before any client connects.
    pub fn store(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    /// Store `event` and push it to every matching live subscription.
    pub fn publish(&self, event: Event) {
        self.store(event.clone());
        let subscriptions = self.subscriptions.lock().unwrap().clone();
        for ((connection, sub_id), filters) in subscriptions {
            if matches_any(&filters, &event) {
                self.push(connection, json!(["EVENT", sub_id, event]));
            }
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_sends_eose(&self, sends_eose: bool) {
        self.sends_eose.store(sends_eose, Ordering::SeqCst);
    }

    pub fn set_supports_negentropy(&self, supported: bool) {
        self.supports_negentropy.store(supported, Ordering::SeqCst);
    }

    /// Accept `NEG-OPEN` but never answer it.
    pub fn set_negentropy_silent(&self, silent: bool) {
        self.negentropy_silent.store(silent, Ordering::SeqCst);
    }

    /// Leave new connection attempts hanging instead of answering them.
    pub fn set_stalls(&self, stalls: bool) {
        self.stalls.store(stalls, Ordering::SeqCst);
    }

    /// Drop every open connection.
    pub fn kick(&self) {
        self.connections.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Received frames whose first element is `kind`.
    pub fn received_of(&self, kind: &str) -> Vec<Value> {
        self.received()
            .iter()
            .filter_map(|text| serde_json::from_str::<Value>(text).ok())
            .filter(|value| value.get(0).and_then(Value::as_str) == Some(kind))
            .collect()
    }

    pub fn open_subscriptions(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    fn accept(self: &Arc<Self>) -> Result<(BoxSink, BoxStream)> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(ClientError::Connection(format!("{} is offline", self.url)));
        }
        let connection = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let (to_client, from_relay) = mpsc::unbounded_channel::<String>();
        self.connections.lock().unwrap().insert(connection, to_client);

        let relay = Arc::clone(self);
        let sink = sink::unfold(relay, move |relay, text: String| async move {
            relay.handle(connection, &text);
            Ok::<_, ClientError>(relay)
        });
        let frames = stream::unfold(from_relay, |mut rx| async move {
            rx.recv().await.map(|text| (Ok(text), rx))
        });
        Ok((Box::pin(sink), Box::pin(frames)))
    }

    fn push(&self, connection: usize, message: Value) {
        if let Some(tx) = self.connections.lock().unwrap().get(&connection) {
            let _ = tx.send(message.to_string());
        }
    }

    fn matching(&self, filters: &[Filter]) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches_any(filters, event))
            .cloned()
            .collect()
    }

    fn handle(&self, connection: usize, text: &str) {
        self.received.lock().unwrap().push(text.to_string());
        let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let kind = parts.first().and_then(Value::as_str).unwrap_or_default();
        let sub_id = parts
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match kind {
            "REQ" => {
                let filters: Vec<Filter> = parts[2..]
                    .iter()
                    .filter_map(|value| serde_json::from_value(value.clone()).ok())
                    .collect();
                for event in self.matching(&filters) {
                    self.push(connection, json!(["EVENT", sub_id, event]));
                }
                if self.sends_eose.load(Ordering::SeqCst) {
                    self.push(connection, json!(["EOSE", sub_id]));
                }
                self.subscriptions
                    .lock()
                    .unwrap()
                    .insert((connection, sub_id), filters);
            }
            "CLOSE" => {
                self.subscriptions
                    .lock()
                    .unwrap()
                    .remove(&(connection, sub_id));
            }
            "EVENT" => {
                if let Some(event) = parts
                    .get(1)
                    .and_then(|value| serde_json::from_value::<Event>(value.clone()).ok())
                {
                    let id = event.id.clone();
                    self.publish(event);
                    self.push(connection, json!(["OK", id, true, ""]));
                }
            }
            "NEG-OPEN" => {
                if !self.supports_negentropy.load(Ordering::SeqCst) {
                    self.push(
                        connection,
                        json!(["NEG-ERR", sub_id, "blocked: negentropy disabled"]),
                    );
                    return;
                }
                let Some(filter) = parts
                    .get(2)
                    .and_then(|value| serde_json::from_value::<Filter>(value.clone()).ok())
                else {
                    return;
                };
                let mut storage = NegentropyStorage::new();
                for event in self.matching(std::slice::from_ref(&filter)) {
                    if let Some(item) = negentropy_item(&event) {
                        storage.add(item.timestamp, item.id).unwrap();
                    }
                }
                storage.seal().unwrap();
                let message = parts
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.negentropy_sessions
                    .lock()
                    .unwrap()
                    .insert((connection, sub_id.clone()), storage);
                self.answer_negentropy(connection, &sub_id, &message);
            }
            "NEG-MSG" => {
                let message = parts
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.answer_negentropy(connection, &sub_id, &message);
            }
            "NEG-CLOSE" => {
                self.negentropy_sessions
                    .lock()
                    .unwrap()
                    .remove(&(connection, sub_id));
            }
            _ => {}
        }
    }

    fn answer_negentropy(&self, connection: usize, sub_id: &str, message: &str) {
        if self.negentropy_silent.load(Ordering::SeqCst) {
            return;
        }
        let reply = {
            let sessions = self.negentropy_sessions.lock().unwrap();
            let Some(storage) = sessions.get(&(connection, sub_id.to_string())) else {
                return;
            };
            let mut session = Negentropy::new(storage, NegentropyConfig::default()).unwrap();
            session.reconcile_hex(message)
        };
        match reply {
            Ok(reply) => self.push(connection, json!(["NEG-MSG", sub_id, reply])),
            Err(error) => self.push(connection, json!(["NEG-ERR", sub_id, error.to_string()])),
        }
    }
}

/// Connector resolving relay URLs to [`MemoryRelay`]s.
#[derive(Default)]
pub struct MemoryConnector {
    relays: Mutex<HashMap<RelayUrl, Arc<MemoryRelay>>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_relay(&self, url: &str) -> Arc<MemoryRelay> {
        let relay = Arc::new(MemoryRelay::new(relay_url(url)));
        self.relays
            .lock()
            .unwrap()
            .insert(relay.url().clone(), Arc::clone(&relay));
        relay
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &RelayUrl) -> Result<(BoxSink, BoxStream)> {
        let relay = self.relays.lock().unwrap().get(url).cloned();
        match relay {
            Some(relay) if relay.stalls.load(Ordering::SeqCst) => {
                relay.connect_attempts.fetch_add(1, Ordering::SeqCst);
                std::future::pending().await
            }
            Some(relay) => relay.accept(),
            None => Err(ClientError::Connection(format!("no route to {url}"))),
        }
    }
}

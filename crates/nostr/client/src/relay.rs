//! Single relay connection management.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use nostr::nip77::NegEnvelope;
use nostr::{Event, Filter, RelayUrl};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::transport::{BoxSink, BoxStream, Connector};

/// Lines kept by a relay's connection log.
pub const RELAY_LOG_LINES: usize = 100;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting { since: Instant },
    Connected,
    Failed,
}

/// How a relay entered the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayVariant {
    Regular,
    /// Added for a single lookup and removed right after.
    Ephemeral,
    /// Relay of a wallet connection; kept out of the user's relay set.
    WalletConnect,
}

/// A relay the pool knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    pub url: RelayUrl,
    pub read: bool,
    pub write: bool,
    pub variant: RelayVariant,
}

impl RelayDescriptor {
    /// Regular read+write relay.
    pub fn new(url: RelayUrl) -> Self {
        Self {
            url,
            read: true,
            write: true,
            variant: RelayVariant::Regular,
        }
    }

    pub fn read_only(url: RelayUrl) -> Self {
        Self {
            write: false,
            ..Self::new(url)
        }
    }

    pub fn ephemeral(url: RelayUrl) -> Self {
        Self {
            url,
            read: true,
            write: false,
            variant: RelayVariant::Ephemeral,
        }
    }

    /// Read+write relay serving a wallet connection.
    pub fn wallet_connect(url: RelayUrl) -> Self {
        Self {
            variant: RelayVariant::WalletConnect,
            ..Self::new(url)
        }
    }

    /// Whether the relay stays out of "our" relays and default targets.
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self.variant,
            RelayVariant::Ephemeral | RelayVariant::WalletConnect
        )
    }

    /// Whether this relay may carry `message`.
    pub fn accepts(&self, message: &ClientMessage) -> bool {
        (!message.is_read() || self.read) && (!message.is_write() || self.write)
    }
}

/// Relay message received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event(String, Event),
    Ok(String, bool, String),
    Eose(String),
    Notice(String),
    Auth(String),
    Closed(String, String),
    Neg(NegEnvelope),
}

impl RelayMessage {
    /// Subscription the message belongs to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Event(id, _) | Self::Eose(id) | Self::Closed(id, _) => Some(id),
            Self::Neg(envelope) => Some(envelope.subscription_id()),
            Self::Ok(..) | Self::Notice(_) | Self::Auth(_) => None,
        }
    }
}

/// Message sent from the client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Event(Box<Event>),
    Neg(NegEnvelope),
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Req {
                subscription_id, ..
            }
            | Self::Close(subscription_id) => Some(subscription_id),
            Self::Neg(envelope) => Some(envelope.subscription_id()),
            Self::Event(_) => None,
        }
    }

    /// Needs a read-capable relay.
    pub fn is_read(&self) -> bool {
        !self.is_write()
    }

    /// Needs a write-capable relay.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Event(_))
    }

    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut parts = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    parts.push(serde_json::to_value(filter)?);
                }
                Value::Array(parts)
            }
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id]),
            Self::Event(event) => json!(["EVENT", event]),
            Self::Neg(envelope) => envelope.to_json(),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Most recent connection events of one relay.
#[derive(Debug, Clone, Default)]
pub struct RelayLog {
    lines: VecDeque<String>,
}

impl RelayLog {
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == RELAY_LOG_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Consecutive failed attempts after which the relay is marked broken.
    pub max_connect_failures: u32,
    /// Keep a [`RelayLog`] for the relay.
    pub keep_log: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connect_failures: 5,
            keep_log: false,
        }
    }
}

/// What a relay reports back to the pool.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    Connected(RelayUrl),
    Message(RelayUrl, RelayMessage),
}

/// Relay connection.
pub struct RelayConnection {
    descriptor: RelayDescriptor,
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<PoolEvent>,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<BoxSink>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    failures: AtomicU32,
    broken: AtomicBool,
    wanted: AtomicBool,
    log: Option<Mutex<RelayLog>>,
}

impl RelayConnection {
    pub(crate) fn new(
        descriptor: RelayDescriptor,
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        let log = config.keep_log.then(|| Mutex::new(RelayLog::default()));
        Self {
            descriptor,
            config,
            connector,
            events,
            state: RwLock::new(ConnectionState::NotConnected),
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
            connect_task: Mutex::new(None),
            generation: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            broken: AtomicBool::new(false),
            wanted: AtomicBool::new(false),
            log,
        }
    }

    pub fn descriptor(&self) -> &RelayDescriptor {
        &self.descriptor
    }

    pub fn url(&self) -> &RelayUrl {
        &self.descriptor.url
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Marked unreachable after repeated connection failures.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Whether the pool should keep this relay connected.
    pub(crate) fn is_wanted(&self) -> bool {
        self.wanted.load(Ordering::SeqCst)
    }

    pub async fn log_lines(&self) -> Vec<String> {
        match &self.log {
            Some(log) => log.lock().await.lines().map(str::to_string).collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn clear_broken(&self) {
        self.broken.store(false, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Start a connection attempt in the background, replacing any attempt
    /// still in flight.
    pub(crate) async fn start_connect(self: &Arc<Self>) {
        self.wanted.store(true, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Connecting {
            since: Instant::now(),
        };
        let relay = Arc::clone(self);
        let attempt = tokio::spawn(async move {
            // Failures are logged and counted by `connect`.
            let _ = relay.connect().await;
        });
        if let Some(previous) = self.connect_task.lock().await.replace(attempt) {
            previous.abort();
        }
    }

    /// Connect to the relay and start the background reader.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let url = self.url().clone();
        self.wanted.store(true, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Connecting {
            since: Instant::now(),
        };
        self.record("connecting").await;

        match self.connector.connect(&url).await {
            Ok((sink, frames)) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(previous) = self.reader_task.lock().await.take() {
                    previous.abort();
                }
                *self.writer.lock().await = Some(sink);
                self.failures.store(0, Ordering::SeqCst);
                *self.state.write().await = ConnectionState::Connected;

                let reader = tokio::spawn(read_frames(
                    Arc::downgrade(self),
                    generation,
                    url.clone(),
                    frames,
                    self.events.clone(),
                ));
                *self.reader_task.lock().await = Some(reader);

                info!(relay = %url, "relay connected");
                self.record("connected").await;
                if self.events.send(PoolEvent::Connected(url)).is_err() {
                    debug!("relay pool dispatcher is gone");
                }
                Ok(())
            }
            Err(error) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                *self.state.write().await = ConnectionState::Failed;
                warn!(relay = %url, %error, failures, "relay connection failed");
                if failures >= self.config.max_connect_failures
                    && !self.broken.swap(true, Ordering::SeqCst)
                {
                    warn!(relay = %url, failures, "relay marked broken");
                }
                self.record(format!("connection failed: {error}")).await;
                Err(error)
            }
        }
    }

    /// Drop the connection and stop reconnecting until asked again.
    pub async fn disconnect(&self) {
        self.wanted.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(attempt) = self.connect_task.lock().await.take() {
            attempt.abort();
        }
        if let Some(reader) = self.reader_task.lock().await.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(error) = writer.close().await
        {
            debug!(relay = %self.url(), %error, "error closing relay connection");
        }
        *self.state.write().await = ConnectionState::NotConnected;
        self.record("disconnected").await;
    }

    /// Send a protocol message over the open connection.
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;
        writer.send(text).await
    }

    async fn handle_disconnect(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.writer.lock().await.take();
        self.reader_task.lock().await.take();
        *self.state.write().await = ConnectionState::Failed;
        info!(relay = %self.url(), "relay connection dropped");
        self.record("connection dropped").await;
    }

    async fn record(&self, line: impl Into<String>) {
        if let Some(log) = &self.log {
            log.lock().await.push(line);
        }
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("descriptor", &self.descriptor)
            .field("failures", &self.failure_count())
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

async fn read_frames(
    relay: Weak<RelayConnection>,
    generation: u64,
    url: RelayUrl,
    mut frames: BoxStream,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(text) => match parse_relay_message(&text) {
                Ok(Some(message)) => {
                    if events.send(PoolEvent::Message(url.clone(), message)).is_err() {
                        return;
                    }
                }
                Ok(None) => debug!(relay = %url, "ignoring unknown relay message"),
                Err(error) => warn!(relay = %url, %error, "skipping malformed relay message"),
            },
            Err(error) => {
                debug!(relay = %url, %error, "relay read failed");
                break;
            }
        }
    }

    if let Some(relay) = relay.upgrade() {
        relay.handle_disconnect(generation).await;
    }
}

/// Parse relay protocol JSON text message into typed relay message.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    if array.is_empty() {
        return Ok(None);
    }

    let kind = array[0]
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    let text_at = |index: usize, what: &str| -> Result<String> {
        array
            .get(index)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Protocol(format!("invalid {kind} {what}")))
    };

    match kind {
        "EVENT" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid EVENT message".to_string()));
            }
            let subscription_id = text_at(1, "subscription id")?;
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            Ok(Some(RelayMessage::Event(subscription_id, event)))
        }
        "OK" => {
            if array.len() < 4 {
                return Err(ClientError::Protocol("invalid OK message".to_string()));
            }
            let event_id = text_at(1, "event id")?;
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let message = text_at(3, "message text")?;
            Ok(Some(RelayMessage::Ok(event_id, accepted, message)))
        }
        "EOSE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid EOSE message".to_string()));
            }
            Ok(Some(RelayMessage::Eose(text_at(1, "subscription id")?)))
        }
        "NOTICE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
            }
            Ok(Some(RelayMessage::Notice(text_at(1, "message text")?)))
        }
        "AUTH" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid AUTH message".to_string()));
            }
            Ok(Some(RelayMessage::Auth(text_at(1, "challenge")?)))
        }
        "CLOSED" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid CLOSED message".to_string()));
            }
            let subscription_id = text_at(1, "subscription id")?;
            // The reason is optional in practice.
            let reason = array
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Some(RelayMessage::Closed(subscription_id, reason)))
        }
        "NEG-MSG" | "NEG-ERR" => NegEnvelope::from_json(&value)
            .map(|envelope| Some(RelayMessage::Neg(envelope)))
            .map_err(|error| ClientError::Protocol(format!("invalid {kind} message: {error}"))),
        _ => Ok(None),
    }
}

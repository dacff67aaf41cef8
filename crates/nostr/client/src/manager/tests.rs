use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{KIND_TEXT_NOTE, RelayUrl};
use serde_json::Value;
use tokio::time::Instant;

use super::*;
use crate::network::{ManualNetworkMonitor, PathStatus};
use crate::pool::PoolConfig;
use crate::relay::RelayDescriptor;
use crate::testing::{
    MemoryConnector, MemoryRelay, MemoryStore, event, eventually, hex_id, init_tracing, pubkey,
    relay_url, text_note,
};

const RELAY_A: &str = "wss://a.example.com";
const RELAY_B: &str = "wss://b.example.com";

struct Harness {
    store: Arc<MemoryStore>,
    connector: Arc<MemoryConnector>,
    pool: RelayPool,
    manager: SubscriptionManager,
}

fn harness(status: PathStatus) -> Harness {
    harness_with_outbox(status, None)
}

fn harness_with_outbox(
    status: PathStatus,
    outbox: Option<Arc<dyn OutboxRelayHintProvider>>,
) -> Harness {
    init_tracing();
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let pool = RelayPool::builder(PoolConfig::default())
        .connector(connector.clone())
        .network_monitor(Arc::new(ManualNetworkMonitor::new(status)))
        .local_store(store.clone())
        .build();
    let config = ClientConfig::default();
    let manager = match outbox {
        Some(outbox) => {
            SubscriptionManager::with_outbox(pool.clone(), store.clone(), &config, outbox)
        }
        None => SubscriptionManager::new(pool.clone(), store.clone(), &config),
    };
    Harness {
        store,
        connector,
        pool,
        manager,
    }
}

impl Harness {
    /// Add a relay to the pool and wait for it to connect (unless offline).
    async fn relay(&self, url: &str, online: bool) -> Arc<MemoryRelay> {
        let relay = self.connector.add_relay(url);
        relay.set_online(online);
        let url = relay_url(url);
        self.pool
            .add_relay(RelayDescriptor::new(url.clone()))
            .await
            .unwrap();
        self.pool.connect(Some(std::slice::from_ref(&url))).await;
        if online {
            let (pool, url) = (&self.pool, &url);
            eventually("relay to connect", || async move {
                pool.relay(url).await.unwrap().is_connected().await
            })
            .await;
        }
        relay
    }
}

fn notes() -> Vec<Filter> {
    vec![Filter::new().kinds([KIND_TEXT_NOTE])]
}

fn label(item: &StreamItem) -> String {
    match item {
        StreamItem::Event(lender) => lender
            .with_borrowed(|event| event.id.clone())
            .unwrap()
            .unwrap(),
        StreamItem::LocalEose => "LOCAL_EOSE".to_string(),
        StreamItem::NetworkEose => "NETWORK_EOSE".to_string(),
        StreamItem::GenericEose => "GENERIC_EOSE".to_string(),
    }
}

async fn labels_until(stream: &mut TaskStream<StreamItem>, marker: &str) -> Vec<String> {
    let mut labels = Vec::new();
    while let Some(item) = stream.next().await {
        let label = label(&item);
        let done = label == marker;
        labels.push(label);
        if done {
            break;
        }
    }
    labels
}

fn options(mode: StreamMode) -> StreamOptions {
    StreamOptions {
        mode,
        ..StreamOptions::default()
    }
}

fn req_filters(relay: &MemoryRelay) -> Vec<Value> {
    relay
        .received_of("REQ")
        .into_iter()
        .filter_map(|frame| frame.get(2).cloned())
        .collect()
}

#[test]
fn generic_eose_policy() {
    use StreamMode::{LocalAndNetworkParallel, LocalFirst, LocalOnly};

    // (mode, local EOSE, network EOSE, network reachable, caught up)
    let cases = [
        (LocalOnly, true, false, true, true),
        (LocalOnly, false, true, true, false),
        (LocalFirst(None), true, false, true, true),
        (LocalFirst(Some(NetworkOptimization::Since)), false, true, true, false),
        (LocalAndNetworkParallel(None), true, false, true, false),
        (LocalAndNetworkParallel(None), true, true, true, true),
        (LocalAndNetworkParallel(None), true, false, false, true),
        (LocalAndNetworkParallel(None), false, true, false, false),
    ];
    for (mode, local, network, reachable, ready) in cases {
        assert_eq!(
            generic_eose_ready(mode, local, network, reachable),
            ready,
            "mode {mode:?} local {local} network {network} reachable {reachable}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn local_first_offline_yields_stored_notes_then_completes() {
    let h = harness(PathStatus::Unsatisfied);
    h.relay(RELAY_A, false).await;
    for n in 1..=3 {
        h.store.insert(text_note(n, 100 + n, "stored"));
    }

    let started = Instant::now();
    let notes: Vec<NoteLender> = h
        .manager
        .stream_existing_events(notes(), StreamOptions::default())
        .collect()
        .await;
    let ids: Vec<String> = notes
        .iter()
        .map(|note| {
            note.with_borrowed(|event| event.id.clone())
                .unwrap()
                .unwrap()
        })
        .collect();
    assert_eq!(ids, vec![hex_id(1), hex_id(2), hex_id(3)]);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn parallel_mode_waits_for_the_network() {
    let h = harness(PathStatus::Satisfied);
    let relay = h.relay(RELAY_A, true).await;
    relay.set_sends_eose(false);
    h.store.insert(text_note(1, 100, "stored"));

    let started = Instant::now();
    let mut stream = h
        .manager
        .stream(notes(), options(StreamMode::LocalAndNetworkParallel(None)));
    let labels = labels_until(&mut stream, "GENERIC_EOSE").await;
    assert_eq!(
        labels,
        vec![
            hex_id(1),
            "LOCAL_EOSE".into(),
            "NETWORK_EOSE".into(),
            "GENERIC_EOSE".into()
        ]
    );
    assert!(started.elapsed() >= h.pool.config().eose_timeout);
}

#[tokio::test(start_paused = true)]
async fn parallel_mode_offline_settles_for_local_eose() {
    let h = harness(PathStatus::Unsatisfied);
    h.relay(RELAY_A, false).await;
    h.store.insert(text_note(1, 100, "stored"));

    let started = Instant::now();
    let mut stream = h
        .manager
        .stream(notes(), options(StreamMode::LocalAndNetworkParallel(None)));
    let labels = labels_until(&mut stream, "GENERIC_EOSE").await;
    assert_eq!(labels, vec![hex_id(1), "LOCAL_EOSE".into(), "GENERIC_EOSE".into()]);
    assert!(started.elapsed() < h.pool.config().eose_timeout);
}

#[tokio::test(start_paused = true)]
async fn notes_from_both_sources_are_yielded_once() {
    let h = harness(PathStatus::Satisfied);
    let relay = h.relay(RELAY_A, true).await;
    let shared = text_note(1, 100, "both");
    h.store.insert(shared.clone());
    relay.store(shared.clone());
    relay.store(text_note(2, 101, "relay"));

    let mut stream = h
        .manager
        .stream(notes(), options(StreamMode::LocalAndNetworkParallel(None)));
    let labels = labels_until(&mut stream, "GENERIC_EOSE").await;
    let mut ids: Vec<&String> = labels.iter().filter(|label| !label.ends_with("EOSE")).collect();
    ids.sort();
    assert_eq!(ids, vec![&hex_id(1), &hex_id(2)]);
}

#[tokio::test(start_paused = true)]
async fn since_mode_asks_only_for_newer_events() {
    let h = harness(PathStatus::Satisfied);
    let relay = h.relay(RELAY_A, true).await;
    h.store.insert(text_note(1, 10_000, "local"));
    relay.store(text_note(2, 9_000, "old"));
    relay.store(text_note(3, 9_950, "within margin"));

    let mut stream = h.manager.stream(
        notes(),
        options(StreamMode::LocalFirst(Some(NetworkOptimization::Since))),
    );
    let labels = labels_until(&mut stream, "NETWORK_EOSE").await;
    assert_eq!(
        labels,
        vec![
            hex_id(1),
            "LOCAL_EOSE".into(),
            "GENERIC_EOSE".into(),
            hex_id(3),
            "NETWORK_EOSE".into()
        ]
    );
    let filters = req_filters(&relay);
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0]["since"], 9_880);
}

#[tokio::test(start_paused = true)]
async fn negentropy_mode_fetches_only_missing_events_then_follows_live() {
    let h = harness(PathStatus::Satisfied);
    let relay = h.relay(RELAY_A, true).await;
    for n in 1..=20 {
        let note = text_note(n, 1_000 + n, "shared");
        h.store.insert(note.clone());
        relay.store(note);
    }
    relay.store(text_note(30, 2_000, "missing"));
    relay.store(text_note(31, 2_001, "missing"));

    let mut stream = h.manager.stream(
        notes(),
        options(StreamMode::LocalFirst(Some(NetworkOptimization::Negentropy))),
    );
    let labels = labels_until(&mut stream, "NETWORK_EOSE").await;
    let local: Vec<String> = (1..=20).map(hex_id).collect();
    assert_eq!(&labels[..20], local.as_slice());
    assert_eq!(&labels[20..22], &["LOCAL_EOSE".to_string(), "GENERIC_EOSE".to_string()]);
    let mut fetched = labels[22..24].to_vec();
    fetched.sort();
    assert_eq!(fetched, vec![hex_id(30), hex_id(31)]);
    assert_eq!(labels[24], "NETWORK_EOSE");

    assert_eq!(relay.received_of("NEG-OPEN").len(), 1);
    let filters = req_filters(&relay);
    assert_eq!(filters[0]["ids"].as_array().map(Vec::len), Some(2));

    let relay_ref = &relay;
    eventually("the live subscription", || async move {
        req_filters(relay_ref).len() == 2
    })
    .await;
    let live = text_note(40, unix_now() + 60, "live");
    relay.publish(live.clone());
    let next = stream.next().await.map(|item| label(&item));
    assert_eq!(next, Some(live.id));
}

#[tokio::test(start_paused = true)]
async fn negentropy_mode_falls_back_to_req_for_unsupported_relays() {
    let h = harness(PathStatus::Satisfied);
    let relay = h.relay(RELAY_A, true).await;
    relay.set_supports_negentropy(false);
    h.store.insert(text_note(1, 100, "shared"));
    relay.store(text_note(1, 100, "shared"));
    relay.store(text_note(2, 101, "relay only"));
    let mode = StreamMode::LocalFirst(Some(NetworkOptimization::Negentropy));

    let mut stream = h.manager.stream(notes(), options(mode));
    let labels = labels_until(&mut stream, "NETWORK_EOSE").await;
    assert_eq!(
        labels,
        vec![
            hex_id(1),
            "LOCAL_EOSE".into(),
            "GENERIC_EOSE".into(),
            hex_id(2),
            "NETWORK_EOSE".into()
        ]
    );
    assert!(
        h.manager
            .negentropy()
            .support()
            .is_unsupported(&relay_url(RELAY_A))
            .await
    );
    drop(stream);

    // Known-unsupported relays are not asked again.
    let mut again = h.manager.stream(notes(), options(mode));
    labels_until(&mut again, "NETWORK_EOSE").await;
    assert_eq!(relay.received_of("NEG-OPEN").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn local_restart_after_closure_does_not_repeat_notes() {
    let h = harness(PathStatus::Satisfied);
    h.store.insert(text_note(1, 100, "first"));

    let mut stream = h.manager.stream(notes(), options(StreamMode::LocalOnly));
    let labels = labels_until(&mut stream, "GENERIC_EOSE").await;
    assert_eq!(labels, vec![hex_id(1), "LOCAL_EOSE".into(), "GENERIC_EOSE".into()]);

    h.store.close();
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.store.insert(text_note(2, 101, "second"));
    h.store.reopen();

    let next = stream.next().await.map(|item| label(&item));
    assert_eq!(next, Some(hex_id(2)));
}

#[tokio::test(start_paused = true)]
async fn timed_stream_ends_at_the_deadline() {
    let h = harness(PathStatus::Satisfied);
    h.store.insert(text_note(1, 100, "first"));

    let started = Instant::now();
    let notes: Vec<NoteLender> = h
        .manager
        .timed_stream(notes(), Duration::from_secs(2), options(StreamMode::LocalOnly))
        .collect()
        .await;
    assert_eq!(notes.len(), 1);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn lookup_note_prefers_the_local_database() {
    let h = harness(PathStatus::Satisfied);
    let key = h.store.insert(text_note(1, 100, "stored"));

    let found = h.manager.lookup_note(&hex_id(1), None).await.unwrap();
    assert_eq!(found.and_then(|note| note.key()), Some(key));
}

#[tokio::test(start_paused = true)]
async fn lookup_note_uses_and_releases_ephemeral_relays() {
    let h = harness(PathStatus::Satisfied);
    let remote = h.connector.add_relay(RELAY_B);
    remote.store(text_note(9, 100, "remote"));

    let found = h
        .manager
        .lookup_note(&hex_id(9), Some(vec![relay_url(RELAY_B)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.to_owned_event().unwrap().map(|event| event.id), Some(hex_id(9)));
    assert!(h.pool.all_relays().await.is_empty());
    assert_eq!(h.manager.relays_that_saw(&hex_id(9)).await, vec![relay_url(RELAY_B)]);
}

#[tokio::test(start_paused = true)]
async fn lookup_address_follows_outbox_hints() {
    let h = harness(PathStatus::Satisfied);
    let author = pubkey(1);
    let mut relay_list = event(50, nostr::KIND_RELAY_LIST, 10, &author);
    relay_list.tags = vec![vec!["r".to_string(), RELAY_B.to_string()]];
    h.store.insert(relay_list);

    let remote = h.connector.add_relay(RELAY_B);
    for (n, created_at) in [(1, 100), (2, 200)] {
        let mut post = event(n, 30_023, created_at, &author);
        post.tags = vec![vec!["d".to_string(), "post".to_string()]];
        remote.store(post);
    }

    let address = EventAddress::new(30_023, author, "post");
    let found = h.manager.lookup_address(&address).await.unwrap().unwrap();
    let created_at = found.with_borrowed(|event| event.created_at).unwrap();
    assert_eq!(created_at, Some(200));
    assert_eq!(remote.received_of("REQ").len(), 1);
    assert!(h.pool.relay(&relay_url(RELAY_B)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn find_event_reports_the_kind_of_result() {
    let h = harness(PathStatus::Unsatisfied);
    let alice = pubkey(1);
    let key = h.store.insert(event(5, KIND_METADATA, 100, &alice));

    let found = h
        .manager
        .find_event(FindEvent::Profile(alice.clone()))
        .await
        .unwrap();
    match found {
        Some(FoundEvent::Profile { pubkey, note }) => {
            assert_eq!(pubkey, alice);
            assert_eq!(note.key(), Some(key));
        }
        other => panic!("expected a profile, got {other:?}"),
    }

    let missing = h
        .manager
        .find_event(FindEvent::Event(hex_id(77)))
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test(start_paused = true)]
async fn query_collects_owned_events() {
    let h = harness(PathStatus::Unsatisfied);
    h.store.insert(text_note(1, 100, "one"));
    h.store.insert(text_note(2, 101, "two"));

    let events = h
        .manager
        .query(notes(), options(StreamMode::LocalOnly))
        .await
        .unwrap();
    let contents: Vec<&str> = events.iter().map(|event| event.content.as_str()).collect();
    assert_eq!(contents, vec!["one", "two"]);
}

#[derive(Default)]
struct RecordingOutbox {
    recorded: StdMutex<Vec<String>>,
}

#[async_trait]
impl OutboxRelayHintProvider for RecordingOutbox {
    async fn relay_urls(
        &self,
        _pubkeys: &[String],
    ) -> std::collections::HashMap<String, Vec<RelayUrl>> {
        std::collections::HashMap::new()
    }

    async fn record_relay_list_event(&self, event: &Event) {
        self.recorded.lock().unwrap().push(event.id.clone());
    }

    async fn invalidate(&self, _pubkeys: &[String]) {}
}

#[tokio::test(start_paused = true)]
async fn relay_lists_reach_the_outbox_while_started() {
    let outbox = Arc::new(RecordingOutbox::default());
    let h = harness_with_outbox(PathStatus::Satisfied, Some(outbox.clone()));

    h.manager.start().await;
    h.manager.start().await;
    h.store.insert(event(1, nostr::KIND_RELAY_LIST, 100, &pubkey(1)));
    let outbox_ref = &outbox;
    eventually("the relay list to be recorded", || async move {
        outbox_ref.recorded.lock().unwrap().len() == 1
    })
    .await;

    h.manager.stop().await;
    h.manager.stop().await;
    h.store.insert(event(2, nostr::KIND_RELAY_LIST, 100, &pubkey(2)));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(*outbox.recorded.lock().unwrap(), vec![hex_id(1)]);
}

#[tokio::test(start_paused = true)]
async fn preload_strategy_fetches_author_metadata() {
    let h = harness(PathStatus::Satisfied);
    let relay = h.relay(RELAY_A, true).await;
    h.store.insert(text_note(1, 100, "by pubkey 1"));
    h.manager.start().await;

    let mut stream = h.manager.stream(
        notes(),
        StreamOptions {
            mode: StreamMode::LocalOnly,
            preload: PreloadStrategy::Preload,
            ..StreamOptions::default()
        },
    );
    labels_until(&mut stream, "GENERIC_EOSE").await;

    let relay_ref = &relay;
    eventually("a metadata request", || async move {
        !req_filters(relay_ref).is_empty()
    })
    .await;
    let filter = &req_filters(&relay)[0];
    assert_eq!(filter["kinds"], serde_json::json!([KIND_METADATA]));
    assert_eq!(filter["authors"], serde_json::json!([pubkey(1)]));
    h.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn preloading_happens_before_the_next_note() {
    let h = harness(PathStatus::Satisfied);
    h.store.insert(text_note(1, 100, "by pubkey 1"));

    let mut stream = h.manager.stream(
        notes(),
        StreamOptions {
            mode: StreamMode::LocalOnly,
            preload: PreloadStrategy::Preload,
            ..StreamOptions::default()
        },
    );
    labels_until(&mut stream, "LOCAL_EOSE").await;
    assert_eq!(h.manager.preloader().queued().await, 1);
}

#[tokio::test(start_paused = true)]
async fn relay_targeted_streams_skip_notes_from_other_relays() {
    let h = harness(PathStatus::Satisfied);
    let (a, b) = (relay_url(RELAY_A), relay_url(RELAY_B));
    h.store.process_event(&a, &text_note(1, 100, "from a")).unwrap();
    h.store.process_event(&b, &text_note(2, 101, "from b")).unwrap();
    h.store.insert(text_note(3, 102, "written locally"));

    let mut stream = h.manager.stream(
        notes(),
        StreamOptions {
            to: Some(vec![a]),
            mode: StreamMode::LocalOnly,
            ..StreamOptions::default()
        },
    );
    let labels = labels_until(&mut stream, "GENERIC_EOSE").await;
    assert_eq!(labels, vec![hex_id(1), "LOCAL_EOSE".into(), "GENERIC_EOSE".into()]);

    let mut untargeted = h.manager.stream(notes(), options(StreamMode::LocalOnly));
    let labels = labels_until(&mut untargeted, "GENERIC_EOSE").await;
    assert_eq!(labels.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_req_stream_unregisters_its_subscription() {
    let h = harness(PathStatus::Satisfied);
    let relay = h.relay(RELAY_A, true).await;

    let mut stream = h.manager.stream(notes(), options(StreamMode::LocalFirst(None)));
    labels_until(&mut stream, "NETWORK_EOSE").await;
    assert_eq!(h.pool.subscription_ids().await.len(), 1);
    drop(stream);

    let pool = &h.pool;
    eventually("the pool subscription to go", || async move {
        pool.subscription_ids().await.is_empty()
    })
    .await;
    let relay = &relay;
    eventually("CLOSE to reach the relay", || async move {
        relay.open_subscriptions() == 0
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn dropping_a_negentropy_stream_closes_the_session() {
    let h = harness(PathStatus::Satisfied);
    let relay = h.relay(RELAY_A, true).await;
    relay.set_negentropy_silent(true);
    h.store.insert(text_note(1, 100, "local"));

    let mut stream = h.manager.stream(
        notes(),
        options(StreamMode::LocalFirst(Some(NetworkOptimization::Negentropy))),
    );
    labels_until(&mut stream, "GENERIC_EOSE").await;
    let relay_ref = &relay;
    eventually("NEG-OPEN to reach the relay", || async move {
        relay_ref.received_of("NEG-OPEN").len() == 1
    })
    .await;
    assert!(!h.pool.subscription_ids().await.is_empty());
    drop(stream);

    let pool = &h.pool;
    eventually("the session handler to go", || async move {
        pool.subscription_ids().await.is_empty()
    })
    .await;
    eventually("NEG-CLOSE to reach the relay", || async move {
        relay_ref.received_of("NEG-CLOSE").len() == 1
    })
    .await;
}

#[test]
fn recent_ids_forget_the_oldest_past_capacity() {
    let mut ids = RecentIds::new(2);
    assert!(ids.insert("a"));
    assert!(ids.insert("b"));
    assert!(!ids.insert("a"));
    assert!(ids.insert("c"));
    // "a" was evicted to make room for "c".
    assert!(ids.insert("a"));
    assert!(!ids.insert("c"));
}

//! End-to-end engine tests against in-memory capabilities
//!
//! The transport, store and mirror are fakes; site resolution, JSON parsing,
//! the coordinator, merger, cache and scheduler are the real implementations.
//!
//! Run with: cargo test --test sync_engine_tests

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use tokio::sync::mpsc::UnboundedReceiver;

use threadwatch::config::{CacheConfig, SiteConfig, SourceKind};
use threadwatch::error::{ErrorKind, MirrorError, StoreError, TransportError};
use threadwatch::parser::JsonPayloadParser;
use threadwatch::sites::SiteRegistry;
use threadwatch::sync::{
    BackoffTables, ChannelListener, ContentDescriptor, EngineSettings, FetchCoordinator,
    FetchResult, MaterializedThread, MirrorLookup, Post, PostCache, PostNo, PostStore,
    RequestOutcome, SyncEvent, SyncService, ThreadDescriptor, Transport, TransportResponse,
};

// =============================================================================
// Fakes
// =============================================================================

enum Reply {
    Thread(Vec<u64>),
    Status(u16),
    Timeout,
}

/// Serves scripted replies in order; hangs once the script runs out
#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// JSON body of thread 1 containing `numbers`
fn thread_body(numbers: &[u64]) -> Vec<u8> {
    let posts: Vec<serde_json::Value> = numbers
        .iter()
        .map(|&no| {
            serde_json::json!({
                "no": no,
                "resto": if no == 1 { 0 } else { 1 },
                "time": 1_700_000_000 + no as i64,
                "com": format!("post {}", no),
                "replies": numbers.len() - 1,
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({ "posts": posts })).unwrap()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, _url: &str) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Thread(numbers)) => Ok(TransportResponse {
                status: StatusCode::OK,
                body: thread_body(&numbers),
            }),
            Some(Reply::Status(code)) => Ok(TransportResponse {
                status: StatusCode::from_u16(code).unwrap(),
                body: Vec::new(),
            }),
            Some(Reply::Timeout) => Err(TransportError::Timeout),
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    posts: Mutex<HashMap<ContentDescriptor, Vec<Post>>>,
    /// Reject writes while keeping what is already stored
    read_only: AtomicBool,
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn persist_posts(
        &self,
        descriptor: &ContentDescriptor,
        posts: &[Post],
    ) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        let mut map = self.posts.lock().unwrap();
        let stored = map.entry(descriptor.clone()).or_default();
        for post in posts {
            stored.retain(|p| p.no != post.no);
            stored.push(post.clone());
        }
        stored.sort_by_key(|p| p.no);
        Ok(())
    }

    async fn load_posts(&self, descriptor: &ContentDescriptor) -> Result<Vec<Post>, StoreError> {
        Ok(self
            .posts
            .lock()
            .unwrap()
            .get(descriptor)
            .cloned()
            .unwrap_or_default())
    }
}

/// Mirror that still has every post it was seeded with
#[derive(Default)]
struct ArchiveMirror {
    posts: Mutex<Vec<Post>>,
    fail: bool,
}

#[async_trait]
impl MirrorLookup for ArchiveMirror {
    fn covers(&self, thread: &ThreadDescriptor) -> bool {
        thread.site == "alpha"
    }

    async fn lookup_posts(
        &self,
        _thread: &ThreadDescriptor,
        known: &BTreeSet<PostNo>,
    ) -> Result<Vec<Post>, MirrorError> {
        if self.fail {
            return Err(MirrorError("archive offline".into()));
        }
        Ok(self
            .posts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !known.contains(&p.no))
            .cloned()
            .collect())
    }
}

struct Harness {
    service: SyncService,
    transport: Arc<ScriptedTransport>,
    store: Arc<MemoryStore>,
}

fn sites() -> Vec<SiteConfig> {
    vec![
        SiteConfig {
            name: "alpha".into(),
            kind: SourceKind::Live,
            catalog_url: "http://alpha.test/{board}/catalog.json".into(),
            thread_url: "http://alpha.test/{board}/thread/{thread}.json".into(),
        },
        SiteConfig {
            name: "vault".into(),
            kind: SourceKind::Archive,
            catalog_url: "http://vault.test/{board}/".into(),
            thread_url: "http://vault.test/{board}/{thread}".into(),
        },
    ]
}

fn harness(replies: Vec<Reply>, mirror: Option<Arc<ArchiveMirror>>) -> Harness {
    let transport = ScriptedTransport::new(replies);
    let store = Arc::new(MemoryStore::default());

    let mut coordinator = FetchCoordinator::new(
        Arc::new(SiteRegistry::new(&sites())),
        transport.clone(),
        Arc::new(JsonPayloadParser),
        store.clone(),
    );
    if let Some(mirror) = mirror {
        coordinator = coordinator.with_mirror(mirror);
    }

    let service = SyncService::new(
        coordinator,
        PostCache::spawn(&CacheConfig::default()),
        BackoffTables::default(),
        EngineSettings::default(),
    );

    Harness {
        service,
        transport,
        store,
    }
}

fn thread() -> ContentDescriptor {
    ContentDescriptor::thread("alpha", "g", 1)
}

async fn next_data(events: &mut UnboundedReceiver<SyncEvent>) -> Arc<MaterializedThread> {
    match events.recv().await {
        Some(SyncEvent::Data(thread)) => thread,
        other => panic!("expected data, got {:?}", other),
    }
}

fn numbers(thread: &MaterializedThread) -> Vec<u64> {
    thread.posts.iter().map(|p| p.no.no).collect()
}

fn deleted(thread: &MaterializedThread) -> Vec<u64> {
    thread.deleted_posts().map(|p| p.no.no).collect()
}

// =============================================================================
// Reconciliation Across Polls
// =============================================================================

#[tokio::test]
async fn test_vanished_post_is_kept_as_deleted() {
    let h = harness(
        vec![Reply::Thread(vec![1, 2, 3]), Reply::Thread(vec![1, 2, 4])],
        None,
    );
    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    let first = next_data(&mut events).await;
    assert_eq!(numbers(&first), vec![1, 2, 3]);
    assert!(deleted(&first).is_empty());

    engine.request_data(true).await;
    let second = next_data(&mut events).await;
    assert_eq!(numbers(&second), vec![1, 2, 3, 4]);
    assert_eq!(deleted(&second), vec![3]);
}

#[tokio::test]
async fn test_mirror_fills_in_vanished_post() {
    let mirror = Arc::new(ArchiveMirror::default());
    let h = harness(
        vec![Reply::Thread(vec![1, 2, 3]), Reply::Thread(vec![1, 2, 4])],
        Some(mirror.clone()),
    );
    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    next_data(&mut events).await;

    mirror
        .posts
        .lock()
        .unwrap()
        .push(Post::new(1, 3).with_comment("archived"));
    engine.request_data(true).await;
    let second = next_data(&mut events).await;

    assert_eq!(numbers(&second), vec![1, 2, 3, 4]);
    assert!(deleted(&second).is_empty());
    let recovered = second.find(PostNo::new(3)).unwrap();
    assert_eq!(recovered.comment, "archived");
}

#[tokio::test]
async fn test_mirror_failure_still_delivers() {
    let mirror = Arc::new(ArchiveMirror {
        fail: true,
        ..Default::default()
    });
    let h = harness(
        vec![Reply::Thread(vec![1, 2, 3]), Reply::Thread(vec![1, 2])],
        Some(mirror),
    );
    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    next_data(&mut events).await;
    engine.request_data(true).await;

    let second = next_data(&mut events).await;
    assert_eq!(deleted(&second), vec![3]);
}

#[tokio::test]
async fn test_reply_links_are_built() {
    let h = harness(vec![], None);
    let body = serde_json::json!({
        "posts": [
            {"no": 1, "resto": 0, "time": 1700000000, "com": "op"},
            {"no": 2, "resto": 1, "time": 1700000001, "com": ">>1 hello"},
            {"no": 3, "resto": 1, "time": 1700000002, "com": ">>1 >>2 >>99"}
        ]
    });
    let store_copy: Vec<Post> = {
        use threadwatch::sync::{PayloadMode, PayloadParser};
        JsonPayloadParser
            .parse(&serde_json::to_vec(&body).unwrap(), PayloadMode::Thread)
            .unwrap()
    };
    h.store.persist_posts(&thread(), &store_copy).await.unwrap();
    h.transport.push(Reply::Timeout);

    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();
    engine.request_data(false).await;

    let view = next_data(&mut events).await;
    assert_eq!(view.find(PostNo::new(1)).unwrap().reply_from, vec![2, 3]);
    assert_eq!(view.find(PostNo::new(2)).unwrap().reply_from, vec![3]);
    assert_eq!(view.post_count(), 3);
}

// =============================================================================
// Fallbacks
// =============================================================================

#[tokio::test]
async fn test_timeout_serves_stored_copy() {
    let h = harness(vec![Reply::Timeout], None);
    let stored: Vec<Post> = (1..=10).map(|no| Post::new(1, no)).collect();
    h.store.persist_posts(&thread(), &stored).await.unwrap();

    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();
    engine.request_data(false).await;

    let view = next_data(&mut events).await;
    assert_eq!(view.post_count(), 10);
    assert_eq!(
        view.last_result,
        FetchResult::LoadedFromStore {
            deleted_on_server: false
        }
    );
    assert!(!view.deleted);
}

#[tokio::test]
async fn test_outage_over_lagging_store_flags_nothing() {
    let h = harness(vec![Reply::Thread(vec![1, 2, 3]), Reply::Timeout], None);
    h.store
        .persist_posts(&thread(), &[Post::new(1, 1), Post::new(1, 2)])
        .await
        .unwrap();
    h.store.read_only.store(true, Ordering::SeqCst);

    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    let live = next_data(&mut events).await;
    assert_eq!(numbers(&live), vec![1, 2, 3]);

    // The store never saw post 3; the outage must not make it look deleted
    engine.request_data(true).await;
    let offline = next_data(&mut events).await;
    assert_eq!(
        offline.last_result,
        FetchResult::LoadedFromStore {
            deleted_on_server: false
        }
    );
    assert_eq!(numbers(&offline), vec![1, 2, 3]);
    assert!(deleted(&offline).is_empty());
    assert!(!offline.deleted);
}

#[tokio::test]
async fn test_outage_keeps_op_aggregates() {
    let h = harness(vec![Reply::Thread(vec![1, 2, 3]), Reply::Timeout], None);
    h.store.persist_posts(&thread(), &[Post::new(1, 1)]).await.unwrap();
    h.store.read_only.store(true, Ordering::SeqCst);

    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    next_data(&mut events).await;
    engine.request_data(true).await;
    let offline = next_data(&mut events).await;

    let reply_count = offline
        .original_post()
        .and_then(|op| op.aggregates.as_ref())
        .map(|a| a.reply_count);
    assert_eq!(reply_count, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_not_found_marks_thread_deleted_and_stops_polling() {
    let h = harness(vec![Reply::Thread(vec![1, 2]), Reply::Status(404)], None);
    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    let live = next_data(&mut events).await;
    assert!(!live.deleted);

    // The auto-poll timer fetches again and gets a 404
    let gone = next_data(&mut events).await;
    assert!(gone.deleted);
    assert!(gone.last_result.is_deleted_on_server());
    assert_eq!(numbers(&gone), vec![1, 2]);
    assert!(gone.original_post().unwrap().flags.deleted);

    // No timer is armed for a deleted thread
    tokio::time::sleep(Duration::from_secs(7200)).await;
    assert_eq!(h.transport.calls(), 2);
}

#[tokio::test]
async fn test_not_found_without_copy_reports_error() {
    let h = harness(vec![Reply::Status(404)], None);
    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;

    match events.recv().await {
        Some(SyncEvent::Error { kind, message }) => {
            assert_eq!(kind, ErrorKind::Server);
            assert!(message.contains("404"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_site_disables_engine() {
    let h = harness(vec![], None);
    let engine = h
        .service
        .engine(ContentDescriptor::thread("nowhere", "g", 1))
        .await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    match events.recv().await {
        Some(SyncEvent::Error { kind, .. }) => assert_eq!(kind, ErrorKind::Configuration),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(engine.request_data(false).await, RequestOutcome::Disabled);
    assert_eq!(h.transport.calls(), 0);
}

// =============================================================================
// Registry and Cache
// =============================================================================

#[tokio::test]
async fn test_one_engine_per_descriptor() {
    let h = harness(vec![], None);

    let a = h.service.engine(thread()).await;
    let b = h.service.engine(thread()).await;
    let other = h.service.engine(ContentDescriptor::thread("alpha", "g", 2)).await;

    assert_eq!(a.request_data(false).await, RequestOutcome::Started);
    assert_eq!(b.request_data(false).await, RequestOutcome::AlreadyInFlight);
    assert_eq!(other.request_data(false).await, RequestOutcome::Started);
    assert_eq!(h.service.active_engines().await, 2);
}

#[tokio::test]
async fn test_new_engine_is_seeded_from_cache() {
    let h = harness(
        vec![Reply::Thread(vec![1, 2, 3]), Reply::Thread(vec![1, 3])],
        None,
    );

    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();
    engine.request_data(false).await;
    next_data(&mut events).await;

    assert!(h.service.release(&thread()).await);
    assert!(!engine.is_running());
    assert_eq!(
        h.service
            .cache()
            .thread_posts(thread().as_thread().unwrap())
            .await
            .unwrap()
            .len(),
        3
    );

    let fresh_engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    fresh_engine.add_listener(listener).await.unwrap();
    fresh_engine.request_data(false).await;

    let view = next_data(&mut events).await;
    assert_eq!(numbers(&view), vec![1, 2, 3]);
    assert_eq!(deleted(&view), vec![2]);
}

#[tokio::test]
async fn test_op_aggregates_follow_latest_fetch() {
    let h = harness(
        vec![Reply::Thread(vec![1, 2]), Reply::Thread(vec![1, 2, 3, 4])],
        None,
    );
    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    let first = next_data(&mut events).await;
    let reply_count = |view: &MaterializedThread| {
        view.original_post()
            .and_then(|op| op.aggregates.as_ref())
            .map(|a| a.reply_count)
    };
    assert_eq!(reply_count(&first), Some(1));

    engine.request_data(true).await;
    let second = next_data(&mut events).await;
    assert_eq!(reply_count(&second), Some(3));
}

// =============================================================================
// Polling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_quiet_thread_backs_off() {
    let h = harness(
        vec![
            Reply::Thread(vec![1, 2]),
            Reply::Thread(vec![1, 2]),
            Reply::Thread(vec![1, 2]),
        ],
        None,
    );
    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    next_data(&mut events).await;
    let first_wait = engine.time_until_next_poll().await;

    next_data(&mut events).await;
    let second_wait = engine.time_until_next_poll().await;

    next_data(&mut events).await;
    let third_wait = engine.time_until_next_poll().await;

    assert!(first_wait <= Duration::from_secs(15));
    assert!(second_wait > first_wait);
    assert!(third_wait > second_wait);
}

#[tokio::test(start_paused = true)]
async fn test_catalog_is_not_auto_polled() {
    let h = harness(vec![Reply::Thread(vec![1])], None);
    let catalog = ContentDescriptor::catalog("alpha", "g");
    let engine = h.service.engine(catalog).await;
    let (listener, mut events) = ChannelListener::new();
    engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    next_data(&mut events).await;

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_removing_last_listener_stops_polling() {
    let h = harness(vec![Reply::Thread(vec![1]), Reply::Thread(vec![1, 2])], None);
    let engine = h.service.engine(thread()).await;
    let (listener, mut events) = ChannelListener::new();
    let id = engine.add_listener(listener).await.unwrap();

    engine.request_data(false).await;
    next_data(&mut events).await;
    assert!(engine.remove_listener(id).await);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.transport.calls(), 1);
}

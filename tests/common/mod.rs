//! Test helpers for the relay integration tests.
//!
//! Provides scripted fakes for the feed source, the delivery channel and the
//! media fetcher, plus a relay wired to them.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use rss_relay::{
    Config, DeliveryChannel, FeedRelay, FeedSource, FetchedMedia, Item, MediaFetcher, MediaHandle,
    MediaKind, MediaSource, MemoryStore, OutgoingText, RelayError, Result, Store, SubscriberId,
};

/// Poll interval used by the test configuration.
pub const INTERVAL: Duration = Duration::from_secs(60);

/// Backoff cooldown of steady-state pollers in the test configuration.
pub const POLL_COOLDOWN: Duration = Duration::from_secs(20);

/// Backoff cooldown of freshly subscribed feeds in the test configuration.
pub const SUBSCRIBE_COOLDOWN: Duration = Duration::from_secs(10);

/// Configuration with short, predictable timings and no log file.
pub fn test_config() -> Config {
    let mut config = Config::parse(
        r#"
[poll]
interval_secs = 60
backoff_cooldown_secs = 20
retry_budget = 3
stagger_window = 10
stagger_unit_ms = 500
max_concurrent_fetches = 4
shutdown_grace_secs = 1

[subscribe]
timeout_secs = 5
attempts = 1
backoff_cooldown_secs = 10
retry_budget = 3

[store]
in_memory = true

[logging]
file = ""
"#,
    )
    .unwrap();
    config.startup.notify_subscribers = false;
    config
}

/// Scripted answer of [`FakeSource`].
#[derive(Debug, Clone)]
pub enum Response {
    Items(Vec<Item>),
    Transient,
    Permanent,
}

/// Items with the given ids, newest first.
pub fn items(ids: &[&str]) -> Vec<Item> {
    ids.iter()
        .map(|id| Item::new(*id, format!("Item {id}")).with_link(format!("https://example.com/{id}")))
        .collect()
}

/// Feed source answering from per-URL scripts.
///
/// Queued responses are consumed in order; the last one repeats forever.
#[derive(Default)]
pub struct FakeSource {
    scripts: Mutex<HashMap<String, VecDeque<Response>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the script of `url` with a single repeating response.
    pub fn set(&self, url: &str, response: Response) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.insert(url.to_string(), VecDeque::from([response]));
    }

    /// Append a response to the script of `url`.
    pub fn push(&self, url: &str, response: Response) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(url.to_string()).or_default().push_back(response);
    }

    /// Number of fetches of `url` so far.
    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FeedSource for FakeSource {
    async fn fetch(&self, url: &str) -> Result<Vec<Item>> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let response = {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.entry(url.to_string()).or_default();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match response {
            Some(Response::Items(items)) => Ok(items),
            Some(Response::Transient) | None => {
                Err(RelayError::FetchTransient(format!("connection reset by {url}")))
            }
            Some(Response::Permanent) => Err(RelayError::FetchPermanent(format!(
                "{url} is not a feed"
            ))),
        }
    }
}

/// One delivery recorded by [`RecordingChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text {
        to: SubscriberId,
        text: String,
        preview: bool,
    },
    Upload {
        to: SubscriberId,
        file_name: String,
        kind: MediaKind,
        handle: MediaHandle,
    },
    Reuse {
        to: SubscriberId,
        handle: MediaHandle,
        kind: MediaKind,
    },
}

impl Sent {
    pub fn to(&self) -> &SubscriberId {
        match self {
            Sent::Text { to, .. } | Sent::Upload { to, .. } | Sent::Reuse { to, .. } => to,
        }
    }
}

/// Delivery channel that records everything it is asked to send.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<Sent>>,
    uploads: AtomicUsize,
    blocked: Mutex<Vec<SubscriberId>>,
    reject_uploads: Mutex<bool>,
    reject_previews: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Texts delivered to `to`, in order.
    pub fn texts_to(&self, to: &SubscriberId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Text { to: t, text, .. } if &t == to => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Every later send to `to` fails permanently.
    pub fn block(&self, to: &SubscriberId) {
        self.blocked.lock().unwrap().push(to.clone());
    }

    /// Every later upload fails permanently.
    pub fn reject_uploads(&self) {
        *self.reject_uploads.lock().unwrap() = true;
    }

    /// Every later text sent with a link preview fails permanently.
    pub fn reject_previews(&self) {
        self.reject_previews.store(true, Ordering::SeqCst);
    }

    fn check(&self, to: &SubscriberId) -> Result<()> {
        if self.blocked.lock().unwrap().contains(to) {
            return Err(RelayError::DeliveryPermanent(format!("{to} blocked the bot")));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    async fn send_text(&self, to: &SubscriberId, message: &OutgoingText) -> Result<()> {
        self.check(to)?;
        if message.link_preview && self.reject_previews.load(Ordering::SeqCst) {
            return Err(RelayError::DeliveryPermanent(format!("{to} blocked the bot")));
        }
        self.sent.lock().unwrap().push(Sent::Text {
            to: to.clone(),
            text: message.text.clone(),
            preview: message.link_preview,
        });
        Ok(())
    }

    async fn send_media(
        &self,
        to: &SubscriberId,
        media: MediaSource,
        kind: MediaKind,
    ) -> Result<MediaHandle> {
        self.check(to)?;
        match media {
            MediaSource::Upload { file_name, .. } => {
                if *self.reject_uploads.lock().unwrap() {
                    return Err(RelayError::DeliveryPermanent("file rejected".to_string()));
                }
                let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
                let handle = MediaHandle(format!("file-{n}"));
                self.sent.lock().unwrap().push(Sent::Upload {
                    to: to.clone(),
                    file_name,
                    kind,
                    handle: handle.clone(),
                });
                Ok(handle)
            }
            MediaSource::Handle(handle) => {
                self.sent.lock().unwrap().push(Sent::Reuse {
                    to: to.clone(),
                    handle: handle.clone(),
                    kind,
                });
                Ok(handle)
            }
        }
    }
}

/// Media fetcher serving still images, except for URLs marked broken.
#[derive(Default)]
pub struct FakeMedia {
    calls: Mutex<HashMap<String, usize>>,
    broken: Mutex<Vec<String>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn break_url(&self, url: &str) {
        self.broken.lock().unwrap().push(url.to_string());
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MediaFetcher for FakeMedia {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        if self.broken.lock().unwrap().iter().any(|u| u == url) {
            return Err(RelayError::MediaUnavailable(format!("HTTP 404 from {url}")));
        }
        let kind = if url.ends_with(".gif") {
            MediaKind::Animated
        } else {
            MediaKind::Still
        };
        Ok(FetchedMedia {
            bytes: vec![0u8; 16],
            kind,
            file_name: rss_relay::media::file_name(url),
        })
    }
}

/// Store wrapper whose writes or deletes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RelayError::StoreUnavailable("disk full".to_string()));
        }
        self.inner.set_all(entries).await
    }

    async fn delete_all(&self, keys: &[String]) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RelayError::StoreUnavailable("database is locked".to_string()));
        }
        self.inner.delete_all(keys).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        self.inner.scan_prefix(prefix).await
    }
}

/// A relay and the fakes behind it.
pub struct Harness {
    pub relay: FeedRelay,
    pub store: Arc<dyn Store>,
    pub source: Arc<FakeSource>,
    pub channel: Arc<RecordingChannel>,
    pub media: Arc<FakeMedia>,
}

impl Harness {
    /// Relay over a fresh in-memory store.
    pub async fn new(config: Config) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()), FakeSource::new()).await
    }

    /// Relay over an existing store and source.
    pub async fn with_store(config: Config, store: Arc<dyn Store>, source: Arc<FakeSource>) -> Self {
        let channel = RecordingChannel::new();
        let media = FakeMedia::new();
        let relay = FeedRelay::new(
            config,
            store.clone(),
            source.clone(),
            channel.clone(),
            media.clone(),
        )
        .await
        .unwrap();
        Self {
            relay,
            store,
            source,
            channel,
            media,
        }
    }
}

/// Let spawned tasks and due timers run, moving the paused clock by 1ms.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Move the paused clock forward by `duration`, running timers on the way.
pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}

pub fn subscriber(id: &str) -> SubscriberId {
    SubscriberId::new(id)
}

/// Write a feed with its subscribers straight into `store`.
pub async fn seed_feed(
    store: &dyn Store,
    url: &str,
    subscribers: &[&SubscriberId],
    last_seen: Option<&str>,
) {
    use rss_relay::store::keys;

    let mut entries = BTreeMap::new();
    entries.insert(keys::feed(url), keys::PRESENT.to_string());
    for subscriber in subscribers {
        entries.insert(keys::feed_subscriber(url, subscriber), keys::PRESENT.to_string());
        entries.insert(keys::subscriber_feed(subscriber, url), keys::PRESENT.to_string());
    }
    if let Some(id) = last_seen {
        entries.insert(keys::last_seen(url), id.to_string());
    }
    store.set_all(&entries).await.unwrap();
}

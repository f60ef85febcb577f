//! Tests of the poll scheduler: fetch concurrency and poller supervision.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use common::{items, seed_feed, settle, subscriber, test_config, FakeMedia, RecordingChannel};
use rss_relay::{
    Dispatcher, FeedSource, Item, MemoryStore, PollScheduler, Result, Store, SubscriptionRegistry,
    Unsubscribe,
};

/// Feed source that holds every fetch until released, counting fetches in flight.
struct GatedSource {
    gate: Semaphore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Default for GatedSource {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::default(),
            peak: AtomicUsize::default(),
            calls: AtomicUsize::default(),
        }
    }
}

impl GatedSource {
    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for GatedSource {
    async fn fetch(&self, _url: &str) -> Result<Vec<Item>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.gate.acquire().await.unwrap().forget();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(items(&["1"]))
    }
}

/// Give pollers woken by a release time to reach their next fetch or sleep.
async fn settle_all() {
    for _ in 0..3 {
        settle().await;
    }
}

fn feed(n: usize) -> String {
    format!("https://feed{n}.example.net/rss")
}

/// Scheduler over `store`, fetching from `source` with at most `permits` fetches at once.
async fn scheduler(
    store: Arc<dyn Store>,
    source: Arc<dyn FeedSource>,
    permits: usize,
) -> (Arc<SubscriptionRegistry>, PollScheduler) {
    let registry = Arc::new(SubscriptionRegistry::load(store).await.unwrap());
    let config = test_config();
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        RecordingChannel::new(),
        FakeMedia::new(),
        &config.dispatch,
    ));
    let mut poll = config.poll.clone();
    poll.max_concurrent_fetches = permits;
    // Every poller starts at once.
    poll.stagger_window = 1;
    let scheduler = PollScheduler::new(
        registry.clone(),
        source,
        dispatcher,
        poll,
        config.subscribe.clone(),
    );
    (registry, scheduler)
}

/// No more than `max_concurrent_fetches` fetches run at the same time.
#[tokio::test(start_paused = true)]
async fn test_fetches_bounded_by_permits() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let alice = subscriber("alice");
    for n in 0..5 {
        seed_feed(store.as_ref(), &feed(n), &[&alice], Some("1")).await;
    }
    let source = Arc::new(GatedSource::default());
    let (_registry, scheduler) = scheduler(store, source.clone(), 2).await;

    assert_eq!(scheduler.start_all().await, 5);
    settle_all().await;
    assert_eq!(source.in_flight(), 2);
    assert_eq!(source.calls(), 2);

    source.release(1);
    settle_all().await;
    assert_eq!(source.in_flight(), 2);
    assert_eq!(source.calls(), 3);

    source.release(100);
    settle_all().await;
    assert_eq!(source.calls(), 5);
    assert_eq!(source.in_flight(), 0);
    assert_eq!(source.peak(), 2);
    assert_eq!(scheduler.live_pollers().len(), 5);

    scheduler.shutdown(std::time::Duration::from_secs(1)).await;
    assert!(scheduler.live_pollers().is_empty());
}

/// Stopping the poller of a purged feed leaves the poller of its successor alone.
#[tokio::test(start_paused = true)]
async fn test_stale_stop_spares_new_poller() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let url = feed(0);
    let alice = subscriber("alice");
    let bob = subscriber("bob");
    seed_feed(store.as_ref(), &url, &[&alice], Some("1")).await;
    let source = Arc::new(GatedSource::default());
    source.release(100);
    let (registry, scheduler) = scheduler(store, source.clone(), 2).await;
    assert_eq!(scheduler.start_all().await, 1);
    settle().await;

    // The last subscriber leaves, but the poller is not stopped yet.
    let (outcome, retired) = registry.unsubscribe_retiring(&alice, &url).await.unwrap();
    assert_eq!(
        outcome,
        Unsubscribe::Removed {
            last_subscriber: true
        }
    );
    let retired = retired.unwrap();

    // Meanwhile someone else creates the feed again and gets a new poller.
    registry
        .commit_new_feed(&bob, &url, Some("1".to_string()))
        .await
        .unwrap();
    assert!(scheduler.spawn_validated(&url, Some("1".to_string())).await);

    assert!(!scheduler.stop_poller(&retired));
    settle().await;
    assert!(scheduler.is_polling(&url));
    assert!(registry.poll_state(&url).await.is_some());

    scheduler.shutdown(std::time::Duration::from_secs(1)).await;
}

/// The retired ticket stops the poller it was issued for.
#[tokio::test(start_paused = true)]
async fn test_retired_ticket_stops_its_poller() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let url = feed(0);
    let alice = subscriber("alice");
    seed_feed(store.as_ref(), &url, &[&alice], Some("1")).await;
    let source = Arc::new(GatedSource::default());
    source.release(100);
    let (registry, scheduler) = scheduler(store, source.clone(), 2).await;
    scheduler.start_all().await;
    settle().await;

    let (_, retired) = registry.unsubscribe_retiring(&alice, &url).await.unwrap();
    assert!(scheduler.stop_poller(&retired.unwrap()));
    settle().await;
    assert!(!scheduler.is_polling(&url));
    assert!(scheduler.live_pollers().is_empty());
}

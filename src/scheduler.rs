//! Poll scheduler: spawns and supervises one poller task per feed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PollConfig, SubscribeConfig};
use crate::dispatch::Dispatcher;
use crate::poller::{fetch_with_timeout, FeedPoller, PollerContext, PollerDeps, PollerExit};
use crate::registry::{PollerTicket, SubscriptionRegistry};
use crate::source::FeedSource;
use crate::types::Item;
use crate::Result;

/// Delay before the first fetch of the poller at `index`.
///
/// Always in `[0, window * unit)`. A zero window disables staggering.
pub fn stagger_delay(index: usize, window: u32, unit: Duration) -> Duration {
    if window == 0 {
        return Duration::ZERO;
    }
    let slot = (index % window as usize) as u32;
    unit * slot
}

struct PollerHandle {
    ticket: PollerTicket,
    cancel: CancellationToken,
    task: JoinHandle<PollerExit>,
}

/// Owner of every poller task.
pub struct PollScheduler {
    deps: PollerDeps,
    poll: PollConfig,
    subscribe: SubscribeConfig,
    handles: Mutex<HashMap<String, PollerHandle>>,
    shutdown: CancellationToken,
}

impl PollScheduler {
    /// Create a scheduler. Nothing runs until [`start_all`](Self::start_all) or [`spawn`](Self::spawn).
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        source: Arc<dyn FeedSource>,
        dispatcher: Arc<Dispatcher>,
        poll: PollConfig,
        subscribe: SubscribeConfig,
    ) -> Self {
        let fetch_permits = Arc::new(Semaphore::new(poll.max_concurrent_fetches.max(1)));
        Self {
            deps: PollerDeps {
                registry,
                source,
                dispatcher,
                fetch_permits,
            },
            poll,
            subscribe,
            handles: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start a poller for every known feed, staggered across the window.
    ///
    /// Returns the number of pollers started.
    pub async fn start_all(&self) -> usize {
        let feeds = self.deps.registry.feeds().await;
        let mut started = 0;
        for (index, url) in feeds.into_iter().enumerate() {
            let ctx = PollerContext {
                last_seen: self.deps.registry.last_seen(&url).await,
                first_delay: stagger_delay(
                    index,
                    self.poll.stagger_window,
                    self.poll.stagger_unit(),
                ),
                retry: self.poll.retry_policy(),
                interval: self.poll.interval(),
                index,
                url,
            };
            if self.spawn(ctx).await {
                started += 1;
            }
        }
        info!("Started {} pollers", started);
        started
    }

    /// Fetch a new feed once to validate it before anything is persisted.
    pub async fn validate(&self, url: &str) -> Result<Vec<Item>> {
        fetch_with_timeout(
            self.deps.source.as_ref(),
            url,
            self.subscribe.timeout(),
            self.subscribe.attempts,
        )
        .await
    }

    /// Start the poller of a feed that was just validated.
    ///
    /// The validation fetch set the baseline, so the first poll waits one interval.
    pub async fn spawn_validated(&self, url: &str, baseline: Option<String>) -> bool {
        let index = self.lock_handles().len();
        let ctx = PollerContext {
            url: url.to_string(),
            index,
            last_seen: baseline,
            first_delay: self.poll.interval(),
            retry: self.subscribe.retry_policy(),
            interval: self.poll.interval(),
        };
        self.spawn(ctx).await
    }

    /// Spawn a poller. Returns `false` if the feed is unknown or already polled.
    pub async fn spawn(&self, ctx: PollerContext) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let Some(ticket) = self.deps.registry.claim_poller(&ctx.url).await else {
            debug!("Not spawning a second poller for {}", ctx.url);
            return false;
        };

        let url = ctx.url.clone();
        let cancel = self.shutdown.child_token();
        let poller = FeedPoller::new(ctx, ticket.clone(), self.deps.clone(), cancel.clone());
        let task = tokio::spawn(poller.run());

        let mut handles = self.lock_handles();
        handles.retain(|_, handle| !handle.task.is_finished());
        let handle = PollerHandle {
            ticket,
            cancel,
            task,
        };
        if let Some(previous) = handles.insert(url, handle) {
            previous.cancel.cancel();
        }
        true
    }

    /// Cancel the poller holding `ticket`. Its in-flight pass completes first.
    /// A newer poller for the same URL is left running.
    pub fn stop_poller(&self, ticket: &PollerTicket) -> bool {
        let mut handles = self.lock_handles();
        let owned = handles
            .get(ticket.url())
            .is_some_and(|handle| handle.ticket == *ticket);
        if !owned {
            debug!("Poller for {} was already replaced", ticket.url());
            return false;
        }
        match handles.remove(ticket.url()) {
            Some(handle) => {
                handle.cancel.cancel();
                debug!("Stopping poller for {}", ticket.url());
                true
            }
            None => false,
        }
    }

    /// URLs with a running poller, sorted.
    pub fn live_pollers(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .lock_handles()
            .iter()
            .filter(|(_, handle)| !handle.task.is_finished())
            .map(|(url, _)| url.clone())
            .collect();
        urls.sort();
        urls
    }

    /// Whether a feed has a running poller.
    pub fn is_polling(&self, url: &str) -> bool {
        self.lock_handles()
            .get(url)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Cancel every poller and wait up to `grace` for them to finish.
    /// Pollers still running afterwards are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let handles: Vec<(String, PollerHandle)> = self.lock_handles().drain().collect();
        info!("Stopping {} pollers", handles.len());

        let deadline = tokio::time::Instant::now() + grace;
        for (url, handle) in handles {
            let abort = handle.task.abort_handle();
            if tokio::time::timeout_at(deadline, handle.task).await.is_err() {
                warn!("Poller for {} did not stop in time, aborting", url);
                abort.abort();
            }
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, PollerHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

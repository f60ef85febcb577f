//! Per-feed polling task.
//!
//! One [`FeedPoller`] owns one feed: it waits its initial delay, then loops
//! fetch -> dedup -> dispatch -> persist watermark -> sleep. Failed fetches
//! are retried after a flat cooldown until the retry budget is spent, at
//! which point the feed is purged and the task ends. A purge the store
//! refuses is retried on the same cooldown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dedup::dedup;
use crate::dispatch::Dispatcher;
use crate::registry::{PollerTicket, SubscriptionRegistry};
use crate::source::FeedSource;
use crate::types::PollState;
use crate::Result;

/// Bounded retry with a flat cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures that remove the feed.
    pub budget: u32,
    /// Delay before retrying a failed fetch.
    pub cooldown: Duration,
}

impl RetryPolicy {
    /// Create a policy. A zero budget is treated as one attempt.
    pub fn new(budget: u32, cooldown: Duration) -> Self {
        Self {
            budget: budget.max(1),
            cooldown,
        }
    }
}

/// Everything a poller needs to know about its feed.
#[derive(Debug, Clone)]
pub struct PollerContext {
    /// Feed URL.
    pub url: String,
    /// Position of the feed in the startup order.
    pub index: usize,
    /// Watermark when the poller starts. `None` makes the first fetch a baseline.
    pub last_seen: Option<String>,
    /// Delay before the first fetch.
    pub first_delay: Duration,
    /// Failure handling.
    pub retry: RetryPolicy,
    /// Delay between successful passes.
    pub interval: Duration,
}

/// How a poller ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    /// Stopped through its cancellation token.
    Cancelled,
    /// Retry budget exhausted; the feed was purged.
    Removed,
    /// The feed was purged or claimed by another poller meanwhile.
    Released,
}

/// Shared collaborators of every poller.
#[derive(Clone)]
pub struct PollerDeps {
    /// Feed ownership, watermarks and poll states.
    pub registry: Arc<SubscriptionRegistry>,
    /// Where feeds are fetched from.
    pub source: Arc<dyn FeedSource>,
    /// Fan-out of new items.
    pub dispatcher: Arc<Dispatcher>,
    /// Bounds fetches in flight across all pollers.
    pub fetch_permits: Arc<Semaphore>,
}

/// The polling task of one feed.
pub struct FeedPoller {
    ctx: PollerContext,
    ticket: PollerTicket,
    deps: PollerDeps,
    cancel: CancellationToken,
    failures: u32,
    watermark_unsaved: bool,
}

enum Pass {
    Done,
    Released,
}

impl FeedPoller {
    /// Create a poller for the feed claimed by `ticket`.
    pub fn new(
        ctx: PollerContext,
        ticket: PollerTicket,
        deps: PollerDeps,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            ticket,
            deps,
            cancel,
            failures: 0,
            watermark_unsaved: false,
        }
    }

    /// Run until removed, released or cancelled.
    pub async fn run(mut self) -> PollerExit {
        debug!(
            "Poller #{} for {} starts in {:?}",
            self.ctx.index, self.ctx.url, self.ctx.first_delay
        );
        let exit = self.poll_loop().await;
        self.set_state(PollState::Removed).await;
        info!("Poller for {} stopped: {:?}", self.ctx.url, exit);
        exit
    }

    async fn poll_loop(&mut self) -> PollerExit {
        if !self.sleep(self.ctx.first_delay).await {
            return PollerExit::Cancelled;
        }
        if !self.set_state(PollState::Active).await {
            return PollerExit::Released;
        }

        loop {
            let delay = match self.poll_once().await {
                Ok(Pass::Done) => {
                    self.failures = 0;
                    if !self.set_state(PollState::Active).await {
                        return PollerExit::Released;
                    }
                    self.ctx.interval
                }
                Ok(Pass::Released) => return PollerExit::Released,
                Err(PassError::Cancelled) => return PollerExit::Cancelled,
                Err(PassError::Fetch(e)) => {
                    self.failures += 1;
                    if self.failures >= self.ctx.retry.budget {
                        if let Some(exit) = self.retire(&e.to_string()).await {
                            return exit;
                        }
                    } else {
                        warn!(
                            "Fetching {} failed ({}/{}): {}",
                            self.ctx.url,
                            self.failures,
                            self.ctx.retry.budget,
                            e
                        );
                    }
                    if !self.set_state(PollState::Backoff(self.failures)).await {
                        return PollerExit::Released;
                    }
                    self.ctx.retry.cooldown
                }
            };

            if !self.sleep(delay).await {
                return PollerExit::Cancelled;
            }
        }
    }

    /// One fetch -> dedup -> dispatch -> persist pass.
    async fn poll_once(&mut self) -> std::result::Result<Pass, PassError> {
        let items = {
            let _permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PassError::Cancelled),
                permit = self.deps.fetch_permits.acquire() => {
                    permit.map_err(|_| PassError::Cancelled)?
                }
            };
            self.deps
                .source
                .fetch(&self.ctx.url)
                .await
                .map_err(PassError::Fetch)?
        };

        let baseline = self.ctx.last_seen.is_none();
        let result = dedup(self.ctx.last_seen.as_deref(), items);
        if baseline {
            debug!("Baseline for {} set to {:?}", self.ctx.url, result.last_seen);
        }

        if !result.new_items.is_empty() {
            let report = self
                .deps
                .dispatcher
                .dispatch(&self.ctx.url, &result.new_items)
                .await;
            debug!("Dispatch report for {}: {:?}", self.ctx.url, report);
        }

        if let Some(id) = result.last_seen {
            let changed = self.ctx.last_seen.as_deref() != Some(id.as_str());
            if changed || self.watermark_unsaved {
                match self.deps.registry.record_last_seen(&self.ticket, &id).await {
                    Ok(true) => self.watermark_unsaved = false,
                    Ok(false) => return Ok(Pass::Released),
                    Err(e) => {
                        // The in-memory watermark still advances; the write is retried next pass.
                        error!("Failed to persist watermark of {}: {}", self.ctx.url, e);
                        self.watermark_unsaved = true;
                    }
                }
            }
            self.ctx.last_seen = Some(id);
        }
        Ok(Pass::Done)
    }

    /// Purge the feed once its retry budget is spent.
    ///
    /// Returns `None` when the purge could not be committed; the poller keeps
    /// its claim and tries again after the next failed fetch.
    async fn retire(&self, reason: &str) -> Option<PollerExit> {
        warn!(
            "Removing feed {} after {} consecutive failures: {}",
            self.ctx.url, self.failures, reason
        );
        match self.deps.registry.retire_feed(&self.ticket).await {
            Ok(true) => Some(PollerExit::Removed),
            Ok(false) => Some(PollerExit::Released),
            Err(e) => {
                error!(
                    "Failed to remove feed {}, retrying in {:?}: {}",
                    self.ctx.url, self.ctx.retry.cooldown, e
                );
                None
            }
        }
    }

    async fn set_state(&self, state: PollState) -> bool {
        self.deps.registry.set_poll_state(&self.ticket, state).await
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

enum PassError {
    Cancelled,
    Fetch(crate::RelayError),
}

/// Run `fetch` against `source` up to `attempts` times, each bounded by `timeout`.
///
/// Permanent errors end the attempts immediately.
pub async fn fetch_with_timeout(
    source: &dyn FeedSource,
    url: &str,
    timeout: Duration,
    attempts: u32,
) -> Result<Vec<crate::types::Item>> {
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, source.fetch(url)).await {
            Ok(Ok(items)) => return Ok(items),
            Ok(Err(e)) if !e.is_transient() => return Err(e),
            Ok(Err(e)) => last_error = Some(e),
            Err(_) => {
                last_error = Some(crate::RelayError::FetchTransient(format!(
                    "no answer from {url} within {}s",
                    timeout.as_secs()
                )))
            }
        }
        debug!("Validation attempt {}/{} for {} failed", attempt, attempts, url);
    }
    Err(last_error
        .unwrap_or_else(|| crate::RelayError::FetchTransient(format!("cannot fetch {url}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Item;
    use crate::RelayError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicUsize,
        fail_first: usize,
        permanent: bool,
        hang: bool,
    }

    #[async_trait]
    impl FeedSource for Scripted {
        async fn fetch(&self, _url: &str) -> Result<Vec<Item>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if call < self.fail_first {
                return Err(if self.permanent {
                    RelayError::FetchPermanent("not xml".into())
                } else {
                    RelayError::FetchTransient("reset".into())
                });
            }
            Ok(vec![Item::new("1", "one")])
        }
    }

    fn scripted(fail_first: usize, permanent: bool, hang: bool) -> Scripted {
        Scripted {
            calls: AtomicUsize::new(0),
            fail_first,
            permanent,
            hang,
        }
    }

    #[test]
    fn test_retry_policy_minimum_budget() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).budget, 1);
    }

    #[tokio::test]
    async fn test_fetch_with_timeout_retries_transient() {
        let source = scripted(1, false, false);
        let items = fetch_with_timeout(&source, "http://a", Duration::from_secs(5), 2)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_with_timeout_stops_on_permanent() {
        let source = scripted(5, true, false);
        let err = fetch_with_timeout(&source, "http://a", Duration::from_secs(5), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::FetchPermanent(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_with_timeout_times_out() {
        let source = scripted(0, false, true);
        let err = fetch_with_timeout(&source, "http://a", Duration::from_secs(5), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::FetchTransient(ref m) if m.contains("5s")));
    }
}

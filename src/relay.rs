//! The feed relay: subscription flow on top of the registry and scheduler.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::channel::{DeliveryChannel, OutgoingText};
use crate::config::Config;
use crate::dedup::dedup;
use crate::dispatch::Dispatcher;
use crate::media::MediaFetcher;
use crate::registry::{
    DialogState, FeedCommit, SubscribeOutcome, SubscriptionRegistry, Unsubscribe,
};
use crate::scheduler::PollScheduler;
use crate::source::FeedSource;
use crate::store::Store;
use crate::types::{PollState, PreferenceOption, Preferences, SubscriberId};
use crate::Result;

/// Outcome of [`FeedRelay::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// The subscriber already held this feed.
    AlreadySubscribed,
    /// Subscribed to a feed that was already polled.
    Subscribed,
    /// The feed was validated, created and its poller started.
    FeedCreated,
    /// The feed was validated and created, but no poller could start
    /// because the relay is shutting down. It is polled after the next start.
    FeedDeferred,
}

/// Entry point used by the command layer.
pub struct FeedRelay {
    registry: Arc<SubscriptionRegistry>,
    scheduler: PollScheduler,
    channel: Arc<dyn DeliveryChannel>,
    config: Config,
}

impl FeedRelay {
    /// Load the registry from `store` and wire the components together.
    pub async fn new(
        config: Config,
        store: Arc<dyn Store>,
        source: Arc<dyn FeedSource>,
        channel: Arc<dyn DeliveryChannel>,
        media: Arc<dyn MediaFetcher>,
    ) -> Result<Self> {
        let registry = Arc::new(SubscriptionRegistry::load(store).await?);
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            channel.clone(),
            media,
            &config.dispatch,
        ));
        let scheduler = PollScheduler::new(
            registry.clone(),
            source,
            dispatcher,
            config.poll.clone(),
            config.subscribe.clone(),
        );
        Ok(Self {
            registry,
            scheduler,
            channel,
            config,
        })
    }

    /// Purge orphaned feeds, start every poller and optionally announce the restart.
    pub async fn start(&self) -> Result<usize> {
        let pruned = self.registry.prune_orphans().await?;
        if !pruned.is_empty() {
            info!("Pruned {} feeds without subscribers", pruned.len());
        }
        let started = self.scheduler.start_all().await;
        if self.config.startup.notify_subscribers {
            self.announce(&self.config.startup.notice).await;
        }
        Ok(started)
    }

    /// Send `text` to every subscriber. Returns how many received it.
    pub async fn announce(&self, text: &str) -> usize {
        let message = OutgoingText::plain(text);
        let mut delivered = 0;
        for subscriber in self.registry.subscribers().await {
            match self.channel.send_text(&subscriber, &message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to notify {}: {}", subscriber, e),
            }
        }
        info!("Announcement delivered to {} subscribers", delivered);
        delivered
    }

    /// Subscribe to a feed, validating and creating it when it is new.
    ///
    /// A URL that fails validation is rejected with the fetch error and
    /// nothing is persisted.
    pub async fn subscribe(&self, subscriber: &SubscriberId, url: &str) -> Result<Subscription> {
        let url = url.trim();
        match self.registry.subscribe(subscriber, url).await? {
            SubscribeOutcome::AlreadySubscribed => return Ok(Subscription::AlreadySubscribed),
            SubscribeOutcome::NewlySubscribed => return Ok(Subscription::Subscribed),
            SubscribeOutcome::FeedIsNew => {}
        }

        let items = self.scheduler.validate(url).await.map_err(|e| {
            info!("Rejected subscription of {} to {}: {}", subscriber, url, e);
            e
        })?;
        let baseline = dedup(None, items).last_seen;

        match self
            .registry
            .commit_new_feed(subscriber, url, baseline.clone())
            .await?
        {
            FeedCommit::Created => {
                if self.scheduler.spawn_validated(url, baseline).await {
                    Ok(Subscription::FeedCreated)
                } else {
                    warn!("Feed {} created without a poller", url);
                    Ok(Subscription::FeedDeferred)
                }
            }
            FeedCommit::Joined(SubscribeOutcome::AlreadySubscribed) => {
                Ok(Subscription::AlreadySubscribed)
            }
            FeedCommit::Joined(_) => Ok(Subscription::Subscribed),
        }
    }

    /// Remove a subscription. The poller stops when the last subscriber leaves.
    pub async fn unsubscribe(&self, subscriber: &SubscriberId, url: &str) -> Result<Unsubscribe> {
        let (outcome, retired) = self
            .registry
            .unsubscribe_retiring(subscriber, url.trim())
            .await?;
        if let Some(ticket) = retired {
            self.scheduler.stop_poller(&ticket);
        }
        Ok(outcome)
    }

    /// Remove the `n`th (zero-based) entry of the subscriber's listing.
    /// Returns the removed URL.
    pub async fn remove_nth(&self, subscriber: &SubscriberId, n: usize) -> Result<String> {
        let url = self.registry.nth_subscription(subscriber, n).await?;
        self.unsubscribe(subscriber, &url).await?;
        Ok(url)
    }

    /// Feeds of a subscriber, sorted.
    pub async fn list_subscriptions(&self, subscriber: &SubscriberId) -> Vec<String> {
        self.registry.list_subscriptions(subscriber).await
    }

    /// Preferences of a subscriber.
    pub async fn preferences(&self, subscriber: &SubscriberId) -> Preferences {
        self.registry.preferences(subscriber).await
    }

    /// Change one preference directly.
    pub async fn set_preference(
        &self,
        subscriber: &SubscriberId,
        option: PreferenceOption,
        value: bool,
    ) -> Result<Preferences> {
        self.registry.set_preference(subscriber, option, value).await
    }

    /// Start a preference dialog. Returns the option's current value.
    pub async fn begin_preference(&self, subscriber: &SubscriberId, option: PreferenceOption) -> bool {
        self.registry.begin_preference(subscriber, option).await
    }

    /// Answer the open preference dialog.
    pub async fn answer_preference(
        &self,
        subscriber: &SubscriberId,
        value: &str,
    ) -> Result<(PreferenceOption, Preferences)> {
        self.registry.answer_preference(subscriber, value).await
    }

    /// Abandon the open preference dialog.
    pub async fn cancel_preference(&self, subscriber: &SubscriberId) -> bool {
        self.registry.cancel_preference(subscriber).await
    }

    /// Dialog state of a subscriber.
    pub async fn dialog_state(&self, subscriber: &SubscriberId) -> DialogState {
        self.registry.dialog_state(subscriber).await
    }

    /// Poller state of a feed.
    pub async fn poll_state(&self, url: &str) -> Option<PollState> {
        self.registry.poll_state(url).await
    }

    /// Feeds with a running poller.
    pub fn live_pollers(&self) -> Vec<String> {
        self.scheduler.live_pollers()
    }

    /// The registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Stop every poller, waiting up to the configured grace period.
    pub async fn shutdown(&self) {
        self.scheduler
            .shutdown(Duration::from_secs(self.config.poll.shutdown_grace_secs))
            .await;
    }
}

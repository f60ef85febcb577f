//! Subscription registry.
//!
//! In-memory index of feeds, subscribers and watermarks, written through to a
//! [`Store`]. Every mutation takes the index lock, writes the store, and only
//! then updates memory, so a failed write leaves both sides unchanged.

mod dialog;
mod index;

pub use dialog::DialogState;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::keys::{self, RecordKey};
use crate::store::Store;
use crate::types::{PollState, PreferenceOption, Preferences, SubscriberId};
use crate::{RelayError, Result};
use index::RegistryIndex;

/// Result of [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The subscriber already held this feed. Nothing changed.
    AlreadySubscribed,
    /// The edge to an existing feed was recorded.
    NewlySubscribed,
    /// The feed is unknown. Nothing was written; the caller validates the
    /// URL and then calls [`SubscriptionRegistry::commit_new_feed`].
    FeedIsNew,
}

/// Result of [`SubscriptionRegistry::commit_new_feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedCommit {
    /// The feed was created by this call; the caller spawns its poller.
    Created,
    /// The feed was created concurrently by someone else; only the edge was
    /// handled.
    Joined(SubscribeOutcome),
}

/// Result of [`SubscriptionRegistry::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsubscribe {
    /// The edge was removed. When `last_subscriber` is set the feed was
    /// purged too and its poller must be stopped.
    Removed { last_subscriber: bool },
    /// The subscriber did not hold this feed.
    NotSubscribed,
}

/// Proof that a poller owns a feed.
///
/// Obtained from [`SubscriptionRegistry::claim_poller`]. Calls made with a
/// ticket are ignored once the feed has been purged or claimed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerTicket {
    url: String,
    generation: u64,
}

impl PollerTicket {
    /// URL of the claimed feed.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Registry of feeds and their subscribers.
pub struct SubscriptionRegistry {
    store: Arc<dyn Store>,
    index: Mutex<RegistryIndex>,
}

impl SubscriptionRegistry {
    /// Rebuild the registry from the store.
    pub async fn load(store: Arc<dyn Store>) -> Result<Self> {
        let mut records = BTreeMap::new();
        for namespace in [
            keys::FEED_NAMESPACE,
            keys::SUBSCRIBER_NAMESPACE,
            keys::LAST_SEEN_NAMESPACE,
        ] {
            records.extend(store.scan_prefix(namespace).await?);
        }

        let index = RegistryIndex::from_records(&records);
        info!(
            "Loaded registry: {} feeds, {} subscribers",
            index.feeds().len(),
            index.subscribers().len()
        );

        Ok(Self {
            store,
            index: Mutex::new(index),
        })
    }

    /// Subscribe to a known feed.
    pub async fn subscribe(&self, subscriber: &SubscriberId, url: &str) -> Result<SubscribeOutcome> {
        let mut index = self.index.lock().await;
        if !index.has_feed(url) {
            return Ok(SubscribeOutcome::FeedIsNew);
        }
        self.add_edge(&mut index, subscriber, url).await
    }

    /// Create a feed validated by the caller and subscribe to it.
    ///
    /// `baseline` is the watermark established by the validation fetch.
    pub async fn commit_new_feed(
        &self,
        subscriber: &SubscriberId,
        url: &str,
        baseline: Option<String>,
    ) -> Result<FeedCommit> {
        let mut index = self.index.lock().await;
        if index.has_feed(url) {
            debug!("Feed {} was created concurrently, joining", url);
            let outcome = self.add_edge(&mut index, subscriber, url).await?;
            return Ok(FeedCommit::Joined(outcome));
        }

        let mut entries = self.edge_entries(&index, subscriber, url)?;
        entries.insert(keys::feed(url), keys::PRESENT.to_string());
        if let Some(id) = &baseline {
            entries.insert(keys::last_seen(url), id.clone());
        }
        self.store.set_all(&entries).await?;

        index.add_feed(url);
        index.add_edge(subscriber, url);
        if !index.has_preferences_record(subscriber) {
            index.set_preferences(subscriber.clone(), Preferences::default());
        }
        if let Some(id) = baseline {
            index.set_last_seen(url, id);
        }
        info!("Created feed {} for {}", url, subscriber);
        Ok(FeedCommit::Created)
    }

    async fn add_edge(
        &self,
        index: &mut RegistryIndex,
        subscriber: &SubscriberId,
        url: &str,
    ) -> Result<SubscribeOutcome> {
        if index.is_subscribed(subscriber, url) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        let entries = self.edge_entries(index, subscriber, url)?;
        self.store.set_all(&entries).await?;

        index.add_edge(subscriber, url);
        if !index.has_preferences_record(subscriber) {
            index.set_preferences(subscriber.clone(), Preferences::default());
        }
        debug!("Subscribed {} to {}", subscriber, url);
        Ok(SubscribeOutcome::NewlySubscribed)
    }

    /// Records of one edge, plus the subscriber record if it does not exist yet.
    fn edge_entries(
        &self,
        index: &RegistryIndex,
        subscriber: &SubscriberId,
        url: &str,
    ) -> Result<BTreeMap<String, String>> {
        let mut entries = BTreeMap::new();
        entries.insert(
            keys::feed_subscriber(url, subscriber),
            keys::PRESENT.to_string(),
        );
        entries.insert(
            keys::subscriber_feed(subscriber, url),
            keys::PRESENT.to_string(),
        );
        if !index.has_preferences_record(subscriber) {
            entries.insert(
                keys::subscriber(subscriber),
                encode_preferences(&Preferences::default())?,
            );
        }
        Ok(entries)
    }

    /// Remove a subscription. The last subscriber leaving purges the feed.
    pub async fn unsubscribe(&self, subscriber: &SubscriberId, url: &str) -> Result<Unsubscribe> {
        self.unsubscribe_retiring(subscriber, url)
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Like [`unsubscribe`](Self::unsubscribe), also returning the ticket of
    /// the poller that lost its feed when the last subscriber left.
    ///
    /// The ticket identifies that one poller; a poller claimed for the same
    /// URL afterwards carries a different ticket.
    pub async fn unsubscribe_retiring(
        &self,
        subscriber: &SubscriberId,
        url: &str,
    ) -> Result<(Unsubscribe, Option<PollerTicket>)> {
        let mut index = self.index.lock().await;
        if !index.is_subscribed(subscriber, url) {
            return Ok((Unsubscribe::NotSubscribed, None));
        }

        if index.subscriber_count(url) == 1 {
            let purge = self.purge_keys(&index, url).await?;
            self.store.delete_all(&purge).await?;
            let retired = index
                .poller_generation(url)
                .map(|generation| PollerTicket {
                    url: url.to_string(),
                    generation,
                });
            index.remove_feed(url);
            info!("Last subscriber {} left, purged feed {}", subscriber, url);
            return Ok((
                Unsubscribe::Removed {
                    last_subscriber: true,
                },
                retired,
            ));
        }

        self.store
            .delete_all(&[
                keys::feed_subscriber(url, subscriber),
                keys::subscriber_feed(subscriber, url),
            ])
            .await?;
        index.remove_edge(subscriber, url);
        debug!("Unsubscribed {} from {}", subscriber, url);
        Ok((
            Unsubscribe::Removed {
                last_subscriber: false,
            },
            None,
        ))
    }

    /// Every key belonging to a feed: feed record, watermark and both edge
    /// directions. Edges only present in the store are included.
    async fn purge_keys(&self, index: &RegistryIndex, url: &str) -> Result<Vec<String>> {
        let mut subscribers: BTreeSet<SubscriberId> =
            index.subscribers_of(url).into_iter().collect();
        let stray = self
            .store
            .scan_prefix(&keys::feed_subscribers_prefix(url))
            .await?;
        for key in stray.keys() {
            if let Some(RecordKey::FeedSubscriber { subscriber, .. }) = keys::parse(key) {
                subscribers.insert(subscriber);
            }
        }

        let mut purge = vec![keys::feed(url), keys::last_seen(url)];
        for subscriber in &subscribers {
            purge.push(keys::feed_subscriber(url, subscriber));
            purge.push(keys::subscriber_feed(subscriber, url));
        }
        Ok(purge)
    }

    /// Purge a feed and every subscription to it. Returns the former subscribers.
    pub async fn remove_feed(&self, url: &str) -> Result<Vec<SubscriberId>> {
        let mut index = self.index.lock().await;
        self.remove_feed_locked(&mut index, url).await
    }

    async fn remove_feed_locked(
        &self,
        index: &mut RegistryIndex,
        url: &str,
    ) -> Result<Vec<SubscriberId>> {
        let purge = self.purge_keys(index, url).await?;
        self.store.delete_all(&purge).await?;
        let subscribers = index.remove_feed(url);
        info!("Removed feed {} ({} subscribers)", url, subscribers.len());
        Ok(subscribers)
    }

    /// Purge every feed that has no subscribers. Returns the purged URLs.
    pub async fn prune_orphans(&self) -> Result<Vec<String>> {
        let mut index = self.index.lock().await;
        let orphans: Vec<String> = index
            .feeds()
            .into_iter()
            .filter(|url| index.subscriber_count(url) == 0)
            .collect();
        for url in &orphans {
            warn!("Feed {} has no subscribers, removing", url);
            self.remove_feed_locked(&mut index, url).await?;
        }
        Ok(orphans)
    }

    /// Feeds of a subscriber, sorted.
    pub async fn list_subscriptions(&self, subscriber: &SubscriberId) -> Vec<String> {
        self.index.lock().await.subscriptions(subscriber)
    }

    /// The `n`th (zero-based) entry of [`list_subscriptions`](Self::list_subscriptions).
    pub async fn nth_subscription(&self, subscriber: &SubscriberId, n: usize) -> Result<String> {
        let feeds = self.list_subscriptions(subscriber).await;
        let len = feeds.len();
        feeds
            .into_iter()
            .nth(n)
            .ok_or(RelayError::IndexOutOfRange { index: n, len })
    }

    /// Current subscribers of a feed.
    pub async fn subscribers_of(&self, url: &str) -> Vec<SubscriberId> {
        self.index.lock().await.subscribers_of(url)
    }

    /// Every subscriber holding at least one subscription.
    pub async fn subscribers(&self) -> Vec<SubscriberId> {
        self.index.lock().await.subscribers()
    }

    /// All known feeds, sorted.
    pub async fn feeds(&self) -> Vec<String> {
        self.index.lock().await.feeds()
    }

    /// Whether a feed is known.
    pub async fn has_feed(&self, url: &str) -> bool {
        self.index.lock().await.has_feed(url)
    }

    /// Preferences of a subscriber (defaults if none were stored).
    pub async fn preferences(&self, subscriber: &SubscriberId) -> Preferences {
        self.index.lock().await.preferences(subscriber)
    }

    /// Change one preference and persist it.
    pub async fn set_preference(
        &self,
        subscriber: &SubscriberId,
        option: PreferenceOption,
        value: bool,
    ) -> Result<Preferences> {
        let mut index = self.index.lock().await;
        self.set_preference_locked(&mut index, subscriber, option, value)
            .await
    }

    async fn set_preference_locked(
        &self,
        index: &mut RegistryIndex,
        subscriber: &SubscriberId,
        option: PreferenceOption,
        value: bool,
    ) -> Result<Preferences> {
        let mut prefs = index.preferences(subscriber);
        prefs.set(option, value);

        let mut entries = BTreeMap::new();
        entries.insert(keys::subscriber(subscriber), encode_preferences(&prefs)?);
        self.store.set_all(&entries).await?;

        index.set_preferences(subscriber.clone(), prefs);
        debug!("Set {}={} for {}", option.name(), value, subscriber);
        Ok(prefs)
    }

    /// Current dialog state of a subscriber.
    pub async fn dialog_state(&self, subscriber: &SubscriberId) -> DialogState {
        self.index.lock().await.dialog(subscriber)
    }

    /// Start changing an option. Returns its current value.
    pub async fn begin_preference(
        &self,
        subscriber: &SubscriberId,
        option: PreferenceOption,
    ) -> bool {
        let mut index = self.index.lock().await;
        index.set_dialog(subscriber, DialogState::AwaitingPreferenceValue(option));
        index.preferences(subscriber).get(option)
    }

    /// Answer the pending dialog. On an unrecognized value the dialog stays
    /// open so the subscriber can try again.
    pub async fn answer_preference(
        &self,
        subscriber: &SubscriberId,
        value: &str,
    ) -> Result<(PreferenceOption, Preferences)> {
        let mut index = self.index.lock().await;
        let (option, value) = index.dialog(subscriber).answer(value)?;
        let prefs = self
            .set_preference_locked(&mut index, subscriber, option, value)
            .await?;
        index.set_dialog(subscriber, DialogState::Idle);
        Ok((option, prefs))
    }

    /// Abandon the pending dialog. Returns whether one was open.
    pub async fn cancel_preference(&self, subscriber: &SubscriberId) -> bool {
        let mut index = self.index.lock().await;
        let open = index.dialog(subscriber) != DialogState::Idle;
        index.set_dialog(subscriber, DialogState::Idle);
        open
    }

    /// Watermark of a feed.
    pub async fn last_seen(&self, url: &str) -> Option<String> {
        self.index.lock().await.last_seen(url).map(str::to_string)
    }

    /// Persist a new watermark. Returns `false` without writing when the
    /// ticket no longer owns the feed.
    pub async fn record_last_seen(&self, ticket: &PollerTicket, id: &str) -> Result<bool> {
        let mut index = self.index.lock().await;
        if !index.owns_poller(&ticket.url, ticket.generation) {
            debug!("Discarding watermark for released feed {}", ticket.url);
            return Ok(false);
        }
        if index.last_seen(&ticket.url) == Some(id) {
            return Ok(true);
        }

        let mut entries = BTreeMap::new();
        entries.insert(keys::last_seen(&ticket.url), id.to_string());
        self.store.set_all(&entries).await?;
        index.set_last_seen(&ticket.url, id.to_string());
        Ok(true)
    }

    /// Claim the poller slot of a feed.
    ///
    /// Returns `None` when the feed is unknown or already has a live poller.
    pub async fn claim_poller(&self, url: &str) -> Option<PollerTicket> {
        let generation = self.index.lock().await.claim_poller(url)?;
        Some(PollerTicket {
            url: url.to_string(),
            generation,
        })
    }

    /// Record the state of a poller. Stale tickets are ignored.
    pub async fn set_poll_state(&self, ticket: &PollerTicket, state: PollState) -> bool {
        self.index
            .lock()
            .await
            .set_poll_state(&ticket.url, ticket.generation, state)
    }

    /// State of the poller of a feed, if one is live.
    pub async fn poll_state(&self, url: &str) -> Option<PollState> {
        self.index.lock().await.poll_state(url)
    }

    /// Purge the feed owned by `ticket` after its retry budget ran out.
    ///
    /// Returns `false` without touching anything when the ticket is stale.
    pub async fn retire_feed(&self, ticket: &PollerTicket) -> Result<bool> {
        let mut index = self.index.lock().await;
        if !index.owns_poller(&ticket.url, ticket.generation) {
            return Ok(false);
        }
        self.remove_feed_locked(&mut index, &ticket.url).await?;
        Ok(true)
    }
}

fn encode_preferences(prefs: &Preferences) -> Result<String> {
    serde_json::to_string(prefs)
        .map_err(|e| RelayError::StoreUnavailable(format!("cannot encode preferences: {e}")))
}

//! In-memory index over the persisted records.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use super::dialog::DialogState;
use crate::store::keys::{self, RecordKey};
use crate::types::{PollState, Preferences, SubscriberId};

/// Typed view of the store. Each map has a single purpose and value type.
#[derive(Debug, Default)]
pub(crate) struct RegistryIndex {
    /// Known feeds and their subscribers. A key present here means the feed exists.
    feed_subscribers: HashMap<String, BTreeSet<SubscriberId>>,
    /// Feeds of each subscriber, sorted for stable listings.
    subscriber_feeds: HashMap<SubscriberId, BTreeSet<String>>,
    /// Last seen item id per feed.
    last_seen: HashMap<String, String>,
    /// Preferences of every subscriber that has a record.
    preferences: HashMap<SubscriberId, Preferences>,
    /// Running pollers: generation of the claim and current state.
    pollers: HashMap<String, (u64, PollState)>,
    next_generation: u64,
    /// Preference dialogs in progress. Not persisted.
    dialogs: HashMap<SubscriberId, DialogState>,
}

impl RegistryIndex {
    /// Rebuild the index from raw store records.
    pub(crate) fn from_records(records: &BTreeMap<String, String>) -> Self {
        let mut index = Self::default();
        let mut edges = Vec::new();

        for (key, value) in records {
            match keys::parse(key) {
                Some(RecordKey::Feed { url }) => {
                    index.feed_subscribers.entry(url).or_default();
                }
                Some(RecordKey::FeedSubscriber { url, subscriber }) => {
                    edges.push((subscriber, url));
                }
                Some(RecordKey::SubscriberFeed { subscriber, url }) => {
                    edges.push((subscriber, url));
                }
                Some(RecordKey::Subscriber { subscriber }) => {
                    let prefs = serde_json::from_str(value).unwrap_or_default();
                    index.preferences.insert(subscriber, prefs);
                }
                Some(RecordKey::LastSeen { url }) => {
                    index.last_seen.insert(url, value.clone());
                }
                None => warn!("Ignoring unrecognized record key {}", key),
            }
        }

        // Edges pointing at feeds without a feed record are leftovers of an
        // interrupted purge and are not resurrected.
        for (subscriber, url) in edges {
            if let Some(subs) = index.feed_subscribers.get_mut(&url) {
                subs.insert(subscriber.clone());
                index
                    .subscriber_feeds
                    .entry(subscriber)
                    .or_default()
                    .insert(url);
            }
        }
        index.last_seen.retain(|url, _| index.feed_subscribers.contains_key(url));
        index
    }

    pub(crate) fn has_feed(&self, url: &str) -> bool {
        self.feed_subscribers.contains_key(url)
    }

    pub(crate) fn is_subscribed(&self, subscriber: &SubscriberId, url: &str) -> bool {
        self.feed_subscribers
            .get(url)
            .is_some_and(|subs| subs.contains(subscriber))
    }

    pub(crate) fn subscriber_count(&self, url: &str) -> usize {
        self.feed_subscribers.get(url).map_or(0, BTreeSet::len)
    }

    pub(crate) fn subscribers_of(&self, url: &str) -> Vec<SubscriberId> {
        self.feed_subscribers
            .get(url)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn subscriptions(&self, subscriber: &SubscriberId) -> Vec<String> {
        self.subscriber_feeds
            .get(subscriber)
            .map(|feeds| feeds.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn feeds(&self) -> Vec<String> {
        let mut feeds: Vec<String> = self.feed_subscribers.keys().cloned().collect();
        feeds.sort();
        feeds
    }

    pub(crate) fn subscribers(&self) -> Vec<SubscriberId> {
        let mut subs: Vec<SubscriberId> = self
            .subscriber_feeds
            .iter()
            .filter(|(_, feeds)| !feeds.is_empty())
            .map(|(sub, _)| sub.clone())
            .collect();
        subs.sort();
        subs
    }

    pub(crate) fn has_preferences_record(&self, subscriber: &SubscriberId) -> bool {
        self.preferences.contains_key(subscriber)
    }

    pub(crate) fn preferences(&self, subscriber: &SubscriberId) -> Preferences {
        self.preferences
            .get(subscriber)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn set_preferences(&mut self, subscriber: SubscriberId, prefs: Preferences) {
        self.preferences.insert(subscriber, prefs);
    }

    pub(crate) fn last_seen(&self, url: &str) -> Option<&str> {
        self.last_seen.get(url).map(String::as_str)
    }

    pub(crate) fn set_last_seen(&mut self, url: &str, id: String) {
        self.last_seen.insert(url.to_string(), id);
    }

    pub(crate) fn add_feed(&mut self, url: &str) {
        self.feed_subscribers.entry(url.to_string()).or_default();
    }

    pub(crate) fn add_edge(&mut self, subscriber: &SubscriberId, url: &str) {
        self.feed_subscribers
            .entry(url.to_string())
            .or_default()
            .insert(subscriber.clone());
        self.subscriber_feeds
            .entry(subscriber.clone())
            .or_default()
            .insert(url.to_string());
    }

    pub(crate) fn remove_edge(&mut self, subscriber: &SubscriberId, url: &str) {
        if let Some(subs) = self.feed_subscribers.get_mut(url) {
            subs.remove(subscriber);
        }
        if let Some(feeds) = self.subscriber_feeds.get_mut(subscriber) {
            feeds.remove(url);
            if feeds.is_empty() {
                self.subscriber_feeds.remove(subscriber);
            }
        }
    }

    /// Drop the feed and every edge to it. Returns the former subscribers.
    pub(crate) fn remove_feed(&mut self, url: &str) -> Vec<SubscriberId> {
        let subs: Vec<SubscriberId> = self
            .feed_subscribers
            .remove(url)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for sub in &subs {
            if let Some(feeds) = self.subscriber_feeds.get_mut(sub) {
                feeds.remove(url);
                if feeds.is_empty() {
                    self.subscriber_feeds.remove(sub);
                }
            }
        }
        self.last_seen.remove(url);
        self.pollers.remove(url);
        subs
    }

    /// Claim the poller slot of a feed. Returns the claim generation, or
    /// `None` when the feed is unknown or a live poller already holds it.
    pub(crate) fn claim_poller(&mut self, url: &str) -> Option<u64> {
        if !self.has_feed(url) {
            return None;
        }
        if let Some((_, state)) = self.pollers.get(url) {
            if state.is_live() {
                return None;
            }
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.pollers
            .insert(url.to_string(), (generation, PollState::Starting));
        Some(generation)
    }

    pub(crate) fn owns_poller(&self, url: &str, generation: u64) -> bool {
        self.pollers
            .get(url)
            .is_some_and(|(g, _)| *g == generation)
    }

    pub(crate) fn set_poll_state(&mut self, url: &str, generation: u64, state: PollState) -> bool {
        if !self.owns_poller(url, generation) {
            return false;
        }
        if state.is_live() {
            self.pollers.insert(url.to_string(), (generation, state));
        } else {
            self.pollers.remove(url);
        }
        true
    }

    pub(crate) fn poller_generation(&self, url: &str) -> Option<u64> {
        self.pollers.get(url).map(|(generation, _)| *generation)
    }

    pub(crate) fn poll_state(&self, url: &str) -> Option<PollState> {
        self.pollers.get(url).map(|(_, state)| *state)
    }

    pub(crate) fn dialog(&self, subscriber: &SubscriberId) -> DialogState {
        self.dialogs.get(subscriber).copied().unwrap_or_default()
    }

    pub(crate) fn set_dialog(&mut self, subscriber: &SubscriberId, state: DialogState) {
        match state {
            DialogState::Idle => {
                self.dialogs.remove(subscriber);
            }
            state => {
                self.dialogs.insert(subscriber.clone(), state);
            }
        }
    }
}

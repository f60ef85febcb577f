//! Record key scheme.
//!
//! | key                       | value                      |
//! |---------------------------|----------------------------|
//! | `rss:<url>`               | feed exists                |
//! | `rss:<url>:<subscriber>`  | feed -> subscriber edge    |
//! | `user:<subscriber>`       | preferences (JSON)         |
//! | `user:<subscriber>:<url>` | subscriber -> feed edge    |
//! | `last:<url>`              | last seen item id          |
//!
//! Every segment is percent-encoded, so a `:` inside a URL never reads as a
//! delimiter.

use std::borrow::Cow;

use crate::types::SubscriberId;

/// Namespace of feed records and feed -> subscriber edges.
pub const FEED_NAMESPACE: &str = "rss:";

/// Namespace of subscriber records and subscriber -> feed edges.
pub const SUBSCRIBER_NAMESPACE: &str = "user:";

/// Namespace of last-seen item ids.
pub const LAST_SEEN_NAMESPACE: &str = "last:";

/// Value stored for marker records.
pub const PRESENT: &str = "true";

fn encode(segment: &str) -> Cow<'_, str> {
    urlencoding::encode(segment)
}

fn decode(segment: &str) -> Option<String> {
    urlencoding::decode(segment).ok().map(Cow::into_owned)
}

/// Feed record key.
pub fn feed(url: &str) -> String {
    format!("{FEED_NAMESPACE}{}", encode(url))
}

/// Prefix of every feed -> subscriber edge of `url`.
pub fn feed_subscribers_prefix(url: &str) -> String {
    format!("{}:", feed(url))
}

/// Feed -> subscriber edge key.
pub fn feed_subscriber(url: &str, subscriber: &SubscriberId) -> String {
    format!(
        "{}{}",
        feed_subscribers_prefix(url),
        encode(subscriber.as_str())
    )
}

/// Subscriber record key.
pub fn subscriber(subscriber: &SubscriberId) -> String {
    format!("{SUBSCRIBER_NAMESPACE}{}", encode(subscriber.as_str()))
}

/// Prefix of every subscriber -> feed edge of `subscriber`.
pub fn subscriber_feeds_prefix(id: &SubscriberId) -> String {
    format!("{}:", subscriber(id))
}

/// Subscriber -> feed edge key.
pub fn subscriber_feed(id: &SubscriberId, url: &str) -> String {
    format!("{}{}", subscriber_feeds_prefix(id), encode(url))
}

/// Last-seen item id key.
pub fn last_seen(url: &str) -> String {
    format!("{LAST_SEEN_NAMESPACE}{}", encode(url))
}

/// A decoded record key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    /// `rss:<url>`
    Feed { url: String },
    /// `rss:<url>:<subscriber>`
    FeedSubscriber { url: String, subscriber: SubscriberId },
    /// `user:<subscriber>`
    Subscriber { subscriber: SubscriberId },
    /// `user:<subscriber>:<url>`
    SubscriberFeed { subscriber: SubscriberId, url: String },
    /// `last:<url>`
    LastSeen { url: String },
}

/// Decode a record key. Returns `None` for keys outside the scheme.
pub fn parse(key: &str) -> Option<RecordKey> {
    if let Some(rest) = key.strip_prefix(FEED_NAMESPACE) {
        return match rest.split_once(':') {
            None => Some(RecordKey::Feed { url: decode(rest)? }),
            Some((url, sub)) => Some(RecordKey::FeedSubscriber {
                url: decode(url)?,
                subscriber: SubscriberId::new(decode(sub)?),
            }),
        };
    }
    if let Some(rest) = key.strip_prefix(SUBSCRIBER_NAMESPACE) {
        return match rest.split_once(':') {
            None => Some(RecordKey::Subscriber {
                subscriber: SubscriberId::new(decode(rest)?),
            }),
            Some((sub, url)) => Some(RecordKey::SubscriberFeed {
                subscriber: SubscriberId::new(decode(sub)?),
                url: decode(url)?,
            }),
        };
    }
    key.strip_prefix(LAST_SEEN_NAMESPACE)
        .and_then(decode)
        .map(|url| RecordKey::LastSeen { url })
}

//! rss-relay - feed polling and fan-out relay
//!
//! Polls content feeds on a schedule, detects newly published items and
//! delivers them to every subscriber of the feed through a delivery channel.

pub mod channel;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod media;
pub mod poller;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod types;

pub use channel::{DeliveryChannel, MediaSource, OutgoingText, TelegramChannel};
pub use config::Config;
pub use dedup::{dedup, Dedup};
pub use dispatch::{DispatchReport, Dispatcher, MediaCache};
pub use error::{RelayError, Result};
pub use media::{FetchedMedia, HttpMediaFetcher, MediaFetcher};
pub use poller::{FeedPoller, PollerContext, PollerExit, RetryPolicy};
pub use registry::{
    DialogState, FeedCommit, PollerTicket, SubscribeOutcome, SubscriptionRegistry, Unsubscribe,
};
pub use relay::{FeedRelay, Subscription};
pub use scheduler::{stagger_delay, PollScheduler};
pub use source::{FeedSource, HttpFeedSource};
pub use store::{MemoryStore, Store};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use types::{
    Item, MediaHandle, MediaKind, PollState, PreferenceOption, Preferences, SubscriberId,
};

//! Fan-out of new items to subscribers.

mod media_cache;

pub use media_cache::{CacheLookup, MediaCache};

use std::ops::AddAssign;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::channel::{DeliveryChannel, MediaSource, OutgoingText};
use crate::config::DispatchConfig;
use crate::media::MediaFetcher;
use crate::registry::SubscriptionRegistry;
use crate::types::{Item, SubscriberId};
use crate::RelayError;

/// Counters of one dispatch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscribers the items were sent to.
    pub subscribers: usize,
    /// Text messages delivered (item texts and links).
    pub texts_sent: usize,
    /// Media uploaded for the first time.
    pub media_uploaded: usize,
    /// Media resent from a cached handle.
    pub media_reused: usize,
    /// Media skipped because it could not be fetched.
    pub media_skipped: usize,
    /// Sends refused by the channel.
    pub failed_sends: usize,
}

impl AddAssign for DispatchReport {
    fn add_assign(&mut self, other: Self) {
        self.subscribers += other.subscribers;
        self.texts_sent += other.texts_sent;
        self.media_uploaded += other.media_uploaded;
        self.media_reused += other.media_reused;
        self.media_skipped += other.media_skipped;
        self.failed_sends += other.failed_sends;
    }
}

/// Delivers items to every current subscriber of a feed.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    channel: Arc<dyn DeliveryChannel>,
    media: Arc<dyn MediaFetcher>,
    cache: MediaCache,
    max_concurrent_subscribers: usize,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        channel: Arc<dyn DeliveryChannel>,
        media: Arc<dyn MediaFetcher>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            registry,
            channel,
            media,
            cache: MediaCache::new(config.media_cache_capacity),
            max_concurrent_subscribers: config.max_concurrent_subscribers.max(1),
        }
    }

    /// The shared media cache.
    pub fn media_cache(&self) -> &MediaCache {
        &self.cache
    }

    /// Send `items` of feed `url` to its subscribers.
    ///
    /// Subscribers are served concurrently; each one receives the items in the
    /// given order. Delivery failures are logged and counted, never returned.
    pub async fn dispatch(&self, url: &str, items: &[Item]) -> DispatchReport {
        let subscribers = self.registry.subscribers_of(url).await;
        if subscribers.is_empty() || items.is_empty() {
            return DispatchReport::default();
        }

        let pass = self.cache.begin_pass();
        let reports: Vec<DispatchReport> = stream::iter(subscribers)
            .map(|subscriber| self.deliver(subscriber, items, pass))
            .buffer_unordered(self.max_concurrent_subscribers)
            .collect()
            .await;

        let mut total = DispatchReport::default();
        for report in reports {
            total += report;
        }
        info!(
            "Dispatched {} items of {} to {} subscribers",
            items.len(),
            url,
            total.subscribers
        );
        total
    }

    async fn deliver(&self, subscriber: SubscriberId, items: &[Item], pass: u64) -> DispatchReport {
        let prefs = self.registry.preferences(&subscriber).await;
        let mut report = DispatchReport {
            subscribers: 1,
            ..Default::default()
        };

        for item in items {
            let text = OutgoingText::plain(item.render_text());
            if let Err(RelayError::DeliveryPermanent(e)) =
                self.send_text(&subscriber, &text, &mut report).await
            {
                warn!("Giving up on {} for this pass: {}", subscriber, e);
                return report;
            }

            for link in &item.internal_links {
                let message = OutgoingText::with_preview(link.as_str());
                if let Err(RelayError::DeliveryPermanent(e)) =
                    self.send_text(&subscriber, &message, &mut report).await
                {
                    warn!("Giving up on {} for this pass: {}", subscriber, e);
                    return report;
                }
            }

            if prefs.include_media {
                for media_url in &item.media {
                    self.deliver_media(&subscriber, media_url, pass, &mut report)
                        .await;
                }
            }
        }
        report
    }

    async fn send_text(
        &self,
        subscriber: &SubscriberId,
        message: &OutgoingText,
        report: &mut DispatchReport,
    ) -> crate::Result<()> {
        match self.channel.send_text(subscriber, message).await {
            Ok(()) => {
                report.texts_sent += 1;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to send text to {}: {}", subscriber, e);
                report.failed_sends += 1;
                Err(e)
            }
        }
    }

    async fn deliver_media(
        &self,
        subscriber: &SubscriberId,
        url: &str,
        pass: u64,
        report: &mut DispatchReport,
    ) {
        match self.cache.lookup(url, pass) {
            CacheLookup::Hit(handle, kind) => {
                match self
                    .channel
                    .send_media(subscriber, MediaSource::Handle(handle), kind)
                    .await
                {
                    Ok(_) => report.media_reused += 1,
                    Err(e) => {
                        warn!("Failed to resend {} to {}: {}", url, subscriber, e);
                        report.failed_sends += 1;
                    }
                }
            }
            CacheLookup::FailedThisPass => {
                debug!("Skipping {} (failed earlier in this pass)", url);
                report.media_skipped += 1;
            }
            CacheLookup::Miss => {
                let fetched = match self.media.fetch(url).await {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        debug!("Skipping media {}: {}", url, e);
                        self.cache.mark_failed(url, pass);
                        report.media_skipped += 1;
                        return;
                    }
                };

                let source = MediaSource::Upload {
                    bytes: fetched.bytes,
                    file_name: fetched.file_name,
                };
                match self.channel.send_media(subscriber, source, fetched.kind).await {
                    Ok(handle) => {
                        self.cache.store(url, handle, fetched.kind);
                        report.media_uploaded += 1;
                    }
                    Err(e) => {
                        warn!("Failed to upload {} to {}: {}", url, subscriber, e);
                        if !e.is_transient() {
                            self.cache.mark_failed(url, pass);
                        }
                        report.failed_sends += 1;
                    }
                }
            }
        }
    }
}

//! Feed sources.

pub mod html;
mod http;

pub use http::{parse_items, validate_url, HttpFeedSource};
pub(crate) use http::{build_client, get_limited};

use async_trait::async_trait;

use crate::types::Item;
use crate::Result;

/// Something that can turn a feed URL into items.
///
/// Items are returned newest first. Errors are either
/// [`FetchTransient`](crate::RelayError::FetchTransient) (worth retrying) or
/// [`FetchPermanent`](crate::RelayError::FetchPermanent).
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch and parse the feed at `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<Item>>;
}

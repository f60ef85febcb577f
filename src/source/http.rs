//! Feed source fetching over HTTP and parsing with feed-rs.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use feed_rs::model::Entry;
use feed_rs::parser;
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use super::{html, FeedSource};
use crate::config::FetchConfig;
use crate::types::Item;
use crate::{RelayError, Result};

/// Feed source backed by reqwest.
pub struct HttpFeedSource {
    client: Client,
    max_feed_size: u64,
}

impl HttpFeedSource {
    /// Create a source with the given limits.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            max_feed_size: config.max_feed_size_bytes,
        })
    }
}

/// HTTP client shared by feed and media fetching.
pub(crate) fn build_client(config: &FetchConfig) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .read_timeout(Duration::from_secs(config.read_timeout_secs))
        .timeout(Duration::from_secs(config.total_timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
        .user_agent(config.user_agent.as_str())
        .build()
        .map_err(|e| RelayError::Config(format!("failed to create HTTP client: {e}")))
}

/// Whether a failed status is worth retrying.
pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// GET `url` and read at most `limit` bytes of body.
///
/// Network failures and retryable statuses come back as `transient`, every
/// other failure as `permanent`.
pub(crate) async fn get_limited(
    client: &Client,
    url: &str,
    limit: u64,
    transient: fn(String) -> RelayError,
    permanent: fn(String) -> RelayError,
) -> Result<(Option<String>, Vec<u8>)> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| transient(format!("request to {url} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let message = format!("HTTP {status} from {url}");
        return Err(if is_retryable_status(status) {
            transient(message)
        } else {
            permanent(message)
        });
    }

    if let Some(length) = response.content_length() {
        if length > limit {
            return Err(permanent(format!(
                "{url} too large: {length} bytes (max {limit} bytes)"
            )));
        }
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| transient(format!("failed to read {url}: {e}")))?;
    if bytes.len() as u64 > limit {
        return Err(permanent(format!(
            "{url} too large: {} bytes (max {limit} bytes)",
            bytes.len()
        )));
    }
    Ok((content_type, bytes.to_vec()))
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, url: &str) -> Result<Vec<Item>> {
        validate_url(url)?;
        let (_, body) = get_limited(
            &self.client,
            url,
            self.max_feed_size,
            RelayError::FetchTransient,
            RelayError::FetchPermanent,
        )
        .await?;
        let items = parse_items(&body)?;
        debug!("Fetched {} items from {}", items.len(), url);
        Ok(items)
    }
}

/// Parse a feed document into newest-first items.
pub fn parse_items(body: &[u8]) -> Result<Vec<Item>> {
    let feed = parser::parse(body)
        .map_err(|e| RelayError::FetchPermanent(format!("failed to parse feed: {e}")))?;
    Ok(feed.entries.into_iter().map(entry_to_item).collect())
}

fn entry_to_item(entry: Entry) -> Item {
    let link = entry.links.first().map(|l| l.href.clone());
    let base = link.as_deref().and_then(|l| Url::parse(l).ok());

    let title = entry
        .title
        .as_ref()
        .map(|t| html::strip_tags(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let markup = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
        .unwrap_or_default();
    let content = html::extract(&markup, base.as_ref());

    let mut item = Item::new(entry.id.clone(), title).with_body(content.text);
    if let Some(published) = entry.published.or(entry.updated) {
        item = item.with_published(published);
    }

    for media in entry.media.iter().flat_map(|m| m.content.iter()) {
        let is_image = media
            .content_type
            .as_ref()
            .map_or(true, |ct| ct.essence().to_string().starts_with("image/"));
        if let (true, Some(url)) = (is_image, &media.url) {
            let url = url.to_string();
            if !item.media.contains(&url) {
                item = item.with_media(url);
            }
        }
    }
    for image in content.images {
        if !item.media.contains(&image) {
            item = item.with_media(image);
        }
    }

    for target in content.links {
        if Some(&target) != link.as_ref() {
            item = item.with_internal_link(target);
        }
    }
    if let Some(link) = link {
        item = item.with_link(link);
    }
    item
}

/// Reject URLs that are not plain http(s) to a public host.
pub fn validate_url(url: &str) -> Result<()> {
    let parsed =
        Url::parse(url).map_err(|e| RelayError::FetchPermanent(format!("invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(RelayError::FetchPermanent(format!(
                "unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| RelayError::FetchPermanent("URL has no host".to_string()))?;

    let forbidden = match host {
        url::Host::Domain(domain) => is_internal_hostname(domain),
        url::Host::Ipv4(ip) => is_non_public(IpAddr::V4(ip)),
        url::Host::Ipv6(ip) => is_non_public(IpAddr::V6(ip)),
    };
    if forbidden {
        return Err(RelayError::FetchPermanent(format!(
            "host not allowed: {host}"
        )));
    }
    Ok(())
}

fn is_internal_hostname(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost"
        || [".localhost", ".local", ".internal", ".lan", ".home"]
            .iter()
            .any(|suffix| host.ends_with(suffix))
}

fn is_non_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_documentation()
                // Carrier-grade NAT: 100.64.0.0/10.
                || (a == 100 && (64..=127).contains(&b))
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_non_public(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>https://example.com/</link>
    <description>Example feed</description>
    <item>
      <guid>item-2</guid>
      <title>Second &amp; newest</title>
      <link>https://example.com/2</link>
      <description><![CDATA[<p>Hello <a href="https://example.com/2">self</a>
        and <a href="https://other.example/x">other</a></p>
        <img src="https://example.com/pic.png">]]></description>
      <enclosure url="https://example.com/pic.png" type="image/png" length="10"/>
    </item>
    <item>
      <guid>item-1</guid>
      <title>First</title>
      <link>https://example.com/1</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_items_newest_first() {
        let items = parse_items(RSS.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "item-2");
        assert_eq!(items[1].id, "item-1");
    }

    #[test]
    fn test_item_fields() {
        let items = parse_items(RSS.as_bytes()).unwrap();
        let item = &items[0];
        assert_eq!(item.title, "Second & newest");
        assert_eq!(item.link.as_deref(), Some("https://example.com/2"));
        assert!(item.body.starts_with("Hello self"));
        assert_eq!(item.internal_links, vec!["https://other.example/x"]);
        assert_eq!(item.media, vec!["https://example.com/pic.png"]);
    }

    #[test]
    fn test_parse_garbage_is_permanent() {
        let err = parse_items(b"this is not a feed").unwrap_err();
        assert!(matches!(err, RelayError::FetchPermanent(_)));
    }

    #[test]
    fn test_validate_url_accepts_public() {
        assert!(validate_url("https://example.com/feed.xml").is_ok());
        assert!(validate_url("http://93.184.216.34/rss").is_ok());
    }

    #[test]
    fn test_validate_url_rejects() {
        for url in [
            "ftp://example.com/feed",
            "not a url",
            "http://localhost/feed",
            "http://printer.lan/feed",
            "http://127.0.0.1/feed",
            "http://10.1.2.3/feed",
            "http://192.168.0.1/feed",
            "http://100.64.0.1/feed",
            "http://[::1]/feed",
            "http://[fd00::1]/feed",
            "http://[::ffff:127.0.0.1]/feed",
        ] {
            let err = validate_url(url).unwrap_err();
            assert!(matches!(err, RelayError::FetchPermanent(_)), "{url}");
        }
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::GONE));
    }
}

//! Fetching and classifying media referenced by feed items.

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::FetchConfig;
use crate::source::{build_client, get_limited, validate_url};
use crate::types::MediaKind;
use crate::{RelayError, Result};

/// Downloaded media ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    /// Raw file content.
    pub bytes: Vec<u8>,
    /// Still or animated.
    pub kind: MediaKind,
    /// File name to upload under.
    pub file_name: String,
}

/// Fetch-and-classify step used by the dispatcher.
///
/// Every failure is [`MediaUnavailable`](RelayError::MediaUnavailable).
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download `url` and decide how it must be delivered.
    async fn fetch(&self, url: &str) -> Result<FetchedMedia>;
}

/// Media fetcher backed by reqwest.
pub struct HttpMediaFetcher {
    client: Client,
    max_media_size: u64,
}

impl HttpMediaFetcher {
    /// Create a fetcher with the given limits.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            max_media_size: config.max_media_size_bytes,
        })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia> {
        validate_url(url).map_err(|e| RelayError::MediaUnavailable(e.to_string()))?;
        let (content_type, bytes) = get_limited(
            &self.client,
            url,
            self.max_media_size,
            RelayError::MediaUnavailable,
            RelayError::MediaUnavailable,
        )
        .await?;

        let kind = classify(content_type.as_deref(), &bytes, url)?;
        debug!("Fetched {} ({} bytes, {:?})", url, bytes.len(), kind);
        Ok(FetchedMedia {
            bytes,
            kind,
            file_name: file_name(url),
        })
    }
}

/// Decide how media must be delivered.
///
/// File signatures win over the declared content type, which wins over the
/// URL extension.
pub fn classify(content_type: Option<&str>, bytes: &[u8], url: &str) -> Result<MediaKind> {
    if bytes.starts_with(b"GIF8") {
        return Ok(MediaKind::Animated);
    }
    if is_webp(bytes) {
        return Ok(if is_animated_webp(bytes) {
            MediaKind::Animated
        } else {
            MediaKind::Still
        });
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) || bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        return Ok(MediaKind::Still);
    }

    let essence = content_type
        .map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
        .filter(|ct| !ct.is_empty() && ct != "application/octet-stream")
        .or_else(|| {
            mime_guess::from_path(url_path(url))
                .first()
                .map(|m| m.essence_str().to_string())
        });

    match essence.as_deref() {
        Some("image/gif") => Ok(MediaKind::Animated),
        Some(ct) if ct.starts_with("video/") => Ok(MediaKind::Animated),
        Some(ct) if ct.starts_with("image/") => Ok(MediaKind::Still),
        Some(ct) => Err(RelayError::MediaUnavailable(format!(
            "{url} is not media ({ct})"
        ))),
        None => Err(RelayError::MediaUnavailable(format!(
            "cannot tell what {url} is"
        ))),
    }
}

fn is_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}

/// An extended WebP header (`VP8X`) with the animation flag set.
fn is_animated_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 21 && &bytes[12..16] == b"VP8X" && bytes[20] & 0x02 != 0
}

fn url_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

/// Last path segment of `url`, or a generic name.
pub fn file_name(url: &str) -> String {
    url_path(url)
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "media".to_string())
}

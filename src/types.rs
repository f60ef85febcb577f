//! Core types shared by the relay components.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RelayError, Result};

/// Maximum length of an item body, in characters.
pub const MAX_BODY_LENGTH: usize = 3000;

/// Opaque identifier of a receiving party (a chat, a user, a webhook...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Create a subscriber id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<i64> for SubscriberId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// One item of a feed, as produced by a [`FeedSource`](crate::source::FeedSource).
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Stable identifier (RSS guid or Atom id).
    pub id: String,
    /// Item title.
    pub title: String,
    /// Plain-text body.
    pub body: String,
    /// Link to the original article.
    pub link: Option<String>,
    /// When the item was published.
    pub published: Option<DateTime<Utc>>,
    /// Links found in the body, delivered as separate messages.
    pub internal_links: Vec<String>,
    /// Media URLs referenced by the item.
    pub media: Vec<String>,
}

impl Item {
    /// Create an item with an id and a title.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            link: None,
            published: None,
            internal_links: Vec::new(),
            media: Vec::new(),
        }
    }

    /// Set the body, truncating it to [`MAX_BODY_LENGTH`] characters.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        self.body = if body.chars().count() > MAX_BODY_LENGTH {
            body.chars().take(MAX_BODY_LENGTH).collect()
        } else {
            body
        };
        self
    }

    /// Set the primary link.
    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// Set the published date.
    pub fn with_published(mut self, published: DateTime<Utc>) -> Self {
        self.published = Some(published);
        self
    }

    /// Add an internal link.
    pub fn with_internal_link(mut self, link: impl Into<String>) -> Self {
        self.internal_links.push(link.into());
        self
    }

    /// Add a media reference.
    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media.push(url.into());
        self
    }

    /// Text message announcing this item: title, body and link, blank-line separated.
    pub fn render_text(&self) -> String {
        [
            Some(self.title.trim()),
            Some(self.body.trim()),
            self.link.as_deref().map(str::trim),
        ]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
    }
}

/// Coarse classification of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Still image, delivered through the photo path.
    Still,
    /// Animated content (GIF, animated WebP), delivered as a document.
    Animated,
}

/// Handle of media already uploaded to the delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle(pub String);

impl MediaHandle {
    /// The raw handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a feed poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Waiting for the first fetch.
    Starting,
    /// Polling on the regular interval.
    Active,
    /// After `n` consecutive failed fetches.
    Backoff(u32),
    /// Terminal; the feed has been purged.
    Removed,
}

impl PollState {
    /// Whether a poller in this state is still running.
    pub fn is_live(&self) -> bool {
        !matches!(self, PollState::Removed)
    }
}

/// Per-subscriber delivery preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    /// Deliver the media attached to items.
    #[serde(default = "default_include_media")]
    pub include_media: bool,
}

fn default_include_media() -> bool {
    true
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            include_media: default_include_media(),
        }
    }
}

impl Preferences {
    /// Set one option.
    pub fn set(&mut self, option: PreferenceOption, value: bool) {
        match option {
            PreferenceOption::IncludeMedia => self.include_media = value,
        }
    }

    /// Current value of one option.
    pub fn get(&self, option: PreferenceOption) -> bool {
        match option {
            PreferenceOption::IncludeMedia => self.include_media,
        }
    }
}

/// A recognized preference option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreferenceOption {
    /// Whether media attached to items is delivered.
    IncludeMedia,
}

impl PreferenceOption {
    /// All recognized options.
    pub const ALL: [PreferenceOption; 1] = [PreferenceOption::IncludeMedia];

    /// Canonical name of the option.
    pub fn name(&self) -> &'static str {
        match self {
            PreferenceOption::IncludeMedia => "image",
        }
    }
}

impl FromStr for PreferenceOption {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "image" | "images" | "media" | "include_media" => Ok(PreferenceOption::IncludeMedia),
            other => Err(RelayError::InvalidPreference(format!(
                "unknown option: {other}"
            ))),
        }
    }
}

/// Parse a toggle value such as `enable` or `off`.
pub fn parse_toggle(value: &str) -> Result<bool> {
    match value.trim().trim_start_matches('/').to_lowercase().as_str() {
        "enable" | "enabled" | "on" | "true" | "yes" => Ok(true),
        "disable" | "disabled" | "off" | "false" | "no" => Ok(false),
        other => Err(RelayError::InvalidPreference(format!(
            "unknown value: {other}"
        ))),
    }
}

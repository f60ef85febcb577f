//! Outbound delivery channels.

mod telegram;

pub use telegram::{split_message, TelegramChannel, MAX_MESSAGE_LENGTH};

use async_trait::async_trait;

use crate::types::{MediaHandle, MediaKind, SubscriberId};
use crate::Result;

/// A text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingText {
    /// Message content.
    pub text: String,
    /// Let the channel render a preview of the first link.
    pub link_preview: bool,
}

impl OutgoingText {
    /// A message without link preview.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            link_preview: false,
        }
    }

    /// A message whose link gets a preview.
    pub fn with_preview(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            link_preview: true,
        }
    }
}

/// Media to send: new content, or a handle from an earlier upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Upload these bytes.
    Upload { bytes: Vec<u8>, file_name: String },
    /// Reuse an uploaded file.
    Handle(MediaHandle),
}

/// Where relayed items go.
///
/// Failures are [`DeliveryTransient`](crate::RelayError::DeliveryTransient)
/// when a later attempt may succeed and
/// [`DeliveryPermanent`](crate::RelayError::DeliveryPermanent) otherwise.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Send a text message.
    async fn send_text(&self, to: &SubscriberId, message: &OutgoingText) -> Result<()>;

    /// Send media. Animated media goes through the document path, still
    /// images through the photo path. Returns a handle that can be reused.
    async fn send_media(
        &self,
        to: &SubscriberId,
        media: MediaSource,
        kind: MediaKind,
    ) -> Result<MediaHandle>;
}

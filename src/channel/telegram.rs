//! Telegram Bot API delivery.

use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{DeliveryChannel, MediaSource, OutgoingText};
use crate::config::{FetchConfig, TelegramConfig};
use crate::source::build_client;
use crate::types::{MediaHandle, MediaKind, SubscriberId};
use crate::{RelayError, Result};

/// Longest text the Bot API accepts in one message, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

type ApiRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

/// Delivery through a Telegram bot.
pub struct TelegramChannel {
    client: Client,
    endpoint: String,
    limiter: ApiRateLimiter,
}

impl TelegramChannel {
    /// Create a channel. Fails when no token is configured.
    pub fn new(config: &TelegramConfig, fetch: &FetchConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(RelayError::Config("telegram.token is not set".to_string()));
        }
        let quota = Quota::per_second(
            NonZeroU32::new(config.messages_per_second).unwrap_or(NonZeroU32::MIN),
        );
        Ok(Self {
            client: build_client(fetch)?,
            endpoint: format!("{}/bot{}", config.api_base.trim_end_matches('/'), config.token),
            limiter: RateLimiter::direct(quota),
        })
    }

    fn method(&self, name: &str) -> String {
        format!("{}/{}", self.endpoint, name)
    }

    async fn call(&self, method: &str, request: RequestBuilder) -> Result<Value> {
        self.limiter.until_ready().await;
        let response = request.send().await.map_err(|e| {
            // The error text would contain the token-bearing URL.
            RelayError::DeliveryTransient(format!("{method} failed: {}", e.without_url()))
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            RelayError::DeliveryTransient(format!("{method} failed: {}", e.without_url()))
        })?;
        interpret_response(method, status, &body)
    }
}

/// Turn a Bot API reply into its `result` or a delivery error.
fn interpret_response(method: &str, status: StatusCode, body: &str) -> Result<Value> {
    let parsed: Option<ApiResponse> = serde_json::from_str(body).ok();
    if status.is_success() {
        if let Some(ApiResponse {
            ok: true, result, ..
        }) = parsed
        {
            return Ok(result.unwrap_or(Value::Null));
        }
    }

    let description = parsed
        .and_then(|r| r.description)
        .unwrap_or_else(|| format!("HTTP {status}"));
    let message = format!("{method}: {description}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(RelayError::DeliveryTransient(message))
    } else {
        Err(RelayError::DeliveryPermanent(message))
    }
}

/// The reusable file id in a sendPhoto/sendDocument result.
fn file_id(result: &Value) -> Option<String> {
    let id = |v: &Value| v.get("file_id").and_then(Value::as_str).map(str::to_string);
    result
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
        .and_then(id)
        .or_else(|| result.get("animation").and_then(id))
        .or_else(|| result.get("document").and_then(id))
        .or_else(|| result.get("video").and_then(id))
}

/// Split `text` into pieces of at most `limit` characters, on line boundaries when possible.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                if piece.len() == limit {
                    chunks.push(piece.iter().collect());
                } else {
                    current = piece.iter().collect();
                    current_len = piece.len();
                }
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .map(|chunk| chunk.trim_end_matches('\n').to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    async fn send_text(&self, to: &SubscriberId, message: &OutgoingText) -> Result<()> {
        for chunk in split_message(&message.text, MAX_MESSAGE_LENGTH) {
            let payload = json!({
                "chat_id": to.as_str(),
                "text": chunk,
                "disable_web_page_preview": !message.link_preview,
            });
            let request = self.client.post(self.method("sendMessage")).json(&payload);
            self.call("sendMessage", request).await?;
        }
        debug!("Sent text to {}", to);
        Ok(())
    }

    async fn send_media(
        &self,
        to: &SubscriberId,
        media: MediaSource,
        kind: MediaKind,
    ) -> Result<MediaHandle> {
        let (method, field) = match kind {
            MediaKind::Still => ("sendPhoto", "photo"),
            MediaKind::Animated => ("sendDocument", "document"),
        };

        let form = Form::new().text("chat_id", to.to_string());
        let form = match media {
            MediaSource::Upload { bytes, file_name } => {
                let mime = mime_guess::from_path(&file_name).first_or_octet_stream();
                let part = Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str(mime.essence_str())
                    .map_err(|e| RelayError::DeliveryPermanent(format!("bad media type: {e}")))?;
                form.part(field, part)
            }
            MediaSource::Handle(handle) => form.text(field, handle.0),
        };

        let request = self.client.post(self.method(method)).multipart(form);
        let result = self.call(method, request).await?;
        match file_id(&result) {
            Some(id) => Ok(MediaHandle(id)),
            None => {
                warn!("{} to {} returned no file id", method, to);
                Err(RelayError::DeliveryPermanent(format!(
                    "{method}: no file id in response"
                )))
            }
        }
    }
}

//! Configuration module for the feed relay.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::poller::RetryPolicy;
use crate::{RelayError, Result};

/// Steady-state polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Seconds between successful polls of one feed.
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Flat cooldown in seconds before retrying a failed fetch.
    #[serde(default = "default_poll_cooldown")]
    pub backoff_cooldown_secs: u64,
    /// Consecutive failures after which a feed is removed.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Number of stagger slots the startup fetches are spread across.
    #[serde(default = "default_stagger_window")]
    pub stagger_window: u32,
    /// Delay between two adjacent stagger slots, in milliseconds.
    #[serde(default = "default_stagger_unit_ms")]
    pub stagger_unit_ms: u64,
    /// Upper bound on fetches in flight across all pollers.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Seconds to wait for pollers to finish on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_poll_interval() -> u64 {
    300 // 5 minutes
}

fn default_poll_cooldown() -> u64 {
    300
}

fn default_retry_budget() -> u32 {
    3
}

fn default_stagger_window() -> u32 {
    300
}

fn default_stagger_unit_ms() -> u64 {
    1000
}

fn default_max_concurrent_fetches() -> usize {
    32
}

fn default_shutdown_grace() -> u64 {
    10
}

impl PollConfig {
    /// Poll interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Stagger unit as a duration.
    pub fn stagger_unit(&self) -> Duration {
        Duration::from_millis(self.stagger_unit_ms)
    }

    /// Retry policy for pollers rehydrated at startup.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_budget,
            Duration::from_secs(self.backoff_cooldown_secs),
        )
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            backoff_cooldown_secs: default_poll_cooldown(),
            retry_budget: default_retry_budget(),
            stagger_window: default_stagger_window(),
            stagger_unit_ms: default_stagger_unit_ms(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Configuration for the validation fetch done when a new feed is subscribed.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeConfig {
    /// Timeout in seconds for each validation attempt.
    #[serde(default = "default_subscribe_timeout")]
    pub timeout_secs: u64,
    /// Number of validation attempts before rejecting the URL.
    #[serde(default = "default_subscribe_attempts")]
    pub attempts: u32,
    /// Cooldown in seconds used by the poller of a freshly subscribed feed.
    #[serde(default = "default_subscribe_cooldown")]
    pub backoff_cooldown_secs: u64,
    /// Retry budget of the poller of a freshly subscribed feed.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

fn default_subscribe_timeout() -> u64 {
    5
}

fn default_subscribe_attempts() -> u32 {
    1
}

fn default_subscribe_cooldown() -> u64 {
    10
}

impl SubscribeConfig {
    /// Timeout for one validation attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Retry policy for pollers spawned after a validation fetch.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_budget,
            Duration::from_secs(self.backoff_cooldown_secs),
        )
    }
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_subscribe_timeout(),
            attempts: default_subscribe_attempts(),
            backoff_cooldown_secs: default_subscribe_cooldown(),
            retry_budget: default_retry_budget(),
        }
    }
}

/// Fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Subscribers of one feed served in parallel.
    #[serde(default = "default_max_concurrent_subscribers")]
    pub max_concurrent_subscribers: usize,
    /// Maximum number of media URLs remembered by the media cache.
    #[serde(default = "default_media_cache_capacity")]
    pub media_cache_capacity: usize,
}

fn default_max_concurrent_subscribers() -> usize {
    8
}

fn default_media_cache_capacity() -> usize {
    4096
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subscribers: default_max_concurrent_subscribers(),
            media_cache_capacity: default_media_cache_capacity(),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Keep everything in memory (nothing survives a restart).
    #[serde(default)]
    pub in_memory: bool,
}

fn default_db_path() -> String {
    "data/rss-relay.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            in_memory: false,
        }
    }
}

/// HTTP fetch limits shared by feed and media fetching.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Total request timeout in seconds.
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
    /// Maximum number of redirects.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Maximum feed document size in bytes.
    #[serde(default = "default_max_feed_size")]
    pub max_feed_size_bytes: u64,
    /// Maximum media size in bytes.
    #[serde(default = "default_max_media_size")]
    pub max_media_size_bytes: u64,
    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    20
}

fn default_total_timeout() -> u64 {
    30
}

fn default_max_redirects() -> usize {
    5
}

fn default_max_feed_size() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_max_media_size() -> u64 {
    20 * 1024 * 1024 // 20MB
}

fn default_user_agent() -> String {
    "rss-relay/0.1 (feed relay)".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            total_timeout_secs: default_total_timeout(),
            max_redirects: default_max_redirects(),
            max_feed_size_bytes: default_max_feed_size(),
            max_media_size_bytes: default_max_media_size(),
            user_agent: default_user_agent(),
        }
    }
}

/// Telegram delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token.
    #[serde(default)]
    pub token: String,
    /// Base URL of the Bot API.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Outgoing API calls allowed per second.
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u32,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_messages_per_second() -> u32 {
    25
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: default_api_base(),
            messages_per_second: default_messages_per_second(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file. Empty logs to the console only.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/rss-relay.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Startup behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct StartupConfig {
    /// Send a notice to every subscriber once the pollers are running.
    #[serde(default)]
    pub notify_subscribers: bool,
    /// Text of the startup notice.
    #[serde(default = "default_notice")]
    pub notice: String,
}

fn default_notice() -> String {
    "The feed relay has restarted; your subscriptions are active again.".to_string()
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            notify_subscribers: false,
            notice: default_notice(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Steady-state polling.
    #[serde(default)]
    pub poll: PollConfig,
    /// First-subscription validation.
    #[serde(default)]
    pub subscribe: SubscribeConfig,
    /// Fan-out.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Persistence.
    #[serde(default)]
    pub store: StoreConfig,
    /// HTTP fetch limits.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Telegram delivery.
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Startup behaviour.
    #[serde(default)]
    pub startup: StartupConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(RelayError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `RSS_RELAY_TELEGRAM_TOKEN`: bot token
    /// - `RSS_RELAY_DB_PATH`: SQLite database path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("RSS_RELAY_TELEGRAM_TOKEN") {
            if !token.is_empty() {
                self.telegram.token = token;
            }
        }
        if let Ok(path) = std::env::var("RSS_RELAY_DB_PATH") {
            if !path.is_empty() {
                self.store.path = path;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_secs == 0 {
            return Err(RelayError::Config(
                "poll.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.poll.retry_budget == 0 || self.subscribe.retry_budget == 0 {
            return Err(RelayError::Config(
                "retry_budget must be at least 1".to_string(),
            ));
        }
        if self.poll.stagger_window == 0 {
            return Err(RelayError::Config(
                "poll.stagger_window must be at least 1".to_string(),
            ));
        }
        if self.subscribe.attempts == 0 {
            return Err(RelayError::Config(
                "subscribe.attempts must be at least 1".to_string(),
            ));
        }
        if self.poll.max_concurrent_fetches == 0 || self.dispatch.max_concurrent_subscribers == 0
        {
            return Err(RelayError::Config(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

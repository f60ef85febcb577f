use std::sync::Arc;

use tracing::{error, info};

use rss_relay::{
    Config, FeedRelay, HttpFeedSource, HttpMediaFetcher, MemoryStore, Store, TelegramChannel,
};

#[tokio::main]
async fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    // Load configuration
    let config = match Config::load_with_env(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = rss_relay::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        rss_relay::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("rss-relay starting");
    if let Err(e) = run(config).await {
        error!("rss-relay stopped with an error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> rss_relay::Result<()> {
    let store = open_store(&config).await?;
    let source = Arc::new(HttpFeedSource::new(&config.fetch)?);
    let media = Arc::new(HttpMediaFetcher::new(&config.fetch)?);
    let channel = Arc::new(TelegramChannel::new(&config.telegram, &config.fetch)?);

    let relay = FeedRelay::new(config, store, source, channel, media).await?;
    let started = relay.start().await?;
    info!("Relaying {} feeds", started);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    relay.shutdown().await;
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_store(config: &Config) -> rss_relay::Result<Arc<dyn Store>> {
    if config.store.in_memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(rss_relay::SqliteStore::open(&config.store.path).await?))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(config: &Config) -> rss_relay::Result<Arc<dyn Store>> {
    if !config.store.in_memory {
        tracing::warn!("Built without SQLite support; using the in-memory store");
    }
    Ok(Arc::new(MemoryStore::new()))
}

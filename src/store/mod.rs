//! Persistent key/value store.
//!
//! The relay keeps all of its durable state as string records in a flat
//! namespace (see [`keys`]). Any backend that can do atomic multi-key
//! writes and prefix scans can be plugged in through [`Store`].

pub mod keys;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::Result;

/// Key/value persistence used by the subscription registry.
///
/// Failures are reported as [`RelayError::StoreUnavailable`](crate::RelayError::StoreUnavailable)
/// and must leave the store unchanged.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get the value of a key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Upsert every entry atomically.
    async fn set_all(&self, entries: &BTreeMap<String, String>) -> Result<()>;

    /// Delete every key atomically. Missing keys are ignored.
    async fn delete_all(&self, keys: &[String]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>>;
}

//! Process-wide cache of uploaded media.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tracing::debug;

use crate::types::{MediaHandle, MediaKind};

#[derive(Debug, Clone)]
enum CacheEntry {
    Uploaded(MediaHandle, MediaKind),
    /// Fetch or upload failed during the given dispatch pass.
    Failed(u64),
}

/// Result of [`MediaCache::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Already uploaded; resend by handle.
    Hit(MediaHandle, MediaKind),
    /// Failed earlier in this pass; skip.
    FailedThisPass,
    /// Unknown, or failed in an earlier pass; fetch it.
    Miss,
}

/// Media URL to upload handle. Never persisted.
///
/// Failure markers only hold for the dispatch pass that recorded them. When
/// the cache outgrows its capacity it starts over empty.
#[derive(Debug)]
pub struct MediaCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: usize,
    passes: AtomicU64,
}

impl MediaCache {
    /// Create a cache remembering at most `capacity` URLs.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            passes: AtomicU64::new(0),
        }
    }

    /// Id of a new dispatch pass.
    pub fn begin_pass(&self) -> u64 {
        self.passes.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up `url` on behalf of dispatch pass `pass`.
    pub fn lookup(&self, url: &str, pass: u64) -> CacheLookup {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(url) {
            Some(CacheEntry::Uploaded(handle, kind)) => CacheLookup::Hit(handle.clone(), *kind),
            Some(CacheEntry::Failed(failed_in)) if *failed_in == pass => CacheLookup::FailedThisPass,
            _ => CacheLookup::Miss,
        }
    }

    /// Remember the handle of an upload.
    pub fn store(&self, url: &str, handle: MediaHandle, kind: MediaKind) {
        self.insert(url, CacheEntry::Uploaded(handle, kind));
    }

    /// Mark `url` as failed for the rest of `pass`.
    pub fn mark_failed(&self, url: &str, pass: u64) {
        self.insert(url, CacheEntry::Failed(pass));
    }

    fn insert(&self, url: &str, entry: CacheEntry) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.capacity && !entries.contains_key(url) {
            debug!("Media cache full ({} entries), clearing", entries.len());
            entries.clear();
        }
        entries.insert(url.to_string(), entry);
    }

    /// Number of cached URLs.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

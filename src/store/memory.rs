//! In-memory store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::Store;
use crate::{RelayError, Result};

/// Store backed by a sorted map. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> RelayError {
    RelayError::StoreUnavailable("memory store lock poisoned".to_string())
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn set_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut map = self.entries.write().map_err(|_| poisoned())?;
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete_all(&self, keys: &[String]) -> Result<()> {
        let mut map = self.entries.write().map_err(|_| poisoned())?;
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store
            .set_all(&entries(&[("a", "1"), ("b", "2")]))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.len(), 2);

        store
            .delete_all(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let store = MemoryStore::new();
        store
            .set_all(&entries(&[
                ("rss:a", "true"),
                ("rss:a:1", "true"),
                ("rss:b", "true"),
                ("user:1", "{}"),
            ]))
            .await
            .unwrap();

        let feeds = store.scan_prefix("rss:").await.unwrap();
        assert_eq!(
            feeds.keys().collect::<Vec<_>>(),
            vec!["rss:a", "rss:a:1", "rss:b"]
        );

        let edges = store.scan_prefix("rss:a:").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!(store.scan_prefix("zzz").await.unwrap().is_empty());
    }
}

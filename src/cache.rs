//! Identity-keyed score cache with signature-based staleness.
//!
//! Entries live in memory and are mirrored best-effort into the local store
//! scope. A read that misses memory falls through to the store, so a `None`
//! shortly followed by a hit (another context persisted in between) is
//! normal.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    store::{keys, KeyValueStore, StoreScope},
    text::Signature,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub value: f64,
    pub confidence: f64,
}

/// Immutable once written; a newer result replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub score: Score,
    /// Entries written before signatures existed have none and are always stale.
    #[serde(default)]
    pub signature: Option<Signature>,
    pub timestamp: DateTime<Utc>,
}

struct CacheInner {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    store: Arc<dyn KeyValueStore>,
    length_tolerance: usize,
}

#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<CacheInner>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KeyValueStore>, length_tolerance: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(HashMap::new()),
                store,
                length_tolerance,
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.memory_get(key) {
            return Some(entry);
        }

        match self.load(key).await {
            Ok(Some(entry)) => {
                let entry = Arc::new(entry);
                self.memory_put(entry.clone());
                Some(entry)
            }
            Ok(None) => None,
            Err(err) => {
                warn!("cache read for {key} failed, treating as miss: {err:#}");
                None
            }
        }
    }

    /// Replaces the entry for `key` and mirrors it to the store without
    /// waiting. A failed mirror only costs a recomputation later.
    pub fn put(&self, key: &str, score: Score, signature: Signature) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            key: key.to_string(),
            score,
            signature: Some(signature),
            timestamp: Utc::now(),
        });
        self.memory_put(entry.clone());

        let cache = self.clone();
        let persisted = entry.clone();
        tokio::spawn(async move {
            if let Err(err) = cache.persist(&persisted).await {
                warn!("cache write for {} failed: {err:#}", persisted.key);
            }
        });

        entry
    }

    pub fn is_stale(&self, entry: &CacheEntry, fresh: &Signature) -> bool {
        let Some(cached) = entry.signature else {
            return true;
        };
        cached.length.abs_diff(fresh.length) > self.inner.length_tolerance
            || cached.word_count != fresh.word_count
            || cached.is_short_form != fresh.is_short_form
    }

    /// Cached entry for `key` if it still matches `fresh`.
    pub async fn lookup_fresh(&self, key: &str, fresh: &Signature) -> Option<Arc<CacheEntry>> {
        let entry = self.get(key).await?;
        if self.is_stale(&entry, fresh) {
            debug!("cache entry for {key} is stale");
            return None;
        }
        Some(entry)
    }

    pub(crate) async fn persist(&self, entry: &CacheEntry) -> Result<()> {
        let value = serde_json::to_value(entry).context("failed to encode cache entry")?;
        self.inner
            .store
            .set_one(StoreScope::Local, &keys::cache_entry(&entry.key), value)
            .await
    }

    async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        let raw = self
            .inner
            .store
            .get_one(StoreScope::Local, &keys::cache_entry(key))
            .await?;
        raw.map(|value| serde_json::from_value(value).context("corrupt cache entry"))
            .transpose()
    }

    fn memory_get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        match self.inner.entries.read() {
            Ok(entries) => entries.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    fn memory_put(&self, entry: Arc<CacheEntry>) {
        let mut entries = match self.inner.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(entry.key.clone(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn signature(length: usize, word_count: usize, is_short_form: bool) -> Signature {
        Signature {
            length,
            word_count,
            is_short_form,
        }
    }

    fn score() -> Score {
        Score {
            value: 112.0,
            confidence: 80.0,
        }
    }

    #[tokio::test]
    async fn changed_content_is_stale_and_small_drift_is_not() {
        let cache = ResultCache::new(Arc::new(MemoryStore::new()), 5);
        cache.put("@author", score(), signature(50, 10, true));

        assert!(cache
            .lookup_fresh("@author", &signature(200, 40, false))
            .await
            .is_none());
        assert_eq!(
            cache
                .lookup_fresh("@author", &signature(52, 10, true))
                .await
                .map(|entry| entry.score),
            Some(score())
        );
    }

    #[tokio::test]
    async fn any_word_count_or_class_change_is_stale() {
        let cache = ResultCache::new(Arc::new(MemoryStore::new()), 5);
        let entry = cache.put("@a", score(), signature(50, 10, true));

        assert!(cache.is_stale(&entry, &signature(50, 11, true)));
        assert!(cache.is_stale(&entry, &signature(50, 10, false)));
        assert!(cache.is_stale(&entry, &signature(56, 10, true)));
        assert!(!cache.is_stale(&entry, &signature(45, 10, true)));
    }

    #[tokio::test]
    async fn legacy_entry_without_signature_is_stale() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_one(
                StoreScope::Local,
                &keys::cache_entry("@old"),
                json!({
                    "key": "@old",
                    "score": { "value": 100.0, "confidence": 60.0 },
                    "timestamp": "2024-01-01T00:00:00Z"
                }),
            )
            .await
            .unwrap();
        let cache = ResultCache::new(store, 5);

        let entry = cache.get("@old").await.unwrap();
        assert_eq!(entry.signature, None);
        assert!(cache.is_stale(&entry, &signature(10, 2, true)));
    }

    #[tokio::test]
    async fn second_context_reads_through_the_store() {
        let store = Arc::new(MemoryStore::new());
        let writer = ResultCache::new(store.clone(), 5);
        let reader = ResultCache::new(store, 5);

        let entry = writer.put("@shared", score(), signature(80, 15, true));
        writer.persist(&entry).await.unwrap();

        assert_eq!(reader.get("@shared").await.as_deref(), Some(entry.as_ref()));
    }

    #[tokio::test]
    async fn store_outage_degrades_to_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let cache = ResultCache::new(store, 5);

        assert!(cache.get("@anyone").await.is_none());
        let entry = cache.put("@anyone", score(), signature(20, 4, true));
        assert!(cache.persist(&entry).await.is_err());
        assert_eq!(cache.get("@anyone").await, Some(entry));
    }
}

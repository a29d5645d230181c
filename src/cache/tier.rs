//! Cache tier abstraction and the in-process tiers.
//!
//! A [`CacheTier`] stores complete [`CacheEntry`] values by key. Tiers do
//! not judge freshness; expiry and version staleness are decided by the
//! [`CacheManager`](super::CacheManager), which also bounds every tier call
//! with a timeout.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;

use persona_harness_core::error::CacheError;
use persona_harness_core::models::CacheEntry;

/// One storage level of the response cache.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Short name used in logs and errors (`memory`, `shared`, `durable`).
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or replace `entry` under `entry.key`.
    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

fn poisoned(tier: &str) -> CacheError {
    CacheError::Unavailable {
        tier: tier.to_string(),
        message: "lock poisoned".to_string(),
    }
}

// ============ Memory ============

/// Bounded in-process LRU.
pub struct MemoryTier {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("memory"))?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("memory"))?;
        entries.put(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("memory"))?;
        entries.pop(key);
        Ok(())
    }
}

// ============ Shared ============

/// A bounded cache map shared by every manager holding a clone of this
/// handle.
///
/// The map lives in this process: managers built from clones of one
/// handle see each other's entries, nothing outside the process does.
/// Cross-instance sharing needs a networked backend that implements
/// [`CacheTier`] directly. When full, expired entries are dropped first,
/// then the least recently used.
#[derive(Clone)]
pub struct SharedTier {
    entries: Arc<Mutex<LruCache<String, CacheEntry>>>,
}

impl SharedTier {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose TTL has passed. Returns how many were removed.
    pub fn purge_expired(&self, now: i64) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        drop_expired(&mut entries, now)
    }
}

fn drop_expired(entries: &mut LruCache<String, CacheEntry>, now: i64) -> usize {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, e)| e.is_expired(now))
        .map(|(k, _)| k.clone())
        .collect();
    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}

#[async_trait]
impl CacheTier for SharedTier {
    fn name(&self) -> &str {
        "shared"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("shared"))?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("shared"))?;
        if entries.len() == entries.cap().get() && !entries.contains(&entry.key) {
            drop_expired(&mut entries, chrono::Utc::now().timestamp());
        }
        entries.put(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("shared"))?;
        entries.pop(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, created_at: i64) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            personality_id: "krishna".into(),
            language: "en".into(),
            template_id: "default".into(),
            template_version_used: 1,
            rendered_response: format!("response {key}"),
            citations: vec![],
            confidence_score: 0.8,
            created_at,
            ttl_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_memory_tier_evicts_least_recent() {
        let tier = MemoryTier::new(2);
        tier.put(&entry("a", 0)).await.unwrap();
        tier.put(&entry("b", 0)).await.unwrap();
        tier.get("a").await.unwrap();
        tier.put(&entry("c", 0)).await.unwrap();

        assert!(tier.get("a").await.unwrap().is_some());
        assert!(tier.get("b").await.unwrap().is_none());
        assert_eq!(tier.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_tier_visible_through_clones() {
        let tier = SharedTier::new(16);
        let other = tier.clone();
        tier.put(&entry("k", 0)).await.unwrap();
        assert_eq!(
            other.get("k").await.unwrap().map(|e| e.rendered_response),
            Some("response k".to_string())
        );
        other.remove("k").await.unwrap();
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_shared_tier_purge_expired() {
        let tier = SharedTier::new(16);
        tier.put(&entry("old", 0)).await.unwrap();
        tier.put(&entry("new", 1_000)).await.unwrap();
        assert_eq!(tier.purge_expired(100), 1);
        assert!(tier.get("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shared_tier_is_bounded() {
        let now = chrono::Utc::now().timestamp();
        let tier = SharedTier::new(8);
        for i in 0..500 {
            tier.put(&entry(&format!("expired-{i}"), 0)).await.unwrap();
        }
        assert!(tier.len() <= 8);

        for i in 0..500 {
            tier.put(&entry(&format!("live-{i}"), now)).await.unwrap();
        }
        assert_eq!(tier.len(), 8);
        assert!(tier.get("live-0").await.unwrap().is_none());
        assert!(tier.get("live-499").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shared_tier_full_drops_expired_before_live() {
        let now = chrono::Utc::now().timestamp();
        let tier = SharedTier::new(3);
        tier.put(&entry("live", now)).await.unwrap();
        tier.put(&entry("dead-1", 0)).await.unwrap();
        tier.put(&entry("dead-2", 0)).await.unwrap();

        tier.put(&entry("fresh", now)).await.unwrap();
        assert_eq!(tier.len(), 2);
        assert!(tier.get("live").await.unwrap().is_some());
        assert!(tier.get("fresh").await.unwrap().is_some());
    }
}

//! Bounded, expiring cache of resolved media URLs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use super::resolver::ResolvedMedia;

struct CacheEntry {
    value: ResolvedMedia,
    inserted_at: Instant,
}

/// Original media URL -> resolved URL, with TTL expiry and a size bound
pub struct MediaCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl MediaCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Cached value, if present and not expired
    pub async fn get(&self, key: &str) -> Option<ResolvedMedia> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: drop it so the next resolution starts fresh
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|e| e.inserted_at.elapsed() >= self.ttl)
        {
            entries.remove(key);
        }
        None
    }

    /// Insert a value, evicting expired and then oldest entries when full.
    pub async fn insert(&self, key: String, value: ResolvedMedia) {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted_at.elapsed() < ttl);

            while entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        debug!("Evicting cached media URL {}", k);
                        entries.remove(&k);
                    }
                    None => break,
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::resolver::ResolutionSource;
    use crate::media::MediaKind;

    fn resolved(url: &str) -> ResolvedMedia {
        ResolvedMedia {
            kind: MediaKind::Image,
            url: url.to_string(),
            source: ResolutionSource::Proxy,
        }
    }

    #[tokio::test]
    async fn test_hit_and_miss() {
        let cache = MediaCache::new(Duration::from_secs(60), 10);
        assert!(cache.get("a").await.is_none());
        cache.insert("a".to_string(), resolved("/p/a")).await;
        assert_eq!(cache.get("a").await.unwrap().url, "/p/a");
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let cache = MediaCache::new(Duration::ZERO, 10);
        cache.insert("a".to_string(), resolved("/p/a")).await;
        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = MediaCache::new(Duration::from_secs(60), 2);
        cache.insert("a".to_string(), resolved("/p/a")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.insert("b".to_string(), resolved("/p/b")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.insert("c".to_string(), resolved("/p/c")).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = MediaCache::new(Duration::from_secs(60), 1);
        cache.insert("a".to_string(), resolved("/p/a")).await;
        cache.insert("a".to_string(), resolved("/p/a2")).await;
        assert_eq!(cache.get("a").await.unwrap().url, "/p/a2");
    }
}

//! Short-lived cache of confirmed file positions.
//!
//! Saves a round trip to the server when a file is picked up again shortly after the
//! previous tail finished. The server stays the source of truth: an expired or missing
//! entry always falls back to an authoritative query.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use onecmon_core::types::FileKey;

struct Entry {
    position: i64,
    expires_at: Instant,
}

/// TTL cache keyed by [`FileKey`].
pub struct PositionCache {
    entries: DashMap<FileKey, Entry>,
    ttl: Duration,
}

impl PositionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns the cached position, dropping the entry if it has expired.
    pub fn get(&self, key: &FileKey) -> Option<i64> {
        let now = Instant::now();
        let position = {
            let entry = self.entries.get(key)?;
            (entry.expires_at > now).then_some(entry.position)
        };
        if position.is_none() {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        position
    }

    /// Records a confirmed position. Keeps the larger of the cached and new value and
    /// restarts the TTL.
    pub fn update(&self, key: &FileKey, position: i64) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .entry(key.clone())
            .and_modify(|entry| {
                if entry.expires_at <= Instant::now() || position > entry.position {
                    entry.position = position;
                }
                entry.expires_at = expires_at;
            })
            .or_insert(Entry {
                position,
                expires_at,
            });
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn key(file: &str) -> FileKey {
        FileKey {
            seance_id: Uuid::nil(),
            template_id: Uuid::nil(),
            folder: "rphost_1".to_owned(),
            file: file.to_owned(),
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = PositionCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(&key("23011512")), None);
        cache.update(&key("23011512"), 120);
        assert_eq!(cache.get(&key("23011512")), Some(120));
        assert_eq!(cache.get(&key("23011513")), None);
    }

    #[tokio::test]
    async fn keeps_maximum_position() {
        let cache = PositionCache::new(Duration::from_secs(60));
        cache.update(&key("a"), 500);
        cache.update(&key("a"), 300);
        assert_eq!(cache.get(&key("a")), Some(500));
        cache.update(&key("a"), 700);
        assert_eq!(cache.get(&key("a")), Some(700));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = PositionCache::new(Duration::from_secs(3600));
        cache.update(&key("a"), 42);

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert_eq!(cache.get(&key("a")), Some(42));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&key("a")), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_replaced_by_smaller_value() {
        let cache = PositionCache::new(Duration::from_secs(10));
        cache.update(&key("a"), 900);
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.update(&key("a"), 100);
        assert_eq!(cache.get(&key("a")), Some(100));
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let cache = PositionCache::new(Duration::from_secs(60));
        cache.update(&key("a"), 1);
        cache.update(&key("b"), 2);
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}

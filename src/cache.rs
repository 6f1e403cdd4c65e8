//! Bounded, TTL-evicting inventory cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::inventory::Inventory;

/// Caches parsed inventories by object ID. Entries expire after the configured TTL and the
/// cache never holds more than `max_entries`; when full, the stalest entry is evicted.
/// Invalidation is explicit and happens on purge and on failed commits.
pub struct InventoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    ttl: Duration,
}

struct CacheEntry {
    inventory: Arc<Inventory>,
    inserted: Instant,
}

impl InventoryCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
            ttl,
        }
    }

    /// Returns the cached inventory, if present and not expired
    pub fn get(&self, object_id: &str) -> Option<Arc<Inventory>> {
        let mut entries = self.entries.lock();

        match entries.get(object_id) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.inventory.clone()),
            Some(_) => {
                entries.remove(object_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, inventory: Arc<Inventory>) {
        let mut entries = self.entries.lock();

        entries.retain(|_, entry| entry.inserted.elapsed() < self.ttl);

        if entries.len() >= self.max_entries && !entries.contains_key(&inventory.id) {
            let stalest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(id, _)| id.clone());
            if let Some(id) = stalest {
                entries.remove(&id);
            }
        }

        entries.insert(
            inventory.id.clone(),
            CacheEntry {
                inventory,
                inserted: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, object_id: &str) {
        self.entries.lock().remove(object_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Local;

    use super::InventoryCache;
    use crate::digest::DigestAlgorithm;
    use crate::inventory::Inventory;
    use crate::types::{SpecVersion, VersionInfo};

    fn inventory(id: &str) -> Arc<Inventory> {
        Arc::new(
            Inventory::new_object(
                id,
                SpecVersion::Ocfl1_1,
                DigestAlgorithm::Sha512,
                "content",
                Local::now(),
                &VersionInfo::new(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn cache_hit_and_invalidate() {
        let cache = InventoryCache::new(4, Duration::from_secs(60));

        cache.put(inventory("o1"));
        assert!(cache.get("o1").is_some());
        assert!(cache.get("o2").is_none());

        cache.invalidate("o1");
        assert!(cache.get("o1").is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = InventoryCache::new(4, Duration::from_millis(10));

        cache.put(inventory("o1"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("o1").is_none());
    }

    #[test]
    fn evicts_stalest_entry_when_full() {
        let cache = InventoryCache::new(2, Duration::from_secs(60));

        cache.put(inventory("o1"));
        std::thread::sleep(Duration::from_millis(2));
        cache.put(inventory("o2"));
        std::thread::sleep(Duration::from_millis(2));
        cache.put(inventory("o3"));

        assert!(cache.get("o1").is_none());
        assert!(cache.get("o2").is_some());
        assert!(cache.get("o3").is_some());
    }
}

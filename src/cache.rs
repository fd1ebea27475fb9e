use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide metadata cache shared by all workers.
///
/// Values are opaque blobs published once and never mutated, so readers
/// never block writers. Keys are namespaced per artifact kind, e.g.
/// `"{path}:atom:moov"` or `"{path}:offsets"`. The total stored size is
/// bounded by a byte budget; inserting past the budget removes other
/// entries until the total fits again.
pub struct MetaCache {
    map: DashMap<String, Arc<Vec<u8>>>,
    budget: usize,
    used: AtomicUsize,
}

impl MetaCache {
    pub fn new(budget: usize) -> Self {
        Self {
            map: DashMap::new(),
            budget,
            used: AtomicUsize::new(0),
        }
    }

    /// A miss is not an error; callers regenerate and `put`.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    pub fn put(&self, key: &str, value: Vec<u8>) {
        let size = key.len() + value.len();
        if let Some(old) = self.map.insert(key.to_owned(), Arc::new(value)) {
            self.used.fetch_sub(key.len() + old.len(), Ordering::Relaxed);
        }
        self.used.fetch_add(size, Ordering::Relaxed);
        if self.used.load(Ordering::Relaxed) > self.budget {
            self.shrink(key);
        }
    }

    /// Evict entries other than `keep` until the total fits the budget.
    fn shrink(&self, keep: &str) {
        let victims: Vec<String> = self
            .map
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|k| k != keep)
            .collect();
        for victim in victims {
            if self.used.load(Ordering::Relaxed) <= self.budget {
                break;
            }
            if let Some((k, v)) = self.map.remove(&victim) {
                self.used.fetch_sub(k.len() + v.len(), Ordering::Relaxed);
                log::debug!("[cache] evicted {}", k);
            }
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn items(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = MetaCache::new(1024);
        assert!(cache.get("a.mp4:atom:moov").is_none());
        cache.put("a.mp4:atom:moov", vec![1, 2, 3]);
        assert_eq!(cache.get("a.mp4:atom:moov").unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(cache.items(), 1);
    }

    #[test]
    fn replace_updates_size() {
        let cache = MetaCache::new(1024);
        cache.put("k", vec![0; 100]);
        cache.put("k", vec![0; 10]);
        assert_eq!(cache.used(), 1 + 10);
        assert_eq!(cache.items(), 1);
    }

    #[test]
    fn over_budget_evicts_other_entries() {
        let cache = MetaCache::new(64);
        cache.put("first", vec![0; 40]);
        cache.put("second", vec![0; 40]);
        // the entry just inserted survives eviction
        assert!(cache.get("second").is_some());
        assert!(cache.get("first").is_none());
        assert!(cache.used() <= 64);
    }
}

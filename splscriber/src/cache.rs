//! Capacity-bounded, time-limited cache of finished label details.
//!
//! The parser never touches this; [`crate::service::LabelService`] owns one and checks it
//! before going to the label source.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::config::CacheConfig;
use crate::details::MedicationDetails;

struct Entry {
    details: Arc<MedicationDetails>,
    inserted: Instant,
}

/// LRU cache keyed by set id. Entries older than the TTL are treated as absent and evicted
/// on access.
pub struct DetailsCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl DetailsCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self::new(capacity, config.ttl())
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Entry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, set_id: &str) -> Option<Arc<MedicationDetails>> {
        let mut entries = self.lock();
        let expired = match entries.get(set_id) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                return Some(Arc::clone(&entry.details));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            debug!(%set_id, "cache entry expired");
            entries.pop(set_id);
        }
        None
    }

    pub fn insert(&self, set_id: &str, details: Arc<MedicationDetails>) {
        let entry = Entry {
            details,
            inserted: Instant::now(),
        };
        if let Some((evicted, _)) = self.lock().push(set_id.to_string(), entry) {
            if evicted != set_id {
                debug!(%evicted, "cache full, evicted least recently used entry");
            }
        }
    }

    pub fn invalidate(&self, set_id: &str) -> bool {
        self.lock().pop(set_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct LocalEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> LocalEntry<V> {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.inserted_at + self.ttl
    }
}

/// In-process tier. Expiry is checked lazily on read; expired entries are pruned then.
#[derive(Debug)]
pub struct LocalTier<V> {
    entries: Mutex<HashMap<String, LocalEntry<V>>>,
}

impl<V> Default for LocalTier<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> LocalTier<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.is_valid(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, value: V, ttl: Duration) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).insert(
            key.to_string(),
            LocalEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Insert only if `current()` still holds once the map is locked.
    pub fn insert_if(&self, key: &str, value: V, ttl: Duration, current: impl FnOnce() -> bool) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !current() {
            return false;
        }
        entries.insert(
            key.to_string(),
            LocalEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        true
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

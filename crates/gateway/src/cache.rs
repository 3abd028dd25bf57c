//! TTL cache for chain/symbol snapshots.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Thread-safe map whose entries expire after a fixed TTL.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached value if it has not expired.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        let (inserted, value) = entries.get(key)?;
        if inserted.elapsed() > self.ttl {
            return None;
        }
        Some(value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.write().insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.write().remove(key);
    }

    /// Drops every expired entry; called opportunistically by writers.
    pub fn purge_expired(&self) {
        let mut entries = self.entries.write();
        entries.retain(|_, (inserted, _)| inserted.elapsed() <= self.ttl);
    }
}

// Veritas Trust Engine: Storage Abstractions
// Repository layer for per-user/per-device state. The engine never assumes a
// single-process, unbounded-lifetime map: everything goes through the
// KeyValueStore trait, and the bundled implementation shards its keys across
// independently locked partitions so concurrent sessions do not contend on
// one global lock.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

///////////////////////////////////////////////////////////////////////////////
// Key-value store trait
///////////////////////////////////////////////////////////////////////////////

pub trait KeyValueStore<T: Clone + Send + Sync>: Send + Sync {
    fn get(&self, key: &str) -> Option<T>;

    fn put(&self, key: &str, value: T);

    fn remove(&self, key: &str) -> Option<T>;

    fn keys(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Read-modify-write under the key's lock; the closure sees the current
    // value (if any) and returns the replacement (None deletes).
    fn update(&self, key: &str, f: &mut dyn FnMut(Option<T>) -> Option<T>) -> Option<T>;
}

///////////////////////////////////////////////////////////////////////////////
// Sharded in-memory implementation
///////////////////////////////////////////////////////////////////////////////

const DEFAULT_SHARDS: usize = 16;

pub struct ShardedMemoryStore<T> {
    shards: Vec<RwLock<HashMap<String, T>>>,
}

impl<T: Clone + Send + Sync> ShardedMemoryStore<T> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1);
        let mut shards = Vec::with_capacity(count);
        for _ in 0..count {
            shards.push(RwLock::new(HashMap::new()));
        }
        ShardedMemoryStore { shards }
    }

    fn shard_for(&self, key: &str) -> &RwLock<HashMap<String, T>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }
}

impl<T: Clone + Send + Sync> Default for ShardedMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> KeyValueStore<T> for ShardedMemoryStore<T> {
    fn get(&self, key: &str) -> Option<T> {
        self.shard_for(key).read().get(key).cloned()
    }

    fn put(&self, key: &str, value: T) {
        self.shard_for(key).write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> Option<T> {
        self.shard_for(key).write().remove(key)
    }

    fn keys(&self) -> Vec<String> {
        let mut all = Vec::new();
        for shard in &self.shards {
            all.extend(shard.read().keys().cloned());
        }
        all
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    fn update(&self, key: &str, f: &mut dyn FnMut(Option<T>) -> Option<T>) -> Option<T> {
        let mut shard = self.shard_for(key).write();
        let current = shard.get(key).cloned();
        match f(current) {
            Some(next) => {
                shard.insert(key.to_string(), next.clone());
                Some(next)
            }
            None => {
                shard.remove(key);
                None
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// TTL cache
///////////////////////////////////////////////////////////////////////////////

// Expiry-aware cache used by location lookups and policy evaluation.
// Entries past their deadline are treated as absent on read; sweep() is the
// background eviction pass and is safe to call at any time.
pub struct TtlCache<T> {
    entries: RwLock<HashMap<String, (T, DateTime<Utc>)>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Some(value.clone()),
            _ => None,
        }
    }

    pub fn put(&self, key: &str, value: T, now: DateTime<Utc>) {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), (value, now + self.ttl));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.write().remove(key);
    }

    // Evict expired entries; returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Per-connection cache of prepared query metadata.
//!
//! Keys are the exact SQL text. Keys longer than the configured limit are
//! never stored or looked up. The cache is owned by one connection and has
//! no internal locking.

use std::num::NonZeroUsize;

use lru::LruCache;

use sqlwire_core::{PropertyKey, PropertySet};

/// Bounded LRU map from SQL text to metadata.
#[derive(Debug)]
pub struct QueryInfoCache<V> {
    /// `None` when the capacity is zero
    entries: Option<LruCache<String, V>>,
    max_key_length: usize,
}

impl<V> QueryInfoCache<V> {
    /// A cache holding at most `capacity` entries with keys of at most
    /// `max_key_length` bytes. A capacity of zero disables caching.
    pub fn new(capacity: usize, max_key_length: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
            max_key_length,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.as_ref().map_or(0, |c| c.cap().get())
    }

    pub fn max_key_length(&self) -> usize {
        self.max_key_length
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn accepts(&self, key: &str) -> bool {
        key.len() <= self.max_key_length
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        if !self.accepts(key) {
            return None;
        }
        self.entries.as_mut()?.get(key)
    }

    /// Look up `key` without touching recency.
    pub fn peek(&self, key: &str) -> Option<&V> {
        if !self.accepts(key) {
            return None;
        }
        self.entries.as_ref()?.peek(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Store `value` under `key`.
    ///
    /// Returns the entry that had to leave the cache: the least recently used
    /// one when full, or the previous value stored under the same key. An
    /// oversized key or a disabled cache hands the value straight back.
    pub fn put(&mut self, key: impl Into<String>, value: V) -> Option<(String, V)> {
        let key = key.into();
        if !self.accepts(&key) {
            return Some((key, value));
        }
        match self.entries.as_mut() {
            Some(entries) => entries.push(key, value),
            None => Some((key, value)),
        }
    }

    /// Remove one entry, returning it if present.
    pub fn invalidate(&mut self, key: &str) -> Option<V> {
        self.entries.as_mut()?.pop(key)
    }

    /// Remove every listed key.
    pub fn invalidate_keys<I, K>(&mut self, keys: I) -> Vec<V>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        keys.into_iter()
            .filter_map(|key| self.invalidate(key.as_ref()))
            .collect()
    }

    /// Remove everything, returning the removed values.
    pub fn invalidate_all(&mut self) -> Vec<V> {
        let Some(entries) = self.entries.as_mut() else {
            return Vec::new();
        };
        let mut removed = Vec::with_capacity(entries.len());
        while let Some((_, value)) = entries.pop_lru() {
            removed.push(value);
        }
        removed
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|entries| entries.iter().map(|(k, _)| k.as_str()))
    }
}

/// Builds caches sized from connection properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryInfoCacheFactory {
    pub capacity: usize,
    pub max_key_length: usize,
}

impl QueryInfoCacheFactory {
    /// Read `prepStmtCacheSize` and `prepStmtCacheSqlLimit`. Caching is off
    /// unless `cachePrepStmts` is set.
    pub fn from_properties(properties: &PropertySet) -> Self {
        let capacity = if properties.get_bool(PropertyKey::CachePrepStmts) {
            non_negative(properties.get_int(PropertyKey::PrepStmtCacheSize))
        } else {
            0
        };
        Self {
            capacity,
            max_key_length: non_negative(properties.get_int(PropertyKey::PrepStmtCacheSqlLimit)),
        }
    }

    pub fn create<V>(&self) -> QueryInfoCache<V> {
        QueryInfoCache::new(self.capacity, self.max_key_length)
    }
}

fn non_negative(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

use crate::{CacheEntry, CacheStats, InsertOutcome};
use kos_core::{CacheKey, CacheSettings, EmbeddingVector};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info};

struct Inner {
    entries: LruCache<CacheKey, CacheEntry<EmbeddingVector>>,
    stats: CacheStats,
}

/// Process-scoped embedding cache keyed by normalized text.
///
/// Entries are insert-if-absent: once a key has a vector it is never
/// overwritten, so concurrent computations of the same text converge on the
/// first stored value. With a non-zero capacity the least recently used entry
/// is evicted when the cache is full.
#[derive(Clone)]
pub struct EmbeddingCache {
    inner: Arc<Mutex<Inner>>,
    key_max_chars: usize,
    capacity: Option<NonZeroUsize>,
}

impl EmbeddingCache {
    /// `max_entries == 0` means unbounded.
    pub fn new(max_entries: usize, key_max_chars: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries);
        let entries = match capacity {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries,
                stats: CacheStats {
                    capacity: capacity.map(NonZeroUsize::get),
                    ..Default::default()
                },
            })),
            key_max_chars: key_max_chars.max(1),
            capacity,
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.max_entries, settings.key_max_chars)
    }

    pub fn key_max_chars(&self) -> usize {
        self.key_max_chars
    }

    /// Normalized key for `text`, using this cache's prefix length.
    pub fn key_for(&self, text: &str) -> Option<CacheKey> {
        CacheKey::normalize(text, self.key_max_chars)
    }

    /// Lookup that counts towards hit/miss stats and refreshes recency.
    pub fn get(&self, key: &CacheKey) -> Option<EmbeddingVector> {
        let mut inner = self.inner.lock();
        let found = inner.entries.get_mut(key).map(|entry| {
            entry.touch();
            entry.value.clone()
        });
        if found.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        found
    }

    pub fn get_text(&self, text: &str) -> Option<EmbeddingVector> {
        let key = self.key_for(text)?;
        self.get(&key)
    }

    /// Side-effect free lookup: no stats, no recency update.
    pub fn peek(&self, key: &CacheKey) -> Option<EmbeddingVector> {
        self.inner
            .lock()
            .entries
            .peek(key)
            .map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Stores `value` unless `key` already has one.
    pub fn insert_if_absent(&self, key: CacheKey, value: EmbeddingVector) -> InsertOutcome {
        let mut inner = self.inner.lock();
        if inner.entries.contains(&key) {
            return InsertOutcome::AlreadyPresent;
        }

        if let Some((evicted, _)) = inner.entries.push(key, CacheEntry::new(value)) {
            debug!("evicted embedding cache entry '{}'", truncate_for_log(&evicted));
            inner.stats.evictions += 1;
        }
        inner.stats.insertions += 1;
        InsertOutcome::Inserted
    }

    /// Drops every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        if removed > 0 {
            info!("embedding cache cleared ({} entries)", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity.map(NonZeroUsize::get)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.entries = inner.entries.len();
        stats.hit_rate = stats.hit_rate();
        stats
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}

fn truncate_for_log(key: &CacheKey) -> String {
    key.as_str().chars().take(40).collect()
}

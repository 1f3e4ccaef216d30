//! Bounded response cache with lazy TTL expiry and revalidation metadata.
//!
//! Eviction is strict LRU and only happens when a *new* key arrives while the
//! cache is full. Replacing the value of an existing key never evicts and does
//! not refresh its recency; reads (`get`) and `touch` do.
//!
//! Expiry is lazy: `get` treats an entry older than its TTL as absent and drops
//! it, `has` only reports presence, and `prune` sweeps in bulk.

use std::num::NonZeroUsize;

use geosync_core::{CacheConfig, SharedClock, TimestampMs};
use lru::LruCache;
use serde::Serialize;
use tracing::debug;

/// One cached value plus the metadata needed to judge and revalidate it.
///
/// Entries are replaced wholesale by [`ResponseCache::set`]; there is no
/// partial update.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub data: T,
    /// When the value was stored, epoch ms.
    pub timestamp: TimestampMs,
    /// Per-entry TTL in ms; falls back to the cache default when `None`.
    pub ttl: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, timestamp: TimestampMs) -> Self {
        Self {
            data,
            timestamp,
            ttl: None,
            etag: None,
            last_modified: None,
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_last_modified(mut self, last_modified: impl Into<String>) -> Self {
        self.last_modified = Some(last_modified.into());
        self
    }

    /// `now - timestamp > (ttl ?? default_ttl)`.
    pub fn is_expired(&self, now: TimestampMs, default_ttl_ms: u64) -> bool {
        let ttl = self.ttl.unwrap_or(default_ttl_ms);
        let age = now.saturating_sub(self.timestamp);
        age > 0 && age as u64 > ttl
    }
}

/// Process-local counters, reset by [`ResponseCache::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage in `0.0..=100.0`; zero before any lookup.
    pub hit_rate: f64,
}

/// Revalidation headers for a cached entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConditionalHeaders {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

impl ConditionalHeaders {
    pub const IF_NONE_MATCH: &'static str = "If-None-Match";
    pub const IF_MODIFIED_SINCE: &'static str = "If-Modified-Since";

    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }

    /// `(header name, value)` pairs that are present.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(2);
        if let Some(etag) = &self.if_none_match {
            pairs.push((Self::IF_NONE_MATCH, etag.clone()));
        }
        if let Some(modified) = &self.if_modified_since {
            pairs.push((Self::IF_MODIFIED_SINCE, modified.clone()));
        }
        pairs
    }
}

/// Bounded key/value store keyed by request URL.
///
/// Not internally synchronized; owners that share it across tasks wrap it in
/// a mutex.
#[derive(Debug)]
pub struct ResponseCache<T> {
    entries: LruCache<String, CacheEntry<T>>,
    config: CacheConfig,
    clock: SharedClock,
    hits: u64,
    misses: u64,
}

impl<T> ResponseCache<T> {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        let capacity = NonZeroUsize::new(config.max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            config,
            clock,
            hits: 0,
            misses: 0,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current time according to the cache's clock.
    pub fn now_ms(&self) -> TimestampMs {
        self.clock.now_ms()
    }

    /// Store an entry, replacing any previous one for `key`.
    pub fn set(&mut self, key: &str, entry: CacheEntry<T>) {
        if let Some(slot) = self.entries.peek_mut(key) {
            *slot = entry;
            return;
        }
        if let Some((evicted, _)) = self.entries.push(key.to_string(), entry) {
            debug!(key = %key, evicted = %evicted, "Cache full, evicted least recently used entry");
        }
    }

    /// Fresh entry for `key`, refreshing its recency. Expired entries are
    /// dropped and reported as misses.
    pub fn get(&mut self, key: &str) -> Option<&CacheEntry<T>> {
        let now = self.clock.now_ms();
        let expired = match self.entries.peek(key) {
            Some(entry) => entry.is_expired(now, self.config.default_ttl_ms),
            None => {
                self.misses += 1;
                return None;
            }
        };
        if expired {
            self.entries.pop(key);
            self.misses += 1;
            debug!(key = %key, "Cache entry expired");
            return None;
        }
        self.hits += 1;
        self.entries.get(key)
    }

    /// Entry for `key` regardless of expiry, without touching recency or stats.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<T>> {
        self.entries.peek(key)
    }

    /// Presence only; does not check expiry.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.pop(key).is_some()
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let now = self.clock.now_ms();
        let default_ttl = self.config.default_ttl_ms;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, default_ttl))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key.as_str());
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Pruned expired cache entries");
        }
        expired.len()
    }

    /// Mark `key` as most recently used. Returns false if absent.
    pub fn touch(&mut self, key: &str) -> bool {
        if !self.entries.contains(key) {
            return false;
        }
        self.entries.promote(key);
        true
    }

    pub fn stats(&self) -> CacheStats {
        let requests = self.hits + self.misses;
        let hit_rate = if requests == 0 {
            0.0
        } else {
            self.hits as f64 / requests as f64 * 100.0
        };
        CacheStats {
            size: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            hit_rate,
        }
    }

    /// Validators for a fresh entry. Empty when conditional requests are
    /// disabled or the entry is missing or expired.
    pub fn conditional_headers(&self, key: &str) -> ConditionalHeaders {
        if !self.config.conditional_requests {
            return ConditionalHeaders::default();
        }
        match self.entries.peek(key) {
            Some(entry) if !entry.is_expired(self.clock.now_ms(), self.config.default_ttl_ms) => {
                ConditionalHeaders {
                    if_none_match: entry.etag.clone(),
                    if_modified_since: entry.last_modified.clone(),
                }
            }
            _ => ConditionalHeaders::default(),
        }
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosync_core::ManualClock;
    use std::sync::Arc;

    fn cache_with(max_size: usize, ttl_ms: u64) -> (ResponseCache<&'static str>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let config = CacheConfig::default()
            .with_max_size(max_size)
            .with_default_ttl_ms(ttl_ms);
        (ResponseCache::new(config, clock.clone()), clock)
    }

    fn entry(cache: &ResponseCache<&'static str>, data: &'static str) -> CacheEntry<&'static str> {
        CacheEntry::new(data, cache.now_ms())
    }

    #[test]
    fn test_inserting_past_capacity_evicts_oldest() {
        let (mut cache, _) = cache_with(3, 60_000);
        for key in ["A", "B", "C", "D"] {
            let e = entry(&cache, key);
            cache.set(key, e);
        }
        assert!(!cache.has("A"));
        assert!(cache.has("B"));
        assert!(cache.has("C"));
        assert!(cache.has("D"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_updating_existing_key_never_evicts() {
        let (mut cache, _) = cache_with(3, 60_000);
        for key in ["A", "B", "C"] {
            let e = entry(&cache, key);
            cache.set(key, e);
        }
        let e = entry(&cache, "A2");
        cache.set("A", e);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.peek("A").map(|e| e.data), Some("A2"));

        // Set is recency-neutral: A is still the oldest and goes first.
        let e = entry(&cache, "D");
        cache.set("D", e);
        assert!(!cache.has("A"));
        assert!(cache.has("B"));
    }

    #[test]
    fn test_get_and_touch_refresh_recency() {
        let (mut cache, _) = cache_with(3, 60_000);
        for key in ["A", "B", "C"] {
            let e = entry(&cache, key);
            cache.set(key, e);
        }
        assert!(cache.get("A").is_some());
        assert!(cache.touch("B"));
        let e = entry(&cache, "D");
        cache.set("D", e);
        assert!(cache.has("A"));
        assert!(cache.has("B"));
        assert!(!cache.has("C"));
        assert_eq!(cache.keys(), vec!["D", "B", "A"]);
        assert!(!cache.touch("missing"));
    }

    #[test]
    fn test_expired_entry_is_absent_and_removed() {
        let (mut cache, clock) = cache_with(10, 1_000);
        let e = entry(&cache, "v");
        cache.set("k", e);

        clock.advance(1_000);
        assert!(cache.get("k").is_some(), "age == ttl is still fresh");

        clock.advance(1);
        assert!(cache.has("k"), "has() ignores expiry");
        assert!(cache.get("k").is_none());
        assert!(!cache.has("k"), "get() drops expired entries");
    }

    #[test]
    fn test_per_entry_ttl_overrides_default() {
        let (mut cache, clock) = cache_with(10, 1_000);
        let e = entry(&cache, "v").with_ttl(5_000);
        cache.set("long", e);
        clock.advance(4_000);
        assert!(cache.get("long").is_some());
        clock.advance(1_001);
        assert!(cache.get("long").is_none());
    }

    #[test]
    fn test_prune_removes_only_expired() {
        let (mut cache, clock) = cache_with(10, 1_000);
        let e = entry(&cache, "old");
        cache.set("old", e);
        clock.advance(600);
        let e = entry(&cache, "new");
        cache.set("new", e);
        clock.advance(600);
        assert_eq!(cache.prune(), 1);
        assert!(!cache.has("old"));
        assert!(cache.has("new"));
        assert_eq!(cache.prune(), 0);
    }

    #[test]
    fn test_delete_and_clear() {
        let (mut cache, _) = cache_with(10, 1_000);
        let e = entry(&cache, "v");
        cache.set("k", e);
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));

        let e = entry(&cache, "v");
        cache.set("k", e);
        cache.get("k");
        cache.get("nope");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_stats_hit_rate() {
        let (mut cache, _) = cache_with(10, 1_000);
        assert_eq!(cache.stats().hit_rate, 0.0);
        let e = entry(&cache, "v");
        cache.set("k", e);
        cache.get("k");
        cache.get("k");
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_conditional_headers() {
        let (mut cache, clock) = cache_with(10, 1_000);
        assert!(cache.conditional_headers("k").is_empty());

        let e = entry(&cache, "v")
            .with_etag("\"abc\"")
            .with_last_modified("Tue, 14 Nov 2023 22:13:20 GMT");
        cache.set("k", e);
        let headers = cache.conditional_headers("k");
        assert_eq!(headers.if_none_match.as_deref(), Some("\"abc\""));
        assert_eq!(
            headers.to_pairs(),
            vec![
                ("If-None-Match", "\"abc\"".to_string()),
                ("If-Modified-Since", "Tue, 14 Nov 2023 22:13:20 GMT".to_string()),
            ]
        );

        let e = entry(&cache, "v").with_etag("W/\"1\"");
        cache.set("etag-only", e);
        assert_eq!(cache.conditional_headers("etag-only").to_pairs().len(), 1);

        clock.advance(1_001);
        assert!(cache.conditional_headers("k").is_empty());
    }

    #[test]
    fn test_conditional_headers_disabled() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            conditional_requests: false,
            ..CacheConfig::default()
        };
        let mut cache = ResponseCache::new(config, clock);
        cache.set("k", CacheEntry::new(1, 0).with_etag("x"));
        assert!(cache.conditional_headers("k").is_empty());
    }
}

// =============================================================================
// TTL Cache — keyed, size-bounded, LRU-on-overflow
// =============================================================================
//
// Maps canonical endpoint keys ("<op>|<ticker>|<params>") to typed market-data
// values with a per-key TTL. When an insertion pushes the estimated byte total
// over budget, least-recently-used entries are evicted until the cache is back
// under budget. Eviction is logged, never surfaced as an error.
//
// An entry accessed exactly at `inserted_at + ttl` is treated as expired.
//
// Time is injected via `_at` suffixed methods for deterministic testing;
// production callers use the convenience methods without the suffix.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{ChainSnapshot, PriceBar, TickerInfo};

/// Typed cache payload, one variant per façade endpoint.
#[derive(Debug, Clone, Serialize)]
pub enum CacheValue {
    Price(f64),
    History(Vec<PriceBar>),
    Chain(ChainSnapshot),
    Expirations(Vec<chrono::NaiveDate>),
    Info(TickerInfo),
}

/// Serialisable counter snapshot for the status export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

struct Entry {
    value: CacheValue,
    inserted_at: Instant,
    ttl: Duration,
    /// Recency tick; larger = more recently used.
    last_used: u64,
    /// Estimated size of this entry in bytes.
    bytes: usize,
}

struct Inner {
    map: HashMap<String, Entry>,
    tick: u64,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Thread-safe TTL cache with an estimated byte budget.
pub struct TtlCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

/// Fixed per-entry overhead added to the serialised payload size.
const ENTRY_OVERHEAD: usize = 64;

impl TtlCache {
    /// Create a cache with the given budget in mebibytes.
    pub fn new(max_mb: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                tick: 0,
                total_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_bytes: (max_mb as usize) * 1024 * 1024,
        }
    }

    /// Look up `key`, honouring TTL. An expired entry is removed on access and
    /// counts as a miss. Updates per-key recency on hit.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<CacheValue> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        let expired = match inner.map.get_mut(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => {
                if now.duration_since(entry.inserted_at) >= entry.ttl {
                    true
                } else {
                    entry.last_used = tick;
                    let value = entry.value.clone();
                    inner.hits += 1;
                    return Some(value);
                }
            }
        };

        if expired {
            if let Some(entry) = inner.map.remove(key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
            }
            inner.misses += 1;
        }
        None
    }

    /// Look up `key` ignoring TTL, returning the value together with its age.
    ///
    /// Used by the market-data façade while the market is closed, when a stale
    /// answer captured after the last close is still authoritative. The entry
    /// is left in place.
    pub fn get_stale(&self, key: &str) -> Option<(CacheValue, Duration)> {
        self.get_stale_at(key, Instant::now())
    }

    pub fn get_stale_at(&self, key: &str, now: Instant) -> Option<(CacheValue, Duration)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.map.get_mut(key)?;
        entry.last_used = tick;
        Some((entry.value.clone(), now.duration_since(entry.inserted_at)))
    }

    /// Insert or replace `key`. When the byte budget is exceeded, evict
    /// least-recently-used entries (never the one just inserted) until the
    /// cache is back under budget.
    pub fn set(&self, key: &str, value: CacheValue, ttl: Duration) {
        self.set_at(key, value, ttl, Instant::now());
    }

    pub fn set_at(&self, key: &str, value: CacheValue, ttl: Duration, now: Instant) {
        let bytes = estimate_bytes(key, &value);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(old) = inner.map.insert(
            key.to_string(),
            Entry { value, inserted_at: now, ttl, last_used: tick, bytes },
        ) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.bytes);
        }
        inner.total_bytes += bytes;

        while inner.total_bytes > self.max_bytes {
            let victim = inner
                .map
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match victim {
                Some(victim_key) => {
                    if let Some(entry) = inner.map.remove(&victim_key) {
                        inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
                        inner.evictions += 1;
                        debug!(key = %victim_key, bytes = entry.bytes, "cache entry evicted (LRU)");
                    }
                }
                // Only the just-inserted entry remains; it may exceed the
                // budget on its own.
                None => break,
            }
        }

        if inner.total_bytes > self.max_bytes {
            warn!(
                bytes = inner.total_bytes,
                budget = self.max_bytes,
                "single cache entry exceeds the configured budget"
            );
        }
    }

    /// Remove a single key.
    pub fn invalidate(&self, key: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(entry) = inner.map.remove(key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
        }
    }

    /// Remove all entries. Counters are preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.total_bytes = 0;
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.map.len(),
            bytes: inner.total_bytes,
        }
    }
}

/// Estimated footprint: serialised payload plus key and bookkeeping overhead.
fn estimate_bytes(key: &str, value: &CacheValue) -> usize {
    let payload = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(256);
    payload + key.len() + ENTRY_OVERHEAD
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn get_missing_is_none() {
        let cache = TtlCache::new(1);
        assert!(cache.get("nope").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn set_then_get_within_ttl() {
        let cache = TtlCache::new(1);
        let now = Instant::now();
        cache.set_at("price|AAPL", CacheValue::Price(191.5), secs(60), now);
        match cache.get_at("price|AAPL", now + secs(30)) {
            Some(CacheValue::Price(p)) => assert!((p - 191.5).abs() < 1e-12),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn entry_expires_exactly_at_ttl() {
        let cache = TtlCache::new(1);
        let now = Instant::now();
        cache.set_at("k", CacheValue::Price(1.0), secs(60), now);
        // One nanosecond before the boundary: still valid.
        assert!(cache
            .get_at("k", now + secs(60) - Duration::from_nanos(1))
            .is_some());
        cache.set_at("k", CacheValue::Price(1.0), secs(60), now);
        // Exactly at the boundary: expired.
        assert!(cache.get_at("k", now + secs(60)).is_none());
        // The expired entry was removed on access.
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn replace_updates_value_and_bytes() {
        let cache = TtlCache::new(1);
        let now = Instant::now();
        cache.set_at("k", CacheValue::Price(1.0), secs(60), now);
        let bytes_one = cache.stats().bytes;
        cache.set_at("k", CacheValue::Price(2.0), secs(60), now);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().bytes, bytes_one);
        match cache.get_at("k", now) {
            Some(CacheValue::Price(p)) => assert!((p - 2.0).abs() < 1e-12),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn lru_eviction_under_budget_pressure() {
        // Zero-MiB budget forces eviction down to the single latest entry.
        let cache = TtlCache::new(0);
        let now = Instant::now();
        cache.set_at("a", CacheValue::Price(1.0), secs(60), now);
        cache.set_at("b", CacheValue::Price(2.0), secs(60), now);
        // "a" (least recently used) must be gone; "b" survives as the last
        // inserted entry even though the budget is zero.
        assert!(cache.get_at("a", now).is_none());
        assert!(cache.get_at("b", now).is_some());
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn recency_protects_recently_read_keys() {
        let cache = TtlCache::new(1);
        let now = Instant::now();
        cache.set_at("old", CacheValue::Price(1.0), secs(60), now);
        cache.set_at("young", CacheValue::Price(2.0), secs(60), now);
        // Touch "old" so that "young" becomes the LRU candidate.
        let _ = cache.get_at("old", now);

        let inner_check = |c: &TtlCache| {
            let inner = c.inner.lock();
            let old = inner.map.get("old").map(|e| e.last_used);
            let young = inner.map.get("young").map(|e| e.last_used);
            (old, young)
        };
        let (old, young) = inner_check(&cache);
        assert!(old.unwrap() > young.unwrap());
    }

    #[test]
    fn invalidate_and_clear() {
        let cache = TtlCache::new(1);
        let now = Instant::now();
        cache.set_at("a", CacheValue::Price(1.0), secs(60), now);
        cache.set_at("b", CacheValue::Price(2.0), secs(60), now);
        cache.invalidate("a");
        assert!(cache.get_at("a", now).is_none());
        assert!(cache.get_at("b", now).is_some());
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn stale_read_ignores_ttl_and_reports_age() {
        let cache = TtlCache::new(1);
        let now = Instant::now();
        cache.set_at("k", CacheValue::Price(5.0), secs(60), now);
        let (value, age) = cache.get_stale_at("k", now + secs(3600)).unwrap();
        match value {
            CacheValue::Price(p) => assert!((p - 5.0).abs() < 1e-12),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(age, secs(3600));
        // The entry is left in place.
        assert_eq!(cache.stats().entries, 1);
    }
}

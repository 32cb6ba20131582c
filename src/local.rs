//! Bounded local cache (the in-process tier).
//!
//! Capacity-limited LRU with per-entry TTL. Expiry is lazy on read plus a
//! periodic sweep owned by the engine. Operations never suspend; interior
//! mutability goes through the poisoned-lock recovery helpers.

use std::sync::RwLock;
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use crate::config::LocalCacheSettings;
use crate::keys::KeyPattern;
use crate::lock::{rw_read, rw_write};
use crate::stats::{
    METRIC_LOCAL_EVICT, METRIC_LOCAL_HIT, METRIC_LOCAL_MISS, METRIC_SWEEP_REMOVED, TierCounters,
    TierSnapshot,
};

const SOURCE: &str = "local";

/// A value read out of a cache tier, with the provenance the SWR protocol
/// needs to compute its age.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl CachedValue {
    /// Age of the value relative to `now`.
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        (now - self.created_at).try_into().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Value,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    last_accessed: OffsetDateTime,
    hit_count: u64,
    approx_size: usize,
}

/// In-process bounded cache.
///
/// Eviction is LRU: under the touch-on-read policy the least recently used
/// entry is exactly the one with the oldest `last_accessed`.
pub struct LocalCache {
    entries: RwLock<LruCache<String, LocalEntry>>,
    ttl_cap: Duration,
    counters: TierCounters,
}

impl LocalCache {
    pub fn new(settings: &LocalCacheSettings) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(settings.capacity_non_zero())),
            ttl_cap: settings.ttl_cap(),
            counters: TierCounters::default(),
        }
    }

    /// Look up a key, promoting it in the recency order.
    ///
    /// Expired entries are removed on sight and reported as misses.
    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let now = OffsetDateTime::now_utc();
        let mut entries = rw_write(&self.entries, SOURCE, "get");

        let expired = match entries.get_mut(key) {
            Some(entry) if now < entry.expires_at => {
                entry.last_accessed = now;
                entry.hit_count += 1;
                let cached = CachedValue {
                    value: entry.value.clone(),
                    created_at: entry.created_at,
                    expires_at: entry.expires_at,
                };
                self.counters.record_hit();
                counter!(METRIC_LOCAL_HIT).increment(1);
                return Some(cached);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
        }
        self.counters.record_miss();
        counter!(METRIC_LOCAL_MISS).increment(1);
        None
    }

    /// Store a value for `ttl`, clamped to the configured local cap.
    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        let now = OffsetDateTime::now_utc();
        self.insert_entry(key, value, now, now + ttl);
    }

    /// Store a value that originated elsewhere, preserving its creation
    /// time so SWR age stays consistent across tiers. The expiry is still
    /// clamped to the local cap.
    pub(crate) fn insert_entry(
        &self,
        key: &str,
        value: Value,
        created_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) {
        let now = OffsetDateTime::now_utc();
        let capped = expires_at.min(now + self.ttl_cap);
        if capped <= now {
            return;
        }

        let entry = LocalEntry {
            approx_size: value.to_string().len(),
            value,
            created_at,
            expires_at: capped,
            last_accessed: now,
            hit_count: 0,
        };

        let mut entries = rw_write(&self.entries, SOURCE, "set");
        if let Some((evicted_key, _)) = entries.push(key.to_string(), entry)
            && evicted_key != key
        {
            self.counters.record_eviction();
            counter!(METRIC_LOCAL_EVICT).increment(1);
        }
    }

    /// Remove a key. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        rw_write(&self.entries, SOURCE, "delete").pop(key).is_some()
    }

    /// Whether a live (non-expired) entry exists, without touching recency
    /// or counters.
    pub fn has(&self, key: &str) -> bool {
        let now = OffsetDateTime::now_utc();
        rw_read(&self.entries, SOURCE, "has")
            .peek(key)
            .is_some_and(|entry| now < entry.expires_at)
    }

    /// Remove every entry matching the pattern. Returns the removed count.
    pub fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate_pattern");
        let matched: Vec<String> = entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matched {
            entries.pop(key);
        }
        matched.len()
    }

    /// Drop expired entries to bound memory between accesses.
    ///
    /// Called periodically by the engine; lazy expiry on read covers hot
    /// keys, the sweep covers the ones nobody asks for anymore.
    pub fn sweep(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut entries = rw_write(&self.entries, SOURCE, "sweep");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            counter!(METRIC_SWEEP_REMOVED).increment(expired.len() as u64);
            debug!(
                target = "strata::local",
                removed = expired.len(),
                "sweep removed expired entries"
            );
        }
        expired.len()
    }

    /// The `n` most frequently hit live entries, descending.
    pub fn hot_keys(&self, n: usize) -> Vec<(String, u64)> {
        let now = OffsetDateTime::now_utc();
        let entries = rw_read(&self.entries, SOURCE, "hot_keys");
        let mut hits: Vec<(String, u64)> = entries
            .iter()
            .filter(|(_, entry)| now < entry.expires_at)
            .map(|(key, entry)| (key.clone(), entry.hit_count))
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1));
        hits.truncate(n);
        hits
    }

    /// Approximate memory footprint of live entries, in bytes.
    pub fn approx_size(&self) -> usize {
        rw_read(&self.entries, SOURCE, "approx_size")
            .iter()
            .map(|(_, entry)| entry.approx_size)
            .sum()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    pub fn stats(&self) -> TierSnapshot {
        self.counters.snapshot()
    }
}

//! Shared tier client (the distributed tier).
//!
//! Values are stored as a serialized envelope carrying `created_at`, so the
//! SWR protocol can compute age independently of the store's remaining TTL.
//! Every stored key is also registered into per-pattern index sets, letting
//! pattern invalidation resolve members in O(matched) instead of scanning
//! the key space.
//!
//! This client never throws to its caller: transport and decode failures
//! are logged, counted, and degrade to a miss.

mod backend;

pub use backend::{KvBackend, MemoryBackend};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::SharedTierSettings;
use crate::keys::{KeyPattern, prefix_patterns};
use crate::local::CachedValue;
use crate::stats::{METRIC_SHARED_ERROR, METRIC_SHARED_HIT, METRIC_SHARED_MISS, TierCounters, TierSnapshot};

const INDEX_PREFIX: &str = "idx:";
const COUNTER_PREFIX: &str = "cnt:";

/// Serialized envelope for shared-tier values.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy)]
struct ObservedCount {
    count: u64,
    recorded_at: OffsetDateTime,
}

/// Client for the shared key-value tier.
pub struct SharedTier {
    backend: Arc<dyn KvBackend>,
    index_grace: Duration,
    counter_window: Duration,
    counters: TierCounters,
    /// Latest rolling-window counts observed per key, kept only for
    /// hot-key ranking; the authoritative counters live in the store.
    observed_counts: DashMap<String, ObservedCount>,
}

impl SharedTier {
    pub fn new(backend: Arc<dyn KvBackend>, settings: &SharedTierSettings) -> Self {
        Self {
            backend,
            index_grace: settings.index_grace(),
            counter_window: settings.counter_window(),
            counters: TierCounters::default(),
            observed_counts: DashMap::new(),
        }
    }

    /// Look up a key. Transport failures and undecodable payloads degrade
    /// to a miss; the latter also evicts the offending entry.
    pub async fn get(&self, key: &str) -> Option<CachedValue> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw,
            Err(err) => {
                self.absorb("get", key, &err);
                return self.miss();
            }
        };

        let Some(raw) = raw else {
            return self.miss();
        };

        let entry: StoredEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    target = "strata::shared",
                    key,
                    error = %err,
                    "evicting undecodable shared-tier entry"
                );
                let _ = self.backend.delete(&[key.to_string()]).await;
                return self.miss();
            }
        };

        if OffsetDateTime::now_utc() >= entry.expires_at {
            return self.miss();
        }

        self.counters.record_hit();
        counter!(METRIC_SHARED_HIT).increment(1);
        self.record_access(key).await;

        Some(CachedValue {
            value: entry.value,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        })
    }

    /// Store a value and register it in the pattern index.
    ///
    /// Returns whether the value itself was stored; index registration is
    /// best-effort on top of that.
    pub async fn set(&self, key: &str, value: Value, ttl: Duration) -> bool {
        let now = OffsetDateTime::now_utc();
        let entry = StoredEntry {
            value,
            created_at: now,
            expires_at: now + ttl,
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    target = "strata::shared",
                    key,
                    error = %err,
                    "failed to serialize entry for shared tier"
                );
                return false;
            }
        };

        if let Err(err) = self.backend.set_with_ttl(key, raw, ttl).await {
            self.absorb("set", key, &err);
            return false;
        }

        // Index expiry outlives the entry by the grace period so the index
        // never forgets a key that is still live.
        let index_ttl = ttl + self.index_grace;
        for pattern in prefix_patterns(key) {
            if let Err(err) = self
                .backend
                .add_to_set(&format!("{INDEX_PREFIX}{pattern}"), key, index_ttl)
                .await
            {
                self.absorb("index", key, &err);
                break;
            }
        }
        true
    }

    /// Remove a key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.delete(&[key.to_string()]).await {
            Ok(removed) => removed > 0,
            Err(err) => {
                self.absorb("delete", key, &err);
                false
            }
        }
    }

    /// Whether a live entry exists. Does not touch counters.
    pub async fn has(&self, key: &str) -> bool {
        match self.backend.get(key).await {
            Ok(Some(raw)) => serde_json::from_str::<StoredEntry>(&raw)
                .is_ok_and(|entry| OffsetDateTime::now_utc() < entry.expires_at),
            Ok(None) => false,
            Err(err) => {
                self.absorb("has", key, &err);
                false
            }
        }
    }

    /// Remove every key matching the pattern, resolving members through the
    /// pattern index. Returns the removed count.
    pub async fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        match pattern {
            KeyPattern::Exact(key) => usize::from(self.delete(key).await),
            KeyPattern::Prefix(_) => {
                let index_key = format!("{INDEX_PREFIX}{pattern}");
                let members = match self.backend.set_members(&index_key).await {
                    Ok(members) => members,
                    Err(err) => {
                        self.absorb("invalidate_pattern", &index_key, &err);
                        return 0;
                    }
                };
                if members.is_empty() {
                    return 0;
                }

                // The index may contain keys whose entries already expired;
                // count only the ones actually removed.
                match self.backend.delete(&members).await {
                    Ok(removed) => {
                        let _ = self.backend.delete(&[index_key]).await;
                        debug!(
                            target = "strata::shared",
                            pattern = %pattern,
                            removed,
                            "pattern invalidation completed"
                        );
                        removed as usize
                    }
                    Err(err) => {
                        self.absorb("invalidate_pattern", &pattern.to_string(), &err);
                        0
                    }
                }
            }
        }
    }

    /// The `n` most accessed keys within the rolling window, descending.
    pub fn hot_keys(&self, n: usize) -> Vec<(String, u64)> {
        let now = OffsetDateTime::now_utc();
        self.observed_counts
            .retain(|_, observed| now - observed.recorded_at < self.counter_window);

        let mut hits: Vec<(String, u64)> = self
            .observed_counts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().count))
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1));
        hits.truncate(n);
        hits
    }

    /// Liveness of the backing store.
    pub async fn ping(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(target = "strata::shared", error = %err, "shared tier ping failed");
                false
            }
        }
    }

    pub fn stats(&self) -> TierSnapshot {
        self.counters.snapshot()
    }

    async fn record_access(&self, key: &str) {
        let counter_key = format!("{COUNTER_PREFIX}{key}");
        match self
            .backend
            .incr_with_window(&counter_key, self.counter_window)
            .await
        {
            Ok(count) => {
                self.observed_counts.insert(
                    key.to_string(),
                    ObservedCount {
                        count,
                        recorded_at: OffsetDateTime::now_utc(),
                    },
                );
            }
            // Access accounting is advisory; a failed increment is not a
            // degraded read.
            Err(err) => {
                debug!(target = "strata::shared", key, error = %err, "access counter increment failed");
            }
        }
    }

    fn miss(&self) -> Option<CachedValue> {
        self.counters.record_miss();
        counter!(METRIC_SHARED_MISS).increment(1);
        None
    }

    fn absorb(&self, op: &'static str, key: &str, err: &crate::error::TransportError) {
        self.counters.record_error();
        counter!(METRIC_SHARED_ERROR).increment(1);
        warn!(
            target = "strata::shared",
            op,
            key,
            error = %err,
            "shared tier operation failed, degrading to miss"
        );
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::TransportError;

    use super::*;

    /// Backend that fails every operation, for outage behavior tests.
    struct DownBackend;

    #[async_trait]
    impl KvBackend for DownBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }

        async fn set_with_ttl(
            &self,
            _key: &str,
            _value: String,
            _ttl: Duration,
        ) -> Result<(), TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _keys: &[String]) -> Result<u64, TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }

        async fn add_to_set(
            &self,
            _key: &str,
            _member: &str,
            _ttl: Duration,
        ) -> Result<(), TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }

        async fn set_members(&self, _key: &str) -> Result<Vec<String>, TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }

        async fn incr_with_window(
            &self,
            _key: &str,
            _window: Duration,
        ) -> Result<u64, TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }

        async fn ping(&self) -> Result<(), TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }
    }

    fn tier() -> SharedTier {
        SharedTier::new(
            Arc::new(MemoryBackend::new()),
            &SharedTierSettings::default(),
        )
    }

    #[tokio::test]
    async fn roundtrip_preserves_created_at() {
        let tier = tier();
        assert!(tier.set("l:detail:1", json!({"id": 1}), Duration::from_secs(60)).await);

        let cached = tier.get("l:detail:1").await.expect("cached value");
        assert_eq!(cached.value, json!({"id": 1}));
        assert!(cached.created_at <= OffsetDateTime::now_utc());
        assert!(cached.expires_at > cached.created_at);
        assert!(tier.has("l:detail:1").await);
    }

    #[tokio::test]
    async fn pattern_invalidation_uses_the_index() {
        let tier = tier();
        tier.set("l:search:a", json!(1), Duration::from_secs(60)).await;
        tier.set("l:search:b", json!(2), Duration::from_secs(60)).await;
        tier.set("l:detail:1", json!(3), Duration::from_secs(60)).await;

        let pattern = KeyPattern::parse("l:search:*").expect("valid pattern");
        assert_eq!(tier.invalidate_pattern(&pattern).await, 2);
        assert!(tier.get("l:search:a").await.is_none());
        assert!(tier.get("l:search:b").await.is_none());
        assert!(tier.get("l:detail:1").await.is_some());

        // Index is cleared along with the members.
        assert_eq!(tier.invalidate_pattern(&pattern).await, 0);
    }

    #[tokio::test]
    async fn exact_pattern_deletes_single_key() {
        let tier = tier();
        tier.set("l:detail:1", json!(1), Duration::from_secs(60)).await;

        let pattern = KeyPattern::parse("l:detail:1").expect("valid pattern");
        assert_eq!(tier.invalidate_pattern(&pattern).await, 1);
        assert!(tier.get("l:detail:1").await.is_none());
    }

    #[tokio::test]
    async fn undecodable_entry_is_evicted_as_miss() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set_with_ttl("l:detail:1", "not json".to_string(), Duration::from_secs(60))
            .await
            .expect("raw set");

        let tier = SharedTier::new(backend.clone(), &SharedTierSettings::default());
        assert!(tier.get("l:detail:1").await.is_none());
        assert_eq!(backend.get("l:detail:1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn outage_degrades_to_miss_without_error() {
        let tier = SharedTier::new(Arc::new(DownBackend), &SharedTierSettings::default());

        assert!(!tier.set("k:1", json!(1), Duration::from_secs(60)).await);
        assert!(tier.get("k:1").await.is_none());
        assert!(!tier.delete("k:1").await);
        let pattern = KeyPattern::parse("k:*").expect("valid pattern");
        assert_eq!(tier.invalidate_pattern(&pattern).await, 0);
        assert!(!tier.ping().await);

        let stats = tier.stats();
        assert!(stats.errors >= 4);
    }

    #[tokio::test]
    async fn hot_keys_rank_by_observed_count() {
        let tier = tier();
        tier.set("k:a", json!(1), Duration::from_secs(60)).await;
        tier.set("k:b", json!(2), Duration::from_secs(60)).await;
        for _ in 0..3 {
            tier.get("k:b").await;
        }
        tier.get("k:a").await;

        let hot = tier.hot_keys(2);
        assert_eq!(hot[0].0, "k:b");
        assert_eq!(hot[0].1, 3);
        assert_eq!(hot[1].0, "k:a");
    }
}

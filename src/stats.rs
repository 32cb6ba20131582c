//! Running counters and health reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// Metric names, described once in `telemetry::init`.
pub(crate) const METRIC_LOCAL_HIT: &str = "strata_cache_local_hit_total";
pub(crate) const METRIC_LOCAL_MISS: &str = "strata_cache_local_miss_total";
pub(crate) const METRIC_LOCAL_EVICT: &str = "strata_cache_local_evict_total";
pub(crate) const METRIC_SHARED_HIT: &str = "strata_cache_shared_hit_total";
pub(crate) const METRIC_SHARED_MISS: &str = "strata_cache_shared_miss_total";
pub(crate) const METRIC_SHARED_ERROR: &str = "strata_cache_shared_error_total";
pub(crate) const METRIC_REVALIDATION: &str = "strata_cache_revalidation_total";
pub(crate) const METRIC_PRECOMPUTE: &str = "strata_cache_precompute_total";
pub(crate) const METRIC_SWEEP_REMOVED: &str = "strata_cache_sweep_removed_total";
pub(crate) const METRIC_WARM_MS: &str = "strata_cache_warm_ms";

/// Lock-free hit/miss/eviction/error counters for one tier.
#[derive(Debug, Default)]
pub struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

impl TierCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub errors: u64,
}

impl TierSnapshot {
    /// Hit ratio over all recorded lookups, or `None` before any traffic.
    pub fn hit_ratio(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        (total > 0).then(|| self.hits as f64 / total as f64)
    }
}

/// Aggregate statistics exposed by the facade.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub local: TierSnapshot,
    pub shared: TierSnapshot,
    pub local_entries: usize,
    pub in_flight: usize,
}

/// Engine health.
///
/// The shared tier being unreachable degrades the engine (the local tier
/// still serves) but never makes it unhealthy on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
        }
    }
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: Health,
    pub shared_reachable: bool,
    pub local_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = TierCounters::default();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        counters.record_eviction();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.evictions, 1);
        assert_eq!(snapshot.errors, 0);
    }

    #[test]
    fn hit_ratio_handles_empty_counters() {
        assert_eq!(TierSnapshot::default().hit_ratio(), None);

        let counters = TierCounters::default();
        counters.record_hit();
        counters.record_miss();
        let ratio = counters.snapshot().hit_ratio().expect("ratio");
        assert!((ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn health_serializes_lowercase() {
        assert_eq!(Health::Degraded.as_str(), "degraded");
        let json = serde_json::to_string(&Health::Healthy).expect("serialize");
        assert_eq!(json, "\"healthy\"");
    }
}

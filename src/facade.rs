//! Unified cache facade.
//!
//! Composes the local and shared tiers behind one read/write-through API
//! and implements the stale-while-revalidate protocol with per-key
//! deduplication of background refreshes. All consumers — request
//! handlers, the invalidation manager, the warming engine — go through
//! this facade; nothing writes to a tier directly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{BoxError, CacheError, ConfigError};
use crate::inflight::InFlight;
use crate::keys::KeyPattern;
use crate::local::{CachedValue, LocalCache};
use crate::shared::SharedTier;
use crate::stats::{CacheStats, Health, HealthReport, METRIC_REVALIDATION};

/// Per-call tier selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    pub skip_local: bool,
    pub skip_shared: bool,
}

/// Stale-while-revalidate windows.
///
/// Values younger than `fresh_ttl` are served as-is; values between
/// `fresh_ttl` and `stale_ttl` are served while a background refresh runs;
/// older values force a synchronous refresh with the stale value as
/// fallback.
#[derive(Debug, Clone, Copy)]
pub struct SwrOptions {
    fresh_ttl: Duration,
    stale_ttl: Duration,
}

impl SwrOptions {
    /// Build validated windows. `fresh_ttl > stale_ttl` is a configuration
    /// error and fails here, never at serve time.
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> Result<Self, ConfigError> {
        if fresh_ttl > stale_ttl {
            return Err(ConfigError::invalid(format!(
                "fresh_ttl ({fresh_ttl:?}) must not exceed stale_ttl ({stale_ttl:?})"
            )));
        }
        Ok(Self {
            fresh_ttl,
            stale_ttl,
        })
    }

    pub fn fresh_ttl(&self) -> Duration {
        self.fresh_ttl
    }

    pub fn stale_ttl(&self) -> Duration {
        self.stale_ttl
    }
}

#[derive(Debug, Clone, Copy)]
struct Tuning {
    local_enabled: bool,
    shared_enabled: bool,
    fallback_grace: Duration,
    fetch_timeout: Duration,
}

/// Two-tier cache facade with SWR.
///
/// Cheap to clone; clones share the same tiers, in-flight registry, and
/// background-refresh budget.
#[derive(Clone)]
pub struct TieredCache {
    local: Arc<LocalCache>,
    shared: Arc<SharedTier>,
    inflight: Arc<InFlight>,
    refreshes: Arc<Semaphore>,
    tuning: Tuning,
}

impl TieredCache {
    pub fn new(
        local: Arc<LocalCache>,
        shared: Arc<SharedTier>,
        settings: &Settings,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            local,
            shared,
            inflight: Arc::new(InFlight::new()),
            refreshes: Arc::new(Semaphore::new(settings.swr.max_background_refreshes)),
            tuning: Tuning {
                local_enabled: settings.local.enabled,
                shared_enabled: settings.shared.enabled,
                fallback_grace: settings.swr.fallback_grace(),
                fetch_timeout: settings.swr.fetch_timeout(),
            },
        })
    }

    /// Read through the tiers: local first, then shared with promotion
    /// into the local tier (under its TTL cap).
    pub async fn get(&self, key: &str, opts: &CacheOptions) -> Option<Value> {
        self.lookup(key, opts).await.map(|cached| cached.value)
    }

    /// Write through both tiers. A shared-tier failure only affects
    /// cross-instance visibility, so a local-only write is tolerated and
    /// logged rather than surfaced.
    pub async fn set(&self, key: &str, value: Value, ttl: Duration, opts: &CacheOptions) {
        let shared_ok = if self.tuning.shared_enabled && !opts.skip_shared {
            self.shared.set(key, value.clone(), ttl).await
        } else {
            true
        };
        if self.tuning.local_enabled && !opts.skip_local {
            self.local.set(key, value, ttl);
            if !shared_ok {
                warn!(
                    target = "strata::facade",
                    key, "stored in local tier only; cross-instance visibility reduced"
                );
            }
        }
    }

    /// Remove a key from both tiers. Returns whether either tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let local = self.tuning.local_enabled && self.local.delete(key);
        let shared = self.tuning.shared_enabled && self.shared.delete(key).await;
        local || shared
    }

    /// Whether a live entry exists in either tier.
    pub async fn has(&self, key: &str) -> bool {
        if self.tuning.local_enabled && self.local.has(key) {
            return true;
        }
        self.tuning.shared_enabled && self.shared.has(key).await
    }

    /// Look up several keys, preserving order.
    pub async fn get_multiple(&self, keys: &[String], opts: &CacheOptions) -> Vec<Option<Value>> {
        let lookups = keys.iter().map(|key| self.get(key, opts));
        futures::future::join_all(lookups).await
    }

    /// Store several entries under one TTL.
    pub async fn set_multiple(&self, entries: Vec<(String, Value)>, ttl: Duration) {
        for (key, value) in entries {
            self.set(&key, value, ttl, &CacheOptions::default()).await;
        }
    }

    /// Invalidate a pattern in both tiers, returning the summed count.
    pub async fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        let mut removed = 0;
        if self.tuning.local_enabled {
            removed += self.local.invalidate_pattern(pattern);
        }
        if self.tuning.shared_enabled {
            removed += self.shared.invalidate_pattern(pattern).await;
        }
        removed
    }

    /// Stale-while-revalidate read.
    ///
    /// - absent → synchronous fetch (caller bears the latency; errors
    ///   propagate);
    /// - fresh → cached value, no side effects;
    /// - stale → cached value now, at most one background refresh per key;
    /// - expired → synchronous fetch, falling back to the expired value if
    ///   the fetch fails and one is still retained.
    pub async fn get_with_swr<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        opts: &SwrOptions,
    ) -> Result<Value, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        let Some(cached) = self.lookup(key, &CacheOptions::default()).await else {
            return self.refresh_sync(key, fetch, opts, None).await;
        };

        let age = cached.age(OffsetDateTime::now_utc());
        if age < opts.fresh_ttl {
            return Ok(cached.value);
        }
        if age < opts.stale_ttl {
            self.spawn_revalidation(key, fetch, opts);
            return Ok(cached.value);
        }
        self.refresh_sync(key, fetch, opts, Some(cached.value)).await
    }

    /// Running counters and sizes for both tiers.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local: self.local.stats(),
            shared: self.shared.stats(),
            local_entries: self.local.len(),
            in_flight: self.inflight.len(),
        }
    }

    /// Probe engine health. An unreachable shared tier degrades the engine
    /// but does not make it unhealthy: the local tier still serves.
    pub async fn health_check(&self) -> HealthReport {
        let shared_reachable = if self.tuning.shared_enabled {
            self.shared.ping().await
        } else {
            true
        };
        HealthReport {
            status: if shared_reachable {
                Health::Healthy
            } else {
                Health::Degraded
            },
            shared_reachable,
            local_entries: self.local.len(),
        }
    }

    /// The local tier (sweep, hot keys).
    pub fn local(&self) -> &Arc<LocalCache> {
        &self.local
    }

    /// The shared tier (hot keys).
    pub fn shared(&self) -> &Arc<SharedTier> {
        &self.shared
    }

    /// The in-flight registry; lets callers await pending background
    /// refreshes (used by tests and shutdown).
    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.inflight
    }

    async fn lookup(&self, key: &str, opts: &CacheOptions) -> Option<CachedValue> {
        if self.tuning.local_enabled
            && !opts.skip_local
            && let Some(cached) = self.local.get(key)
        {
            return Some(cached);
        }

        if self.tuning.shared_enabled
            && !opts.skip_shared
            && let Some(cached) = self.shared.get(key).await
        {
            if self.tuning.local_enabled && !opts.skip_local {
                self.local.insert_entry(
                    key,
                    cached.value.clone(),
                    cached.created_at,
                    cached.expires_at,
                );
            }
            return Some(cached);
        }
        None
    }

    async fn refresh_sync<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        opts: &SwrOptions,
        fallback: Option<Value>,
    ) -> Result<Value, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, BoxError>>,
    {
        match self.run_fetch(key, fetch).await {
            Ok(value) => {
                self.store_refreshed(key, value.clone(), opts).await;
                Ok(value)
            }
            Err(err) => match fallback {
                Some(stale) => {
                    warn!(
                        target = "strata::facade",
                        key,
                        error = %err,
                        "refresh failed, serving retained stale value"
                    );
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    fn spawn_revalidation<F, Fut>(&self, key: &str, fetch: F, opts: &SwrOptions)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        // Single atomic check-and-insert: losing claimants drop their fetch
        // without running it.
        let Some(guard) = self.inflight.begin(key) else {
            debug!(
                target = "strata::facade",
                key, "revalidation already in flight"
            );
            return;
        };

        counter!(METRIC_REVALIDATION).increment(1);
        let cache = self.clone();
        let key = key.to_string();
        let opts = *opts;
        tokio::spawn(async move {
            let _guard = guard;
            // The semaphore bounds concurrent refreshes so a burst of
            // simultaneous expiries cannot stampede the upstream.
            let Ok(_permit) = cache.refreshes.clone().acquire_owned().await else {
                return;
            };
            match cache.run_fetch(&key, fetch).await {
                Ok(value) => {
                    cache.store_refreshed(&key, value, &opts).await;
                    debug!(
                        target = "strata::facade",
                        key, "background revalidation stored fresh value"
                    );
                }
                Err(err) => {
                    warn!(
                        target = "strata::facade",
                        key,
                        error = %err,
                        "background revalidation failed, stale value remains"
                    );
                }
            }
        });
    }

    async fn run_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Value, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, BoxError>>,
    {
        match tokio::time::timeout(self.tuning.fetch_timeout, fetch()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(CacheError::upstream(key, source)),
            Err(_) => Err(CacheError::UpstreamTimeout {
                key: key.to_string(),
                timeout: self.tuning.fetch_timeout,
            }),
        }
    }

    /// Store a refreshed value with a horizon covering the full stale
    /// window plus the fallback grace, so a later failed refresh still has
    /// something to fall back to.
    async fn store_refreshed(&self, key: &str, value: Value, opts: &SwrOptions) {
        let ttl = opts.stale_ttl + self.tuning.fallback_grace;
        self.set(key, value, ttl, &CacheOptions::default()).await;
    }
}

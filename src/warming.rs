//! Precomputation and warming.
//!
//! The warmer proactively computes full responses and stores them through
//! the facade under the `precomputed:` namespace with priority-scaled TTLs.
//! Serving is strictly pull-only: `get_precomputed` never computes. A warm
//! cycle recomputes the declared primary query set, derives a secondary set
//! from the primary results, and best-effort preloads auxiliary resources,
//! with bounded concurrency and per-item failure isolation throughout.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WarmingSettings;
use crate::error::{BoxError, CacheError};
use crate::facade::{CacheOptions, TieredCache};
use crate::inflight::InFlight;
use crate::keys::content_fingerprint;
use crate::stats::{METRIC_PRECOMPUTE, METRIC_WARM_MS};

/// Namespace prefix for precomputed responses.
pub const PRECOMPUTED_NAMESPACE: &str = "precomputed";

/// Warming priority; scales the stored TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Response metadata generated alongside a precomputed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub generated_at: OffsetDateTime,
    /// SHA-256 over the serialized payload; doubles as an ETag source.
    pub fingerprint: String,
}

/// A fully precomputed response, ready to serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecomputedResponse {
    pub payload: Value,
    pub meta: ResponseMeta,
    pub priority: Priority,
}

/// Options for a single precomputation.
#[derive(Debug, Clone, Copy)]
pub struct PrecomputeOptions {
    pub priority: Priority,
    /// Overrides the priority-scaled TTL when set.
    pub ttl: Option<Duration>,
}

impl Default for PrecomputeOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            ttl: None,
        }
    }
}

/// One query in a warm cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmQuery {
    pub endpoint_key: String,
    pub priority: Priority,
}

impl WarmQuery {
    pub fn new(endpoint_key: impl Into<String>, priority: Priority) -> Self {
        Self {
            endpoint_key: endpoint_key.into(),
            priority,
        }
    }
}

/// Demand side of a warm cycle.
///
/// The engine owns the schedule and the storage; the source declares what
/// to warm and how to fetch it. Fetches must be idempotent and
/// side-effect-free.
#[async_trait]
pub trait WarmSource: Send + Sync {
    /// The fixed high-priority query set, recomputed on every cycle.
    fn primary_queries(&self) -> Vec<WarmQuery>;

    /// Compute the full payload for a query.
    async fn fetch(&self, query: &WarmQuery) -> Result<Value, BoxError>;

    /// Queries derived from a primary result (e.g. detail views for every
    /// item on a warmed listing page).
    fn derive_secondary(&self, query: &WarmQuery, payload: &Value) -> Vec<WarmQuery> {
        let _ = (query, payload);
        Vec::new()
    }

    /// Auxiliary heavy resources referenced by a primary result (e.g.
    /// image variants), preloaded best-effort.
    fn auxiliary_refs(&self, query: &WarmQuery, payload: &Value) -> Vec<String> {
        let _ = (query, payload);
        Vec::new()
    }

    /// Preload one auxiliary resource.
    async fn preload_auxiliary(&self, reference: &str) -> Result<(), BoxError> {
        let _ = reference;
        Ok(())
    }
}

/// Outcome of one warm cycle. Purely informational; a cycle never fails as
/// a whole.
#[derive(Debug, Clone)]
pub struct WarmReport {
    pub run_id: Uuid,
    pub precomputed: usize,
    pub failed: usize,
    pub auxiliary_loaded: usize,
    pub auxiliary_failed: usize,
}

/// Precomputation and warming engine.
pub struct Warmer {
    cache: TieredCache,
    inflight: Arc<InFlight>,
    settings: WarmingSettings,
    fetch_timeout: Duration,
}

impl Warmer {
    pub fn new(cache: TieredCache, settings: &WarmingSettings, fetch_timeout: Duration) -> Self {
        Self {
            cache,
            inflight: Arc::new(InFlight::new()),
            settings: settings.clone(),
            fetch_timeout,
        }
    }

    /// The stored TTL for a priority, unless overridden per call.
    pub fn ttl_for(&self, priority: Priority) -> Duration {
        let secs = match priority {
            Priority::High => self.settings.high_priority_ttl_secs,
            Priority::Normal => self.settings.normal_priority_ttl_secs,
            Priority::Low => self.settings.low_priority_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    /// Compute and store a response for `endpoint_key`.
    ///
    /// Concurrent precomputations of the same key are deduplicated:
    /// returns `Ok(false)` when another one is already in flight (that
    /// one's result will land). Fetch failures propagate; nothing stale is
    /// overwritten on failure.
    pub async fn precompute<F, Fut>(
        &self,
        endpoint_key: &str,
        fetch: F,
        opts: &PrecomputeOptions,
    ) -> Result<bool, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, BoxError>>,
    {
        let key = precomputed_key(endpoint_key);
        let Some(_guard) = self.inflight.begin(&key) else {
            debug!(
                target = "strata::warming",
                endpoint_key, "precompute already in flight, skipping"
            );
            return Ok(false);
        };

        let payload = match tokio::time::timeout(self.fetch_timeout, fetch()).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(source)) => return Err(CacheError::upstream(&key, source)),
            Err(_) => {
                return Err(CacheError::UpstreamTimeout {
                    key,
                    timeout: self.fetch_timeout,
                });
            }
        };

        let ttl = opts.ttl.unwrap_or_else(|| self.ttl_for(opts.priority));
        self.store(&key, payload, opts.priority, ttl).await;
        Ok(true)
    }

    /// Read a precomputed response. Pure pull: never triggers computation.
    pub async fn get_precomputed(&self, endpoint_key: &str) -> Option<PrecomputedResponse> {
        let key = precomputed_key(endpoint_key);
        let raw = self.cache.get(&key, &CacheOptions::default()).await?;
        match serde_json::from_value(raw) {
            Ok(response) => Some(response),
            Err(err) => {
                warn!(
                    target = "strata::warming",
                    endpoint_key,
                    error = %err,
                    "evicting undecodable precomputed response"
                );
                self.cache.delete(&key).await;
                None
            }
        }
    }

    /// Run one warm cycle against `source`.
    ///
    /// Recomputes the primary set, precomputes the derived secondary set,
    /// and preloads auxiliary resources. Individual failures are logged
    /// and counted; the cycle itself always completes.
    pub async fn warm_all(&self, source: &dyn WarmSource) -> WarmReport {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let concurrency = self.settings.concurrency_non_zero().get();
        let mut report = WarmReport {
            run_id,
            precomputed: 0,
            failed: 0,
            auxiliary_loaded: 0,
            auxiliary_failed: 0,
        };

        info!(target = "strata::warming", run_id = %run_id, "warm cycle started");

        // Primary set: always recomputed, deduplicated by endpoint key.
        let mut seen: HashSet<String> = HashSet::new();
        let primaries: Vec<WarmQuery> = source
            .primary_queries()
            .into_iter()
            .filter(|query| seen.insert(query.endpoint_key.clone()))
            .collect();

        let primary_results: Vec<(WarmQuery, Option<Value>)> =
            stream::iter(primaries.into_iter().map(|query| async move {
                let payload = self.warm_one(source, &query).await;
                (query, payload)
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (_, payload) in &primary_results {
            match payload {
                Some(_) => report.precomputed += 1,
                None => report.failed += 1,
            }
        }

        // Secondary set, derived from the primary payloads.
        let secondaries: Vec<WarmQuery> = primary_results
            .iter()
            .filter_map(|(query, payload)| payload.as_ref().map(|payload| (query, payload)))
            .flat_map(|(query, payload)| source.derive_secondary(query, payload))
            .filter(|query| seen.insert(query.endpoint_key.clone()))
            .collect();

        let secondary_results: Vec<bool> =
            stream::iter(secondaries.into_iter().map(|query| async move {
                self.warm_one(source, &query).await.is_some()
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for stored in secondary_results {
            if stored {
                report.precomputed += 1;
            } else {
                report.failed += 1;
            }
        }

        // Auxiliary preloads, best-effort.
        let mut aux_seen: HashSet<String> = HashSet::new();
        let refs: Vec<String> = primary_results
            .iter()
            .filter_map(|(query, payload)| payload.as_ref().map(|payload| (query, payload)))
            .flat_map(|(query, payload)| source.auxiliary_refs(query, payload))
            .filter(|reference| aux_seen.insert(reference.clone()))
            .collect();

        let aux_results: Vec<bool> = stream::iter(refs.into_iter().map(|reference| async move {
            match tokio::time::timeout(self.fetch_timeout, source.preload_auxiliary(&reference))
                .await
            {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    warn!(
                        target = "strata::warming",
                        reference,
                        error = %err,
                        "auxiliary preload failed"
                    );
                    false
                }
                Err(_) => {
                    warn!(
                        target = "strata::warming",
                        reference, "auxiliary preload timed out"
                    );
                    false
                }
            }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;
        for loaded in aux_results {
            if loaded {
                report.auxiliary_loaded += 1;
            } else {
                report.auxiliary_failed += 1;
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_WARM_MS).record(elapsed_ms);
        info!(
            target = "strata::warming",
            run_id = %run_id,
            precomputed = report.precomputed,
            failed = report.failed,
            auxiliary_loaded = report.auxiliary_loaded,
            auxiliary_failed = report.auxiliary_failed,
            elapsed_ms,
            "warm cycle completed"
        );
        report
    }

    /// The warmer's in-flight registry, for awaiting pending precomputes.
    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.inflight
    }

    /// Precompute a single warm query, isolating its failure.
    async fn warm_one(&self, source: &dyn WarmSource, query: &WarmQuery) -> Option<Value> {
        let key = precomputed_key(&query.endpoint_key);
        let Some(_guard) = self.inflight.begin(&key) else {
            debug!(
                target = "strata::warming",
                endpoint_key = %query.endpoint_key,
                "warm query already in flight, skipping"
            );
            return None;
        };

        let payload = match tokio::time::timeout(self.fetch_timeout, source.fetch(query)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                warn!(
                    target = "strata::warming",
                    endpoint_key = %query.endpoint_key,
                    error = %err,
                    "warm fetch failed"
                );
                return None;
            }
            Err(_) => {
                warn!(
                    target = "strata::warming",
                    endpoint_key = %query.endpoint_key,
                    "warm fetch timed out"
                );
                return None;
            }
        };

        let ttl = self.ttl_for(query.priority);
        self.store(&key, payload.clone(), query.priority, ttl).await;
        Some(payload)
    }

    async fn store(&self, key: &str, payload: Value, priority: Priority, ttl: Duration) {
        let serialized = payload.to_string();
        let response = PrecomputedResponse {
            payload,
            meta: ResponseMeta {
                status: 200,
                headers: vec![
                    ("content-type".to_string(), "application/json".to_string()),
                    (
                        "cache-control".to_string(),
                        format!("public, max-age={}", ttl.as_secs()),
                    ),
                ],
                generated_at: OffsetDateTime::now_utc(),
                fingerprint: content_fingerprint(&serialized),
            },
            priority,
        };

        match serde_json::to_value(&response) {
            Ok(value) => {
                self.cache
                    .set(key, value, ttl, &CacheOptions::default())
                    .await;
                counter!(METRIC_PRECOMPUTE).increment(1);
            }
            Err(err) => {
                warn!(
                    target = "strata::warming",
                    key,
                    error = %err,
                    "failed to serialize precomputed response"
                );
            }
        }
    }
}

fn precomputed_key(endpoint_key: &str) -> String {
    format!("{PRECOMPUTED_NAMESPACE}:{endpoint_key}")
}

//! End-to-end behavior of the tiered facade: TTL expiry, the SWR window
//! protocol, and degradation under a full shared-tier outage.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use serial_test::serial;
use strata::config::Settings;
use strata::error::{BoxError, TransportError};
use strata::facade::{CacheOptions, SwrOptions, TieredCache};
use strata::local::LocalCache;
use strata::shared::{KvBackend, MemoryBackend, SharedTier};
use strata::stats::Health;

fn build_cache(backend: Arc<dyn KvBackend>) -> TieredCache {
    let settings = Settings::default();
    let local = Arc::new(LocalCache::new(&settings.local));
    let shared = Arc::new(SharedTier::new(backend, &settings.shared));
    TieredCache::new(local, shared, &settings).expect("default settings are valid")
}

/// Backend standing in for an unreachable distributed store.
struct UnreachableBackend;

#[async_trait]
impl KvBackend for UnreachableBackend {
    async fn get(&self, _key: &str) -> Result<Option<String>, TransportError> {
        Err(TransportError::Unavailable("no route to host".into()))
    }

    async fn set_with_ttl(
        &self,
        _key: &str,
        _value: String,
        _ttl: Duration,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unavailable("no route to host".into()))
    }

    async fn delete(&self, _keys: &[String]) -> Result<u64, TransportError> {
        Err(TransportError::Unavailable("no route to host".into()))
    }

    async fn add_to_set(
        &self,
        _key: &str,
        _member: &str,
        _ttl: Duration,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unavailable("no route to host".into()))
    }

    async fn set_members(&self, _key: &str) -> Result<Vec<String>, TransportError> {
        Err(TransportError::Unavailable("no route to host".into()))
    }

    async fn incr_with_window(
        &self,
        _key: &str,
        _window: Duration,
    ) -> Result<u64, TransportError> {
        Err(TransportError::Unavailable("no route to host".into()))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Err(TransportError::Unavailable("no route to host".into()))
    }
}

#[tokio::test]
#[serial]
async fn set_then_get_then_expire() {
    let cache = build_cache(Arc::new(MemoryBackend::new()));
    let opts = CacheOptions::default();

    cache
        .set("p:1", json!({"x": 1}), Duration::from_millis(100), &opts)
        .await;
    assert_eq!(cache.get("p:1", &opts).await, Some(json!({"x": 1})));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.get("p:1", &opts).await, None);
    assert!(!cache.has("p:1").await);
}

/// The full SWR window walk: cold fetch, stale serve with one background
/// refresh, coalesced concurrent reads, refreshed value afterwards.
#[tokio::test]
#[serial]
async fn swr_window_protocol() {
    let cache = build_cache(Arc::new(MemoryBackend::new()));
    let opts = SwrOptions::new(Duration::from_millis(100), Duration::from_millis(300))
        .expect("valid windows");

    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = |calls: &Arc<AtomicUsize>| {
        let calls = Arc::clone(calls);
        move || async move {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            // First result is "A"; any refresh observes "B".
            if call == 0 {
                Ok::<Value, BoxError>(json!("A"))
            } else {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("B"))
            }
        }
    };

    // Cold: exactly one synchronous fetch.
    let value = cache
        .get_with_swr("f:1", fetcher(&calls), &opts)
        .await
        .expect("cold fetch");
    assert_eq!(value, json!("A"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Enter the stale window.
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Stale: served immediately, one background refresh scheduled.
    let value = cache
        .get_with_swr("f:1", fetcher(&calls), &opts)
        .await
        .expect("stale read");
    assert_eq!(value, json!("A"));

    // Still in flight: no additional fetch is started.
    let value = cache
        .get_with_swr("f:1", fetcher(&calls), &opts)
        .await
        .expect("coalesced read");
    assert_eq!(value, json!("A"));

    cache.in_flight().wait("f:1").await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The background result has landed and is fresh again.
    let value = cache
        .get_with_swr("f:1", fetcher(&calls), &opts)
        .await
        .expect("refreshed read");
    assert_eq!(value, json!("B"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[serial]
async fn swr_prefers_stale_value_over_failed_refresh() {
    let cache = build_cache(Arc::new(MemoryBackend::new()));
    let opts = SwrOptions::new(Duration::from_millis(10), Duration::from_millis(30))
        .expect("valid windows");

    cache
        .set(
            "f:2",
            json!("last-good"),
            Duration::from_secs(60),
            &CacheOptions::default(),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Past the stale horizon, the synchronous refresh fails; the retained
    // value is served instead of the error.
    let value = cache
        .get_with_swr(
            "f:2",
            || async { Err::<Value, BoxError>("upstream 503".into()) },
            &opts,
        )
        .await
        .expect("stale fallback");
    assert_eq!(value, json!("last-good"));
}

#[tokio::test]
async fn full_shared_outage_degrades_without_errors() {
    let cache = build_cache(Arc::new(UnreachableBackend));
    let opts = CacheOptions::default();

    // Writes land in the local tier; reads of unknown keys are plain
    // misses. Nothing surfaces an error.
    cache
        .set("p:1", json!(1), Duration::from_secs(60), &opts)
        .await;
    assert_eq!(cache.get("p:1", &opts).await, Some(json!(1)));
    assert_eq!(cache.get("p:unknown", &opts).await, None);

    let health = cache.health_check().await;
    assert_eq!(health.status, Health::Degraded);
    assert!(!health.shared_reachable);
    assert_eq!(health.local_entries, 1);

    let stats = cache.stats();
    assert!(stats.shared.errors > 0);
}

#[tokio::test]
async fn multi_key_operations() {
    let cache = build_cache(Arc::new(MemoryBackend::new()));
    let opts = CacheOptions::default();

    cache
        .set_multiple(
            vec![
                ("listings:detail:1".to_string(), json!({"id": 1})),
                ("listings:detail:2".to_string(), json!({"id": 2})),
            ],
            Duration::from_secs(60),
        )
        .await;

    let values = cache
        .get_multiple(
            &[
                "listings:detail:1".to_string(),
                "listings:detail:9".to_string(),
                "listings:detail:2".to_string(),
            ],
            &opts,
        )
        .await;
    assert_eq!(
        values,
        vec![Some(json!({"id": 1})), None, Some(json!({"id": 2}))]
    );
}

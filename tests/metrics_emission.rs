//! Verifies the cache paths emit the expected metric keys.

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use serde_json::json;
use strata::config::{LocalCacheSettings, Settings};
use strata::facade::{CacheOptions, TieredCache};
use strata::local::LocalCache;
use strata::shared::{MemoryBackend, SharedTier};
use strata::telemetry;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    // Local hit/miss/evict.
    let local = LocalCache::new(&LocalCacheSettings {
        capacity: 1,
        ..Default::default()
    });
    assert!(local.get("m:1").is_none());
    local.set("m:1", json!(1), Duration::from_secs(60));
    assert!(local.get("m:1").is_some());
    local.set("m:2", json!(2), Duration::from_secs(60));

    // Shared hit/miss through the facade.
    let settings = Settings::default();
    let cache = TieredCache::new(
        Arc::new(LocalCache::new(&settings.local)),
        Arc::new(SharedTier::new(
            Arc::new(MemoryBackend::new()),
            &settings.shared,
        )),
        &settings,
    )
    .expect("valid settings");
    cache
        .set(
            "m:3",
            json!(3),
            Duration::from_secs(60),
            &CacheOptions {
                skip_local: true,
                skip_shared: false,
            },
        )
        .await;
    assert!(cache.get("m:3", &CacheOptions::default()).await.is_some());
    assert!(
        cache
            .get("m:missing", &CacheOptions::default())
            .await
            .is_none()
    );

    let snapshot = snapshotter.snapshot().into_vec();
    let recorded: Vec<String> = snapshot
        .iter()
        .map(|(key, _, _, _)| key.key().name().to_string())
        .collect();

    for expected in [
        "strata_cache_local_hit_total",
        "strata_cache_local_miss_total",
        "strata_cache_local_evict_total",
        "strata_cache_shared_hit_total",
        "strata_cache_shared_miss_total",
    ] {
        assert!(
            recorded.iter().any(|name| name == expected),
            "missing metric key `{expected}` in {recorded:?}"
        );
    }
}

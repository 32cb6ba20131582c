//! Engine factory and lifecycle.
//!
//! Builds the tiers, facade, cascade map, and warmer from validated
//! settings, and owns the periodic background tasks (local expiry sweep,
//! scheduled warm cycles). Construct one engine per process and inject
//! its handles into consumers; there are no process-global instances.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cascade::{CascadeMap, DependencyRule};
use crate::config::Settings;
use crate::error::ConfigError;
use crate::facade::TieredCache;
use crate::local::LocalCache;
use crate::shared::{KvBackend, SharedTier};
use crate::warming::{WarmSource, Warmer};

/// Owner of the cache stack and its background tasks.
pub struct Engine {
    settings: Settings,
    cache: TieredCache,
    warmer: Arc<Warmer>,
    cascade: Arc<CascadeMap>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine. Settings are validated here; inconsistent
    /// configuration never reaches serve time.
    pub fn new(
        settings: Settings,
        backend: Arc<dyn KvBackend>,
        rules: Vec<DependencyRule>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        let local = Arc::new(LocalCache::new(&settings.local));
        let shared = Arc::new(SharedTier::new(backend, &settings.shared));
        let cache = TieredCache::new(local, shared, &settings)?;
        let warmer = Arc::new(Warmer::new(
            cache.clone(),
            &settings.warming,
            settings.swr.fetch_timeout(),
        ));
        let cascade = Arc::new(CascadeMap::new(rules));

        Ok(Self {
            settings,
            cache,
            warmer,
            cascade,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the periodic sweep and, when a source is supplied and warming
    /// is enabled, the startup warm plus the recurring warm schedule.
    pub fn start(&self, warm_source: Option<Arc<dyn WarmSource>>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        tasks.push(spawn_sweeper(
            Arc::clone(self.cache.local()),
            self.settings.local.sweep_interval(),
        ));

        if let Some(source) = warm_source
            && self.settings.warming.enabled
        {
            tasks.push(spawn_warm_schedule(
                Arc::clone(&self.warmer),
                source,
                self.settings.warming.interval(),
            ));
        }

        info!(target = "strata::engine", "engine started");
    }

    /// Stop the periodic tasks and wait for in-flight background work to
    /// settle.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        self.cache.in_flight().wait_all().await;
        self.warmer.in_flight().wait_all().await;
        info!(target = "strata::engine", "engine stopped");
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn warmer(&self) -> &Arc<Warmer> {
        &self.warmer
    }

    pub fn cascade(&self) -> &Arc<CascadeMap> {
        &self.cascade
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let guard = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in guard.iter() {
            task.abort();
        }
    }
}

fn spawn_sweeper(local: Arc<LocalCache>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a fresh engine does
        // not sweep an empty cache.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = local.sweep();
            debug!(target = "strata::engine", removed, "periodic sweep finished");
        }
    })
}

fn spawn_warm_schedule(
    warmer: Arc<Warmer>,
    source: Arc<dyn WarmSource>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            // The immediate first tick doubles as the startup warm.
            ticker.tick().await;
            warmer.warm_all(source.as_ref()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::config::{SwrSettings, WarmingSettings};
    use crate::error::BoxError;
    use crate::facade::CacheOptions;
    use crate::shared::MemoryBackend;
    use crate::warming::{Priority, WarmQuery};

    use super::*;

    struct SingleQuerySource;

    #[async_trait]
    impl WarmSource for SingleQuerySource {
        fn primary_queries(&self) -> Vec<WarmQuery> {
            vec![WarmQuery::new("home:featured", Priority::High)]
        }

        async fn fetch(&self, _query: &WarmQuery) -> Result<Value, BoxError> {
            Ok(json!({"items": []}))
        }
    }

    #[tokio::test]
    async fn engine_builds_and_shuts_down() {
        let engine = Engine::new(
            Settings::default(),
            Arc::new(MemoryBackend::new()),
            Vec::new(),
        )
        .expect("valid settings");
        engine.start(None);

        engine
            .cache()
            .set("p:1", json!(1), Duration::from_secs(5), &CacheOptions::default())
            .await;
        assert_eq!(
            engine.cache().get("p:1", &CacheOptions::default()).await,
            Some(json!(1))
        );

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_settings_fail_at_construction() {
        let settings = Settings {
            swr: SwrSettings {
                fresh_ttl_secs: 120,
                stale_ttl_secs: 60,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(Engine::new(settings, Arc::new(MemoryBackend::new()), Vec::new()).is_err());
    }

    #[tokio::test]
    async fn startup_warm_populates_precomputed_namespace() {
        let settings = Settings {
            warming: WarmingSettings {
                interval_secs: 3_600,
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = Engine::new(settings, Arc::new(MemoryBackend::new()), Vec::new())
            .expect("valid settings");
        engine.start(Some(Arc::new(SingleQuerySource)));

        // The startup warm is the schedule's immediate first tick.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if engine.warmer().get_precomputed("home:featured").await.is_some() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "startup warm never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        engine.shutdown().await;
    }
}

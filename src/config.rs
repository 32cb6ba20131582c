//! Configuration layer: typed settings with layered precedence (file → env).
//!
//! All knobs live in `strata.toml` under the sections below and can be
//! overridden with `STRATA__SECTION__FIELD` environment variables:
//!
//! ```toml
//! [local]
//! capacity = 2000
//! ttl_cap_secs = 300
//!
//! [swr]
//! fresh_ttl_secs = 60
//! stale_ttl_secs = 600
//!
//! [warming]
//! interval_secs = 900
//! ```

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

use crate::error::ConfigError;

const DEFAULT_LOCAL_CAPACITY: usize = 2_000;
const DEFAULT_LOCAL_TTL_CAP_SECS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_INDEX_GRACE_SECS: u64 = 120;
const DEFAULT_COUNTER_WINDOW_SECS: u64 = 600;
const DEFAULT_FRESH_TTL_SECS: u64 = 60;
const DEFAULT_STALE_TTL_SECS: u64 = 600;
const DEFAULT_FALLBACK_GRACE_SECS: u64 = 300;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_BACKGROUND_REFRESHES: usize = 8;
const DEFAULT_WARM_INTERVAL_SECS: u64 = 900;
const DEFAULT_WARM_CONCURRENCY: usize = 4;
const DEFAULT_HIGH_PRIORITY_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_NORMAL_PRIORITY_TTL_SECS: u64 = 6 * 60 * 60;
const DEFAULT_LOW_PRIORITY_TTL_SECS: u64 = 60 * 60;

/// Bounded local cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalCacheSettings {
    /// Enable the in-process tier.
    pub enabled: bool,
    /// Maximum number of entries.
    pub capacity: usize,
    /// Upper bound for any locally stored TTL. The local tier is a bounded
    /// cache of the shared tier, so entries never outlive this cap.
    pub ttl_cap_secs: u64,
    /// Interval of the periodic expiry sweep.
    pub sweep_interval_secs: u64,
}

impl Default for LocalCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_LOCAL_CAPACITY,
            ttl_cap_secs: DEFAULT_LOCAL_TTL_CAP_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl LocalCacheSettings {
    /// Capacity as `NonZeroUsize`, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn ttl_cap(&self) -> Duration {
        Duration::from_secs(self.ttl_cap_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Shared tier client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SharedTierSettings {
    /// Enable the shared tier. When disabled the facade serves from the
    /// local tier alone.
    pub enabled: bool,
    /// Grace added to a pattern index entry beyond the indexed key's TTL,
    /// so the index never expires before its members.
    pub index_grace_secs: u64,
    /// Rolling window for per-key access counters.
    pub counter_window_secs: u64,
}

impl Default for SharedTierSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            index_grace_secs: DEFAULT_INDEX_GRACE_SECS,
            counter_window_secs: DEFAULT_COUNTER_WINDOW_SECS,
        }
    }
}

impl SharedTierSettings {
    pub fn index_grace(&self) -> Duration {
        Duration::from_secs(self.index_grace_secs)
    }

    pub fn counter_window(&self) -> Duration {
        Duration::from_secs(self.counter_window_secs)
    }
}

/// Stale-while-revalidate defaults and fetch execution limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwrSettings {
    /// Default fresh window.
    pub fresh_ttl_secs: u64,
    /// Default stale window.
    pub stale_ttl_secs: u64,
    /// How long past the stale horizon an entry is retained as a fallback
    /// for failed synchronous refreshes.
    pub fallback_grace_secs: u64,
    /// Bound on every upstream fetch invocation.
    pub fetch_timeout_secs: u64,
    /// Bound on concurrently running background revalidations.
    pub max_background_refreshes: usize,
}

impl Default for SwrSettings {
    fn default() -> Self {
        Self {
            fresh_ttl_secs: DEFAULT_FRESH_TTL_SECS,
            stale_ttl_secs: DEFAULT_STALE_TTL_SECS,
            fallback_grace_secs: DEFAULT_FALLBACK_GRACE_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_background_refreshes: DEFAULT_MAX_BACKGROUND_REFRESHES,
        }
    }
}

impl SwrSettings {
    pub fn fresh_ttl(&self) -> Duration {
        Duration::from_secs(self.fresh_ttl_secs)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_secs)
    }

    pub fn fallback_grace(&self) -> Duration {
        Duration::from_secs(self.fallback_grace_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Precomputation and warming settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarmingSettings {
    /// Enable the periodic warm schedule.
    pub enabled: bool,
    /// Interval between scheduled `warm_all` runs.
    pub interval_secs: u64,
    /// Concurrent precompute/preload operations per warm cycle.
    pub concurrency: usize,
    /// Precomputed-response TTL for high priority entries.
    pub high_priority_ttl_secs: u64,
    /// Precomputed-response TTL for normal priority entries.
    pub normal_priority_ttl_secs: u64,
    /// Precomputed-response TTL for low priority entries.
    pub low_priority_ttl_secs: u64,
}

impl Default for WarmingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_WARM_INTERVAL_SECS,
            concurrency: DEFAULT_WARM_CONCURRENCY,
            high_priority_ttl_secs: DEFAULT_HIGH_PRIORITY_TTL_SECS,
            normal_priority_ttl_secs: DEFAULT_NORMAL_PRIORITY_TTL_SECS,
            low_priority_ttl_secs: DEFAULT_LOW_PRIORITY_TTL_SECS,
        }
    }
}

impl WarmingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn concurrency_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.concurrency).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
}

/// Minimum log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
        }
    }
}

/// Root settings for the engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub local: LocalCacheSettings,
    pub shared: SharedTierSettings,
    pub swr: SwrSettings,
    pub warming: WarmingSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from an optional TOML file plus `STRATA__*` environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        } else {
            builder = builder.add_source(File::with_name("strata").required(false));
        }
        let settings: Self = builder
            .add_source(Environment::with_prefix("STRATA").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject inconsistent values before any component is constructed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.swr.fresh_ttl_secs > self.swr.stale_ttl_secs {
            return Err(ConfigError::invalid(format!(
                "swr.fresh_ttl_secs ({}) must not exceed swr.stale_ttl_secs ({})",
                self.swr.fresh_ttl_secs, self.swr.stale_ttl_secs
            )));
        }
        if self.swr.fetch_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "swr.fetch_timeout_secs must be greater than zero",
            ));
        }
        if self.swr.max_background_refreshes == 0 {
            return Err(ConfigError::invalid(
                "swr.max_background_refreshes must be greater than zero",
            ));
        }
        if self.local.enabled && self.local.ttl_cap_secs == 0 {
            return Err(ConfigError::invalid(
                "local.ttl_cap_secs must be greater than zero",
            ));
        }
        if self.warming.enabled && self.warming.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "warming.interval_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}

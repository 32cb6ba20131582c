//! Strata: multi-tier caching and precomputation engine.
//!
//! Keeps read latency low and shields a slow or rate-limited upstream from
//! request traffic with two composed cache tiers:
//!
//! - **Local tier**: in-process, capacity-bounded, TTL + LRU eviction
//! - **Shared tier**: a networked key-value store behind the [`shared::KvBackend`]
//!   seam, with prefix-indexed pattern invalidation
//!
//! On top of the tiers sit the stale-while-revalidate facade
//! ([`facade::TieredCache`]), cascading invalidation over declared
//! dependency rules ([`cascade::CascadeMap`]), and a scheduled
//! precomputation/warming pipeline ([`warming::Warmer`]).
//!
//! ## Configuration
//!
//! Behavior is controlled via `strata.toml` (see [`config::Settings`]):
//!
//! ```toml
//! [local]
//! capacity = 2000
//! ttl_cap_secs = 300
//!
//! [swr]
//! fresh_ttl_secs = 60
//! stale_ttl_secs = 600
//! ```
//!
//! ## Lifecycle
//!
//! Build an [`engine::Engine`] with validated settings, a backend, and the
//! dependency rules; `start()` spawns the periodic sweep and warm schedule,
//! `shutdown()` stops them and drains in-flight background work. All cached
//! state is reconstructible from the upstream: the engine is never a system
//! of record.

pub mod cascade;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod inflight;
pub mod keys;
pub mod local;
pub mod shared;
pub mod stats;
pub mod telemetry;
pub mod warming;

mod lock;

pub use cascade::{CascadeMap, DependencyRule};
pub use config::Settings;
pub use engine::Engine;
pub use error::{BoxError, CacheError, ConfigError, TransportError};
pub use facade::{CacheOptions, SwrOptions, TieredCache};
pub use inflight::{InFlight, InFlightGuard};
pub use keys::KeyPattern;
pub use local::{CachedValue, LocalCache};
pub use shared::{KvBackend, MemoryBackend, SharedTier};
pub use stats::{CacheStats, Health, HealthReport, TierSnapshot};
pub use warming::{
    PrecomputeOptions, PrecomputedResponse, Priority, ResponseMeta, WarmQuery, WarmReport,
    WarmSource, Warmer,
};

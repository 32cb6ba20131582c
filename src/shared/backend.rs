//! Storage backend seam for the shared tier.
//!
//! `KvBackend` maps onto any networked key-value store with per-entry TTL
//! (string values, TTL-bound sets for the pattern index, windowed counters).
//! `MemoryBackend` is the reference implementation, used by tests and
//! single-instance deployments.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::TransportError;

/// Operations the shared tier needs from a distributed store.
///
/// Implementations own their transport; every failure is reported as a
/// [`TransportError`] and absorbed by the client.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch the raw value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, TransportError>;

    /// Store `value` under `key`, expiring after `ttl`.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), TransportError>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, TransportError>;

    /// Add `member` to the set stored under `key`, extending the set's
    /// expiry to at least `ttl` from now.
    async fn add_to_set(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), TransportError>;

    /// All members of the set stored under `key`.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, TransportError>;

    /// Increment a rolling counter that resets `window` after its first
    /// increment. Returns the post-increment count.
    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<u64, TransportError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
struct ExpiringValue {
    value: String,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct ExpiringSet {
    members: HashSet<String>,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, ExpiringValue>,
    sets: HashMap<String, ExpiringSet>,
    counters: HashMap<String, WindowCounter>,
}

/// In-memory backend with real per-entry expiry.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) values.
    pub async fn len(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let state = self.state.read().await;
        state
            .values
            .values()
            .filter(|entry| now < entry.expires_at)
            .count()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        let now = OffsetDateTime::now_utc();
        {
            let state = self.state.read().await;
            match state.values.get(key) {
                Some(entry) if now < entry.expires_at => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it so memory stays bounded between sweeps.
        self.state.write().await.values.remove(key);
        Ok(None)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let expires_at = OffsetDateTime::now_utc() + ttl;
        self.state
            .write()
            .await
            .values
            .insert(key.to_string(), ExpiringValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, TransportError> {
        let mut state = self.state.write().await;
        let mut removed = 0;
        for key in keys {
            if state.values.remove(key).is_some() {
                removed += 1;
            }
            state.sets.remove(key);
        }
        Ok(removed)
    }

    async fn add_to_set(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.write().await;
        let set = state.sets.entry(key.to_string()).or_insert(ExpiringSet {
            members: HashSet::new(),
            expires_at: now,
        });
        if now >= set.expires_at {
            set.members.clear();
        }
        set.members.insert(member.to_string());
        set.expires_at = set.expires_at.max(now + ttl);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, TransportError> {
        let now = OffsetDateTime::now_utc();
        let state = self.state.read().await;
        Ok(state
            .sets
            .get(key)
            .filter(|set| now < set.expires_at)
            .map(|set| set.members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<u64, TransportError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.write().await;
        let counter = state
            .counters
            .entry(key.to_string())
            .or_insert(WindowCounter {
                count: 0,
                expires_at: now + window,
            });
        if now >= counter.expires_at {
            counter.count = 0;
            counter.expires_at = now + window;
        }
        counter.count += 1;
        Ok(counter.count)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

//! Error taxonomy.
//!
//! Infrastructure failures (shared tier transport, serialization) are
//! absorbed inside the engine and degrade to cache misses; only
//! configuration mistakes and unrecoverable upstream fetch failures
//! surface to callers.

use std::time::Duration;

use thiserror::Error;

/// Boxed error type accepted from caller-supplied fetch functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration errors. Raised at construction time, never at call time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
    #[error("invalid key pattern `{pattern}`: {reason}")]
    Pattern {
        pattern: String,
        reason: &'static str,
    },
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Errors surfaced to callers of the cache facade and warming engine.
///
/// These are the only unrecoverable errors: the upstream fetch failed and no
/// not-fully-expired value exists to fall back to. Callers should treat them
/// as "temporarily degraded" rather than fatal.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("upstream fetch failed for `{key}`")]
    Upstream {
        key: String,
        #[source]
        source: BoxError,
    },
    #[error("upstream fetch for `{key}` timed out after {timeout:?}")]
    UpstreamTimeout { key: String, timeout: Duration },
}

impl CacheError {
    pub fn upstream(key: impl Into<String>, source: BoxError) -> Self {
        Self::Upstream {
            key: key.into(),
            source,
        }
    }
}

/// Shared-tier transport failures.
///
/// Backend implementations construct these; the shared tier client absorbs
/// them (logged, counted, degraded to a miss) and never re-throws.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("shared tier unavailable: {0}")]
    Unavailable(String),
    #[error("shared tier operation timed out after {0:?}")]
    Timeout(Duration),
}

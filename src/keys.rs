//! Cache key construction and pattern matching.
//!
//! Keys are colon-delimited hierarchical strings
//! (`namespace:resource:fingerprint`). Patterns are either exact keys or a
//! prefix wildcard (`namespace:resource:*`); the wildcard is anchored at a
//! segment boundary, so `a:b:*` matches `a:b:x` but never `a:bc:x`.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// Segment separator for hierarchical keys.
pub const SEPARATOR: char = ':';

/// Number of hex characters kept from a full SHA-256 fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// Join key segments with the hierarchy separator.
pub fn join(segments: &[&str]) -> String {
    segments.join(":")
}

/// Deterministic fingerprint of a structured filter value.
///
/// `serde_json::Value` objects serialize with their keys in sorted order, so
/// two logically identical filters produce identical fingerprints regardless
/// of the property order they were built with.
pub fn fingerprint(value: &Value) -> String {
    let canonical = value.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..FINGERPRINT_LEN].to_string()
}

/// Full SHA-256 content fingerprint, used for precomputed response metadata.
pub fn content_fingerprint(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// The ordered list of prefix patterns a key belongs to.
///
/// `listings:search:abc` → `["listings:*", "listings:search:*"]`. The shared
/// tier registers the key under each so pattern invalidation can resolve
/// members without scanning the key space.
pub fn prefix_patterns(key: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    for (idx, ch) in key.char_indices() {
        if ch == SEPARATOR {
            patterns.push(format!("{}:*", &key[..idx]));
        }
    }
    patterns
}

/// A parsed invalidation pattern: an exact key or a prefix wildcard.
///
/// Parsing is the only constructor, so an in-hand `KeyPattern` is always
/// well-formed; malformed pattern strings fail at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    Exact(String),
    /// Matches every key beginning with the stored prefix (which includes
    /// the trailing separator).
    Prefix(String),
}

impl KeyPattern {
    /// Parse a pattern string.
    ///
    /// Accepted forms: an exact key with no wildcard, or `prefix:*`.
    /// Interior or bare wildcards are rejected.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.is_empty() {
            return Err(ConfigError::Pattern {
                pattern: pattern.to_string(),
                reason: "pattern must not be empty",
            });
        }

        match pattern.find('*') {
            None => Ok(Self::Exact(pattern.to_string())),
            Some(idx) if idx == pattern.len() - 1 => {
                let prefix = &pattern[..idx];
                if !prefix.ends_with(SEPARATOR) || prefix.len() == 1 {
                    return Err(ConfigError::Pattern {
                        pattern: pattern.to_string(),
                        reason: "wildcard must follow a `:`-terminated prefix",
                    });
                }
                Ok(Self::Prefix(prefix.to_string()))
            }
            Some(_) => Err(ConfigError::Pattern {
                pattern: pattern.to_string(),
                reason: "only a single trailing wildcard is supported",
            }),
        }
    }

    /// Whether this pattern matches the given key.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => key == exact,
            // The prefix carries its trailing separator, so the boundary
            // check is part of the prefix comparison itself.
            Self::Prefix(prefix) => key.len() > prefix.len() && key.starts_with(prefix.as_str()),
        }
    }

}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

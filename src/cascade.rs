//! Cascading invalidation.
//!
//! Derived views (listing pages, search indexes, precomputed responses)
//! depend on the raw records they were built from. The cascade map declares
//! those edges once at startup; invalidating a key then invalidates the
//! transitive closure of dependent patterns through the facade.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::error::ConfigError;
use crate::facade::TieredCache;
use crate::keys::KeyPattern;

/// One declared dependency edge: when a key matching `trigger` changes,
/// every `dependents` pattern must be invalidated too.
#[derive(Debug, Clone)]
pub struct DependencyRule {
    pub trigger: KeyPattern,
    pub dependents: Vec<KeyPattern>,
}

impl DependencyRule {
    /// Parse a rule from pattern strings; malformed patterns fail here,
    /// at startup.
    pub fn parse(trigger: &str, dependents: &[&str]) -> Result<Self, ConfigError> {
        Ok(Self {
            trigger: KeyPattern::parse(trigger)?,
            dependents: dependents
                .iter()
                .map(|raw| KeyPattern::parse(raw))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Fixed adjacency map over declared dependency rules.
pub struct CascadeMap {
    rules: Vec<DependencyRule>,
}

impl CascadeMap {
    pub fn new(rules: Vec<DependencyRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The transitive closure of patterns affected by a change to `key`:
    /// the key itself plus every dependent reachable over the rule graph.
    ///
    /// Traversal tracks visited nodes, so cyclic declarations terminate
    /// with each pattern appearing exactly once.
    pub fn closure_for(&self, key: &str) -> Vec<KeyPattern> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut closure: Vec<KeyPattern> = Vec::new();
        let mut queue: VecDeque<KeyPattern> = VecDeque::new();

        let root = KeyPattern::Exact(key.to_string());
        visited.insert(root.to_string());
        queue.push_back(root);

        while let Some(node) = queue.pop_front() {
            for rule in &self.rules {
                if !Self::triggered_by(&rule.trigger, &node) {
                    continue;
                }
                for dependent in &rule.dependents {
                    if visited.insert(dependent.to_string()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
            closure.push(node);
        }
        closure
    }

    /// Invalidate `key` and everything transitively derived from it.
    /// Returns the summed affected-key count.
    pub async fn invalidate_with_dependencies(&self, cache: &TieredCache, key: &str) -> usize {
        let closure = self.closure_for(key);
        let mut affected = 0;
        for pattern in &closure {
            affected += cache.invalidate_pattern(pattern).await;
        }
        debug!(
            target = "strata::cascade",
            key,
            patterns = closure.len(),
            affected,
            "cascading invalidation completed"
        );
        affected
    }

    /// A rule fires when its trigger equals the node's pattern, or — for
    /// the root key — when the trigger pattern matches the key.
    fn triggered_by(trigger: &KeyPattern, node: &KeyPattern) -> bool {
        if trigger == node {
            return true;
        }
        match node {
            KeyPattern::Exact(key) => trigger.matches(key),
            KeyPattern::Prefix(_) => false,
        }
    }
}

//! Selector-cache data model shared between the cache crate and the
//! persistence schema.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candidate::Strategy;

/// Collapse whitespace and lowercase, so "Search  Box" and "search box"
/// address the same entry.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cache key: a content hash of `(origin, normalized label, context)`.
///
/// The key must be reproducible across processes, so it hashes the
/// canonical composite string rather than any in-memory layout.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn new(origin: &str, label: &str, context: Option<&str>) -> Self {
        let composite = format!(
            "{}|{}|{}",
            origin,
            normalize_label(label),
            context.unwrap_or("")
        );
        let mut hasher = DefaultHasher::new();
        composite.hash(&mut hasher);
        Self(format!("{:016x}", hasher.finish()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One cached selector binding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub selector: String,
    pub strategy: Strategy,
    pub stable: bool,
    pub confidence: f64,
    pub hits: u64,
    pub misses: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_hash: Option<String>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, selector: impl Into<String>, strategy: Strategy, confidence: f64) -> Self {
        let now = Utc::now();
        Self {
            key,
            selector: selector.into(),
            strategy,
            stable: strategy.is_stable(),
            confidence,
            hits: 0,
            misses: 0,
            created_at: now,
            last_used_at: now,
            context_hash: None,
        }
    }

    /// Whether this entry beats `other` under the collision policy:
    /// stable entries win, then higher confidence.
    pub fn supersedes(&self, other: &CacheEntry) -> bool {
        if self.stable != other.stable {
            return self.stable;
        }
        self.confidence >= other.confidence
    }
}

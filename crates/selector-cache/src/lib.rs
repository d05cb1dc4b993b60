//! Dual-layer selector cache.
//!
//! Reads go fast layer first, then the durable layer, warming the fast
//! layer with the remaining TTL on a durable hit. Writes happen only after
//! the gate has passed and fan out to both layers, with an at-most-once
//! durable write per `(key, selector)` per hour; duplicates fold into a
//! hit-count bump.

mod store;

pub use store::{DurableCacheStore, InMemoryStore, JsonFileStore};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pacts_core_types::{normalize_label, CacheEntry, CacheKey, Candidate, EngineConfig, Strategy};
use pacts_telemetry::TelemetrySink;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache snapshot malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub fast_ttl: Duration,
    pub durable_ttl: Duration,
    pub allow_id_cache: bool,
    pub allow_unstable_hit: bool,
    pub write_dedup_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_ttl: Duration::from_secs(24 * 3600),
            durable_ttl: Duration::from_secs(7 * 24 * 3600),
            allow_id_cache: true,
            allow_unstable_hit: true,
            write_dedup_window: Duration::from_secs(3600),
        }
    }
}

impl From<&EngineConfig> for CacheConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            fast_ttl: Duration::from_secs(cfg.cache_fast_ttl_s),
            durable_ttl: Duration::from_secs(cfg.cache_durable_ttl_s),
            allow_id_cache: cfg.allow_id_cache,
            allow_unstable_hit: cfg.allow_unstable_hit,
            write_dedup_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone)]
struct FastSlot {
    entry: CacheEntry,
    expires_at: DateTime<Utc>,
}

/// The shared cache. Thread-safe; one instance serves every concurrent
/// run in the process.
pub struct SelectorCache {
    config: CacheConfig,
    fast: DashMap<CacheKey, FastSlot>,
    durable: Arc<dyn DurableCacheStore>,
    recent_writes: DashMap<(CacheKey, String), DateTime<Utc>>,
    telemetry: Option<Arc<TelemetrySink>>,
}

impl SelectorCache {
    pub fn new(config: CacheConfig, durable: Arc<dyn DurableCacheStore>) -> Self {
        Self {
            config,
            fast: DashMap::new(),
            durable,
            recent_writes: DashMap::new(),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    fn key(origin: &str, label: &str, context: Option<&str>) -> CacheKey {
        CacheKey::new(origin, label, context)
    }

    /// Read-through lookup. Returns `None` on miss, on expiry, and on an
    /// unstable hit when the configuration forbids those.
    pub fn read(&self, origin: &str, label: &str, context: Option<&str>) -> Option<CacheEntry> {
        let key = Self::key(origin, label, context);
        let now = Utc::now();

        if let Some(slot) = self.fast.get(&key) {
            if slot.expires_at > now {
                let entry = slot.entry.clone();
                drop(slot);
                if !entry.stable && !self.config.allow_unstable_hit {
                    if let Some(t) = &self.telemetry {
                        t.record_cache_hit_unstable();
                    }
                } else {
                    if let Some(t) = &self.telemetry {
                        t.record_cache_hit_fast();
                        if !entry.stable {
                            t.record_cache_hit_unstable();
                        }
                    }
                    return Some(self.touch(entry));
                }
            } else {
                drop(slot);
                self.fast.remove(&key);
            }
        }

        match self.durable.load(&key) {
            Ok(Some(entry)) => {
                let durable_expiry = entry.last_used_at
                    + chrono::Duration::from_std(self.config.durable_ttl).unwrap_or_else(|_| chrono::Duration::zero());
                if durable_expiry <= now {
                    let _ = self.durable.remove(&key);
                } else if !entry.stable && !self.config.allow_unstable_hit {
                    if let Some(t) = &self.telemetry {
                        t.record_cache_hit_unstable();
                    }
                } else {
                    // Warm the fast layer with the remaining durable TTL,
                    // capped at the fast TTL.
                    let remaining = (durable_expiry - now)
                        .to_std()
                        .unwrap_or(self.config.fast_ttl)
                        .min(self.config.fast_ttl);
                    self.fast.insert(
                        key,
                        FastSlot {
                            entry: entry.clone(),
                            expires_at: now
                                + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero()),
                        },
                    );
                    if let Some(t) = &self.telemetry {
                        t.record_cache_hit_durable();
                        if !entry.stable {
                            t.record_cache_hit_unstable();
                        }
                    }
                    return Some(self.touch(entry));
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(target: "pacts::cache", %err, "durable read failed");
            }
        }

        if let Some(t) = &self.telemetry {
            t.record_cache_miss();
        }
        None
    }

    fn touch(&self, mut entry: CacheEntry) -> CacheEntry {
        entry.hits += 1;
        entry.last_used_at = Utc::now();
        if let Some(mut slot) = self.fast.get_mut(&entry.key) {
            slot.entry = entry.clone();
        }
        let _ = self.durable.upsert(entry.clone());
        entry
    }

    /// Write-through, invoked only after the gate has passed the
    /// candidate. Raw `#id` selectors are kept out of the durable layer
    /// when the id-cache policy forbids them; the fast layer still holds
    /// them for the current session.
    pub fn write(
        &self,
        origin: &str,
        label: &str,
        context: Option<&str>,
        candidate: &Candidate,
    ) -> Result<(), CacheError> {
        let key = Self::key(origin, label, context);
        let now = Utc::now();
        let dedup_key = (key.clone(), candidate.selector.clone());

        if let Some(last) = self.recent_writes.get(&dedup_key) {
            let window = chrono::Duration::from_std(self.config.write_dedup_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
            if *last.value() + window > now {
                drop(last);
                // Duplicate inside the window: fold into hits++.
                if let Some(entry) = self.durable.load(&key)? {
                    if entry.selector == candidate.selector {
                        self.touch(entry);
                        return Ok(());
                    }
                }
            }
        }

        let strategy = effective_strategy(candidate);
        let mut entry = CacheEntry::new(key.clone(), candidate.selector.clone(), strategy, candidate.confidence);
        entry.stable = candidate.stable;
        entry.context_hash = context.map(str::to_string);

        // Collision policy: the stable, higher-confidence binding wins.
        if let Some(existing) = self.durable.load(&key)? {
            if existing.selector != entry.selector && !entry.supersedes(&existing) {
                debug!(
                    target: "pacts::cache",
                    key = %key,
                    kept = %existing.selector,
                    rejected = %entry.selector,
                    "kept superior existing cache entry"
                );
                return Ok(());
            }
            entry.hits = existing.hits;
            entry.misses = existing.misses;
            entry.created_at = existing.created_at;
        }

        let durable_allowed = self.config.allow_id_cache || !candidate.selector.starts_with('#');

        self.fast.insert(
            key,
            FastSlot {
                entry: entry.clone(),
                expires_at: now
                    + chrono::Duration::from_std(self.config.fast_ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            },
        );
        if durable_allowed {
            self.durable.upsert(entry)?;
            self.recent_writes.insert(dedup_key, now);
        }
        self.prune_dedup_window(now);
        Ok(())
    }

    /// Bump the miss counter of an existing entry; used when the gate
    /// rejects a cached selector.
    pub fn record_miss(&self, origin: &str, label: &str, context: Option<&str>) {
        let key = Self::key(origin, label, context);
        if let Some(mut slot) = self.fast.get_mut(&key) {
            slot.entry.misses += 1;
        }
        if let Ok(Some(mut entry)) = self.durable.load(&key) {
            entry.misses += 1;
            let _ = self.durable.upsert(entry);
        }
    }

    /// Hard invalidation after repeated gate failures on a cached
    /// selector.
    pub fn invalidate(&self, origin: &str, label: &str, context: Option<&str>) {
        let key = Self::key(origin, label, context);
        self.fast.remove(&key);
        let _ = self.durable.remove(&key);
        debug!(target: "pacts::cache", origin, label = %normalize_label(label), "cache entry invalidated");
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.fast.clear();
        self.durable.clear()
    }

    pub fn durable_entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        self.durable.all()
    }

    pub fn fast_len(&self) -> usize {
        self.fast.len()
    }

    fn prune_dedup_window(&self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.config.write_dedup_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        self.recent_writes.retain(|_, at| *at + window > now);
    }
}

/// Entries record the strategy that originally produced the selector;
/// replaying a cached candidate must not relabel it as `cached`.
fn effective_strategy(candidate: &Candidate) -> Strategy {
    if candidate.strategy != Strategy::Cached {
        return candidate.strategy;
    }
    candidate
        .meta
        .get("source_strategy")
        .and_then(|v| v.as_str())
        .and_then(strategy_from_name)
        .unwrap_or(Strategy::Cached)
}

fn strategy_from_name(name: &str) -> Option<Strategy> {
    serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SelectorCache {
        SelectorCache::new(CacheConfig::default(), Arc::new(InMemoryStore::default()))
    }

    fn aria_candidate() -> Candidate {
        Candidate::new("input[aria-label=\"Search\"]", Strategy::AriaLabel, 0.92)
    }

    #[test]
    fn write_then_read_returns_the_same_binding() {
        let cache = cache();
        cache
            .write("https://a.test", "Search", None, &aria_candidate())
            .unwrap();
        let entry = cache.read("https://a.test", "Search", None).unwrap();
        assert_eq!(entry.selector, "input[aria-label=\"Search\"]");
        assert_eq!(entry.strategy, Strategy::AriaLabel);
        assert!(entry.stable);
        assert_eq!(entry.confidence, 0.92);
    }

    #[test]
    fn reads_normalize_the_label() {
        let cache = cache();
        cache
            .write("https://a.test", "Search", None, &aria_candidate())
            .unwrap();
        assert!(cache.read("https://a.test", "  search ", None).is_some());
        assert!(cache.read("https://b.test", "Search", None).is_none());
    }

    #[test]
    fn hits_are_monotone_and_dedup_folds_into_hits() {
        let cache = cache();
        cache
            .write("https://a.test", "Search", None, &aria_candidate())
            .unwrap();
        let h1 = cache.read("https://a.test", "Search", None).unwrap().hits;
        // Duplicate write inside the window: no new entry, hits bump.
        cache
            .write("https://a.test", "Search", None, &aria_candidate())
            .unwrap();
        let h2 = cache.read("https://a.test", "Search", None).unwrap().hits;
        assert!(h2 > h1);
        assert_eq!(cache.durable_entries().unwrap().len(), 1);
    }

    #[test]
    fn unstable_hits_respect_the_policy_flag() {
        let mut config = CacheConfig::default();
        config.allow_unstable_hit = false;
        let cache = SelectorCache::new(config, Arc::new(InMemoryStore::default()));
        let unstable = Candidate::new("#search", Strategy::Id, 0.6);
        cache
            .write("https://a.test", "Search", None, &unstable)
            .unwrap();
        assert!(cache.read("https://a.test", "Search", None).is_none());

        let permissive = SelectorCache::new(CacheConfig::default(), Arc::new(InMemoryStore::default()));
        permissive
            .write("https://a.test", "Search", None, &unstable)
            .unwrap();
        assert!(permissive.read("https://a.test", "Search", None).is_some());
    }

    #[test]
    fn id_selectors_stay_out_of_the_durable_layer_when_forbidden() {
        let mut config = CacheConfig::default();
        config.allow_id_cache = false;
        let cache = SelectorCache::new(config, Arc::new(InMemoryStore::default()));
        let id_candidate = Candidate::new("#search", Strategy::Id, 0.6);
        cache
            .write("https://a.test", "Search", None, &id_candidate)
            .unwrap();
        assert!(cache.durable_entries().unwrap().is_empty());
        // The fast layer still serves it for the current session.
        assert!(cache.read("https://a.test", "Search", None).is_some());
    }

    #[test]
    fn stable_entry_survives_a_weaker_unstable_overwrite() {
        let cache = cache();
        cache
            .write("https://a.test", "Search", None, &aria_candidate())
            .unwrap();
        let weaker = Candidate::new("#search", Strategy::Id, 0.99);
        cache.write("https://a.test", "Search", None, &weaker).unwrap();
        let entry = cache.read("https://a.test", "Search", None).unwrap();
        assert_eq!(entry.selector, "input[aria-label=\"Search\"]");
        assert!(entry.stable);
    }

    #[test]
    fn invalidate_clears_both_layers() {
        let cache = cache();
        cache
            .write("https://a.test", "Search", None, &aria_candidate())
            .unwrap();
        cache.invalidate("https://a.test", "Search", None);
        assert!(cache.read("https://a.test", "Search", None).is_none());
        assert!(cache.durable_entries().unwrap().is_empty());
    }

    #[test]
    fn durable_hit_warms_the_fast_layer() {
        let durable: Arc<dyn DurableCacheStore> = Arc::new(InMemoryStore::default());
        let seed = SelectorCache::new(CacheConfig::default(), durable.clone());
        seed.write("https://a.test", "Search", None, &aria_candidate())
            .unwrap();

        // Fresh cache sharing the durable layer: first read comes from the
        // durable store and warms the fast layer.
        let cache = SelectorCache::new(CacheConfig::default(), durable);
        assert_eq!(cache.fast_len(), 0);
        assert!(cache.read("https://a.test", "Search", None).is_some());
        assert_eq!(cache.fast_len(), 1);
    }

    #[test]
    fn cached_candidates_preserve_their_source_strategy() {
        let cache = cache();
        let replayed = Candidate::new("input[aria-label=\"Search\"]", Strategy::Cached, 0.95)
            .with_stable(true)
            .with_meta("source_strategy", "aria_label");
        cache
            .write("https://a.test", "Search", None, &replayed)
            .unwrap();
        let entry = cache.read("https://a.test", "Search", None).unwrap();
        assert_eq!(entry.strategy, Strategy::AriaLabel);
    }

    #[test]
    fn misses_accumulate_via_record_miss() {
        let cache = cache();
        cache
            .write("https://a.test", "Search", None, &aria_candidate())
            .unwrap();
        cache.record_miss("https://a.test", "Search", None);
        cache.record_miss("https://a.test", "Search", None);
        let entry = cache.read("https://a.test", "Search", None).unwrap();
        assert_eq!(entry.misses, 2);
    }
}

//! Atomic counters with a consistent snapshot surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Default)]
pub(crate) struct Counters {
    cache_hit_fast: AtomicU64,
    cache_hit_durable: AtomicU64,
    cache_miss: AtomicU64,
    cache_hit_unstable: AtomicU64,
    steps_recorded: AtomicU64,
    step_duration_total_ms: AtomicU64,
    strategy_counts: DashMap<String, u64>,
    heal_counts: DashMap<String, u64>,
}

impl Counters {
    pub fn cache_hit_fast(&self) {
        self.cache_hit_fast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit_durable(&self) {
        self.cache_hit_durable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit_unstable(&self) {
        self.cache_hit_unstable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn strategy(&self, strategy: &str) {
        *self.strategy_counts.entry(strategy.to_string()).or_insert(0) += 1;
    }

    pub fn heal(&self, failure_kind: &str) {
        *self.heal_counts.entry(failure_kind.to_string()).or_insert(0) += 1;
    }

    pub fn step_duration(&self, duration_ms: u64) {
        self.steps_recorded.fetch_add(1, Ordering::Relaxed);
        self.step_duration_total_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            cache_hit_fast: self.cache_hit_fast.load(Ordering::Relaxed),
            cache_hit_durable: self.cache_hit_durable.load(Ordering::Relaxed),
            cache_miss: self.cache_miss.load(Ordering::Relaxed),
            cache_hit_unstable: self.cache_hit_unstable.load(Ordering::Relaxed),
            steps_recorded: self.steps_recorded.load(Ordering::Relaxed),
            step_duration_total_ms: self.step_duration_total_ms.load(Ordering::Relaxed),
            strategy_counts: self
                .strategy_counts
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            heal_counts: self
                .heal_counts
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub cache_hit_fast: u64,
    pub cache_hit_durable: u64,
    pub cache_miss: u64,
    pub cache_hit_unstable: u64,
    pub steps_recorded: u64,
    pub step_duration_total_ms: u64,
    pub strategy_counts: HashMap<String, u64>,
    pub heal_counts: HashMap<String, u64>,
}

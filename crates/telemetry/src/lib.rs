//! Telemetry sink: tagged structured events, counters, and the persistent
//! run-record store.

mod counters;
mod events;
mod run_store;

pub use counters::CounterSnapshot;
pub use events::{Tag, TelemetryEvent};
pub use run_store::RunStore;

use std::sync::Arc;

use parking_lot::Mutex;
use pacts_core_types::ReqId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("run store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("run record malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// In-process sink shared by every component of a run.
///
/// Events mirror to `tracing` as they arrive and accumulate in memory so
/// the coordinator can fold them into the run record at verdict time.
pub struct TelemetrySink {
    events: Mutex<Vec<TelemetryEvent>>,
    counters: counters::Counters,
}

impl TelemetrySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            counters: counters::Counters::default(),
        })
    }

    /// Record one tagged event.
    pub fn emit(
        &self,
        tag: Tag,
        req_id: &ReqId,
        step_idx: usize,
        heal_round: u32,
        latency_ms: u64,
        message: impl Into<String>,
    ) {
        let event = TelemetryEvent::new(tag, req_id.clone(), step_idx, heal_round, latency_ms, message);
        tracing::info!(
            target: "pacts::telemetry",
            tag = tag.label(),
            req_id = %event.req_id,
            step_idx,
            heal_round,
            latency_ms,
            "{}",
            event.message
        );
        self.events.lock().push(event);
    }

    /// Drain the events recorded for one run, preserving order.
    pub fn drain_run(&self, req_id: &ReqId) -> Vec<TelemetryEvent> {
        let mut guard = self.events.lock();
        let (run, rest): (Vec<_>, Vec<_>) =
            guard.drain(..).partition(|e| &e.req_id == req_id);
        *guard = rest;
        run
    }

    pub fn events_for(&self, req_id: &ReqId) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| &e.req_id == req_id)
            .cloned()
            .collect()
    }

    // Counter surface, one increment function per tracked series.

    pub fn record_cache_hit_fast(&self) {
        self.counters.cache_hit_fast();
    }

    pub fn record_cache_hit_durable(&self) {
        self.counters.cache_hit_durable();
    }

    pub fn record_cache_miss(&self) {
        self.counters.cache_miss();
    }

    pub fn record_cache_hit_unstable(&self) {
        self.counters.cache_hit_unstable();
    }

    pub fn record_strategy(&self, strategy: &str) {
        self.counters.strategy(strategy);
    }

    pub fn record_heal(&self, failure_kind: &str) {
        self.counters.heal(failure_kind);
    }

    pub fn record_step_duration(&self, duration_ms: u64) {
        self.counters.step_duration(duration_ms);
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_ordered_and_scoped_per_run() {
        let sink = TelemetrySink::new();
        let a = ReqId::new();
        let b = ReqId::new();
        sink.emit(Tag::Discovery, &a, 0, 0, 12, "tier aria_label hit");
        sink.emit(Tag::Gate, &b, 0, 0, 3, "unique failed");
        sink.emit(Tag::Exec, &a, 0, 0, 40, "click dispatched");

        let events = sink.drain_run(&a);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tag, Tag::Discovery);
        assert_eq!(events[1].tag, Tag::Exec);
        // the other run's events stay behind
        assert_eq!(sink.events_for(&b).len(), 1);
    }

    #[test]
    fn counters_accumulate() {
        let sink = TelemetrySink::new();
        sink.record_cache_hit_fast();
        sink.record_cache_hit_fast();
        sink.record_cache_miss();
        sink.record_cache_hit_unstable();
        sink.record_strategy("aria_label");
        sink.record_strategy("aria_label");
        sink.record_heal("not_visible");
        sink.record_step_duration(120);
        sink.record_step_duration(80);

        let snap = sink.counters();
        assert_eq!(snap.cache_hit_fast, 2);
        assert_eq!(snap.cache_miss, 1);
        assert_eq!(snap.cache_hit_unstable, 1);
        assert_eq!(snap.strategy_counts.get("aria_label"), Some(&2));
        assert_eq!(snap.heal_counts.get("not_visible"), Some(&1));
        assert_eq!(snap.steps_recorded, 2);
        assert_eq!(snap.step_duration_total_ms, 200);
    }
}

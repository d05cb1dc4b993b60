//! Engine assembly.
//!
//! Wires the full component stack behind one driver and one
//! configuration, so front-ends build a runnable engine in one call.

use std::sync::Arc;

use action_gate::Gate;
use browser_driver::BrowserDriver;
use discovery_engine::{AppSpecificStrategy, DiscoveryConfig, DiscoveryEngine};
use healer::{Healer, HealerConfig};
use hitl_bridge::{HitlBridge, HitlConfig};
use pacts_core_types::EngineConfig;
use pacts_telemetry::{RunStore, TelemetrySink};
use selector_cache::{DurableCacheStore, JsonFileStore, SelectorCache};
use step_executor::{ExecutorConfig, StepExecutor};

use crate::{BlockedDetector, CoordinatorError, DefaultBlockedDetector, RunCoordinator};

/// The assembled engine plus the shared handles front-ends care about.
pub struct EngineStack {
    pub coordinator: Arc<RunCoordinator>,
    pub cache: Arc<SelectorCache>,
    pub telemetry: Arc<TelemetrySink>,
    pub run_store: Arc<RunStore>,
}

impl EngineStack {
    /// Production wiring: JSON-file durable cache, JSON-lines run store,
    /// the default blocked detector, no plug-ins.
    pub fn build(
        driver: Arc<dyn BrowserDriver>,
        config: EngineConfig,
    ) -> Result<Self, CoordinatorError> {
        let durable: Arc<dyn DurableCacheStore> =
            Arc::new(JsonFileStore::open(config.cache_path.clone())?);
        Ok(Self::assemble(
            driver,
            config,
            durable,
            Arc::new(DefaultBlockedDetector::new()),
            Vec::new(),
        ))
    }

    /// Full wiring control for tests and embedders.
    pub fn assemble(
        driver: Arc<dyn BrowserDriver>,
        config: EngineConfig,
        durable: Arc<dyn DurableCacheStore>,
        blocked: Arc<dyn BlockedDetector>,
        plugins: Vec<Arc<dyn AppSpecificStrategy>>,
    ) -> Self {
        let telemetry = TelemetrySink::new();
        let cache = Arc::new(
            SelectorCache::new((&config).into(), durable).with_telemetry(telemetry.clone()),
        );
        let gate = Arc::new(Gate::new(driver.clone()));

        let mut discovery = DiscoveryEngine::new(
            driver.clone(),
            gate.clone(),
            cache.clone(),
            telemetry.clone(),
            DiscoveryConfig::from(&config),
        );
        for plugin in plugins {
            discovery = discovery.with_plugin(plugin);
        }
        let discovery = Arc::new(discovery);

        let executor = Arc::new(StepExecutor::new(
            driver.clone(),
            discovery,
            gate.clone(),
            telemetry.clone(),
            ExecutorConfig::from(&config),
        ));
        let healer = Arc::new(Healer::new(
            driver.clone(),
            gate,
            cache.clone(),
            telemetry.clone(),
            HealerConfig::from(&config),
        ));
        let hitl = Arc::new(HitlBridge::new(HitlConfig::from(&config)));
        let run_store = Arc::new(RunStore::new(config.run_store_path.clone()));

        let coordinator = Arc::new(RunCoordinator::new(
            driver,
            executor,
            healer,
            hitl,
            telemetry.clone(),
            Some(run_store.clone()),
            blocked,
            config,
        ));

        Self {
            coordinator,
            cache,
            telemetry,
            run_store,
        }
    }
}

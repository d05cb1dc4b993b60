//! Selector discovery.
//!
//! An ordered ladder of strategies turns an intent's human label into at
//! most one gated selector candidate. The ladder is data: operators can
//! reorder it, and each tier is a pure probe over the driver. Tiers walk
//! until one survives the actionability gate, all under a single
//! wall-clock budget.

mod plugins;
mod roles;

pub use plugins::{AppSpecificStrategy, ComboboxProtocol};
pub use roles::{is_dismissal_name, name_candidates, roles_for_action, tag_for_role};

use std::sync::Arc;
use std::time::{Duration, Instant};

use action_gate::{Gate, GateError, GateSpec, VisibilityMode};
use browser_driver::{BrowserDriver, DriverError, Locator, NamePattern};
use dashmap::DashMap;
use pacts_core_types::{Candidate, EngineConfig, Intent, ReqId, Strategy};
use pacts_telemetry::{Tag, TelemetrySink};
use selector_cache::SelectorCache;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Gate(#[from] GateError),
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Total wall-clock budget per intent.
    pub total_timeout: Duration,
    pub confidence_decay_per_round: f64,
    /// Keep the label-derived tiers ahead of the role tiers.
    pub label_first: bool,
    /// Readiness bound before a scoped subtree search.
    pub region_ready_timeout: Duration,
    /// Settle pause after the subtree reports ready.
    pub region_settle: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(30),
            confidence_decay_per_round: 0.03,
            label_first: true,
            region_ready_timeout: Duration::from_secs(3),
            region_settle: Duration::from_secs(1),
        }
    }
}

impl From<&EngineConfig> for DiscoveryConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            total_timeout: Duration::from_millis(cfg.discovery_total_timeout_ms),
            confidence_decay_per_round: cfg.confidence_decay_per_round,
            label_first: cfg.label_first_discovery,
            ..Self::default()
        }
    }
}

/// One discovery invocation.
#[derive(Clone, Debug)]
pub struct DiscoveryRequest {
    pub req_id: ReqId,
    pub step_idx: usize,
    pub heal_round: u32,
    pub origin: String,
    pub intent: Intent,
    pub visibility: VisibilityMode,
    pub bypass_cache: bool,
}

pub struct DiscoveryEngine {
    driver: Arc<dyn BrowserDriver>,
    gate: Arc<Gate>,
    cache: Arc<SelectorCache>,
    telemetry: Arc<TelemetrySink>,
    config: DiscoveryConfig,
    plugins: Vec<Arc<dyn AppSpecificStrategy>>,
    /// Gate failures of cached selectors per `(run, step)`; two failures
    /// trigger hard invalidation.
    cached_gate_failures: DashMap<(String, usize), u32>,
}

impl DiscoveryEngine {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        gate: Arc<Gate>,
        cache: Arc<SelectorCache>,
        telemetry: Arc<TelemetrySink>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            driver,
            gate,
            cache,
            telemetry,
            config,
            plugins: Vec::new(),
            cached_gate_failures: DashMap::new(),
        }
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn AppSpecificStrategy>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Produce at most one gated candidate for the intent. `None` means
    /// every tier was exhausted or the budget elapsed; the caller maps
    /// that to `DiscoveryNone`.
    pub async fn discover(
        &self,
        req: &DiscoveryRequest,
    ) -> Result<Option<Candidate>, DiscoveryError> {
        let started = Instant::now();
        match timeout(self.config.total_timeout, self.walk_ladder(req)).await {
            Ok(result) => result,
            Err(_) => {
                self.telemetry.emit(
                    Tag::Discovery,
                    &req.req_id,
                    req.step_idx,
                    req.heal_round,
                    started.elapsed().as_millis() as u64,
                    format!("discovery budget exhausted for '{}'", req.intent.label()),
                );
                Ok(None)
            }
        }
    }

    fn tier_order(&self, req: &DiscoveryRequest) -> Vec<Strategy> {
        if let Some(order) = &req.intent.hints.tier_order {
            return order.clone();
        }
        if self.config.label_first {
            Strategy::default_tier_order()
        } else {
            vec![
                Strategy::Cached,
                Strategy::RoleName,
                Strategy::RoleNameDisambiguated,
                Strategy::AriaLabel,
                Strategy::NameAttr,
                Strategy::Placeholder,
                Strategy::LabelFor,
                Strategy::TextHas,
                Strategy::RegionScoped,
                Strategy::AppSpecific,
            ]
        }
    }

    async fn walk_ladder(
        &self,
        req: &DiscoveryRequest,
    ) -> Result<Option<Candidate>, DiscoveryError> {
        let landmark = match &req.intent.step.within {
            Some(within) => self.resolve_landmark(within).await,
            None => None,
        };
        let spec = self.gate_spec(req, landmark.clone());

        for strategy in self.tier_order(req) {
            let tier_start = Instant::now();
            let outcome = match strategy {
                Strategy::Cached => self.try_cached(req, &spec).await,
                Strategy::AriaLabel => {
                    self.try_locators(req, &spec, aria_label_locators(req), Strategy::AriaLabel)
                        .await
                }
                Strategy::NameAttr => {
                    self.try_locators(req, &spec, name_attr_locators(req), Strategy::NameAttr)
                        .await
                }
                Strategy::Placeholder => {
                    self.try_locators(req, &spec, placeholder_locators(req), Strategy::Placeholder)
                        .await
                }
                Strategy::LabelFor => self.try_label_for(req, &spec).await,
                Strategy::RoleName => self.try_role_name(req, &spec, false).await,
                Strategy::RoleNameDisambiguated => self.try_role_name(req, &spec, true).await,
                Strategy::TextHas => {
                    self.try_locators(req, &spec, text_has_locators(req), Strategy::TextHas)
                        .await
                }
                Strategy::Id => continue,
                Strategy::RegionScoped => {
                    self.try_region_scoped(req, landmark.as_ref()).await
                }
                Strategy::AppSpecific => self.try_plugins(req, &spec).await,
            };

            match outcome {
                Ok(Some(candidate)) => {
                    self.telemetry.emit(
                        Tag::Discovery,
                        &req.req_id,
                        req.step_idx,
                        req.heal_round,
                        tier_start.elapsed().as_millis() as u64,
                        format!(
                            "tier {} resolved '{}' (confidence {:.2})",
                            strategy, candidate.selector, candidate.confidence
                        ),
                    );
                    self.telemetry.record_strategy(strategy.name());
                    return Ok(Some(candidate));
                }
                Ok(None) => {
                    debug!(
                        target: "pacts::discovery",
                        tier = strategy.name(),
                        label = req.intent.label(),
                        "tier produced no candidate"
                    );
                }
                Err(err) => {
                    // A failing tier never sinks the whole ladder.
                    warn!(
                        target: "pacts::discovery",
                        tier = strategy.name(),
                        %err,
                        "tier errored, moving on"
                    );
                }
            }
        }

        self.telemetry.emit(
            Tag::Discovery,
            &req.req_id,
            req.step_idx,
            req.heal_round,
            0,
            format!("all tiers exhausted for '{}'", req.intent.label()),
        );
        Ok(None)
    }

    fn gate_spec(&self, req: &DiscoveryRequest, within: Option<Locator>) -> GateSpec {
        let mut spec = GateSpec::for_action(req.intent.action(), req.heal_round)
            .with_visibility(req.visibility);
        if let Some(landmark) = within {
            spec = spec.with_within(landmark);
        }
        spec
    }

    fn decayed(&self, strategy: Strategy, heal_round: u32) -> f64 {
        (strategy.baseline_confidence() - self.config.confidence_decay_per_round * heal_round as f64)
            .max(0.0)
    }

    async fn gate_pass(
        &self,
        spec: &GateSpec,
        locator: &Locator,
    ) -> Result<bool, DiscoveryError> {
        let report = self.gate.evaluate(locator, spec).await?;
        Ok(report.overall())
    }

    fn accept(
        &self,
        req: &DiscoveryRequest,
        locator: &Locator,
        strategy: Strategy,
    ) -> Candidate {
        let candidate = Candidate::new(
            locator.to_string(),
            strategy,
            self.decayed(strategy, req.heal_round),
        );
        if let Err(err) = self.cache.write(
            &req.origin,
            req.intent.label(),
            req.intent.step.within.as_deref(),
            &candidate,
        ) {
            warn!(target: "pacts::discovery", %err, "cache write failed");
        }
        candidate
    }

    async fn try_locators(
        &self,
        req: &DiscoveryRequest,
        spec: &GateSpec,
        locators: Vec<Locator>,
        strategy: Strategy,
    ) -> Result<Option<Candidate>, DiscoveryError> {
        for locator in locators {
            if self.gate_pass(spec, &locator).await? {
                return Ok(Some(self.accept(req, &locator, strategy)));
            }
        }
        Ok(None)
    }

    async fn try_cached(
        &self,
        req: &DiscoveryRequest,
        spec: &GateSpec,
    ) -> Result<Option<Candidate>, DiscoveryError> {
        if req.bypass_cache {
            return Ok(None);
        }
        let context = req.intent.step.within.as_deref();
        let Some(entry) = self
            .cache
            .read(&req.origin, req.intent.label(), context)
        else {
            return Ok(None);
        };

        let Ok(locator) = Locator::parse(&entry.selector) else {
            self.cache
                .invalidate(&req.origin, req.intent.label(), context);
            return Ok(None);
        };

        if self.gate_pass(spec, &locator).await? {
            let candidate = Candidate::new(entry.selector.clone(), Strategy::Cached, entry.confidence)
                .with_stable(entry.stable)
                .with_meta("source_strategy", entry.strategy.name());
            return Ok(Some(candidate));
        }

        // Gate rejected the cached binding: count it, invalidate on the
        // second rejection within the same step.
        self.cache
            .record_miss(&req.origin, req.intent.label(), context);
        let fail_key = (req.req_id.0.clone(), req.step_idx);
        let mut fails = self.cached_gate_failures.entry(fail_key).or_insert(0);
        *fails += 1;
        if *fails >= 2 {
            self.cache
                .invalidate(&req.origin, req.intent.label(), context);
            self.telemetry.emit(
                Tag::Cache,
                &req.req_id,
                req.step_idx,
                req.heal_round,
                0,
                format!("cached selector invalidated after repeated gate failures: {}", entry.selector),
            );
        }
        Ok(None)
    }

    async fn try_label_for(
        &self,
        req: &DiscoveryRequest,
        spec: &GateSpec,
    ) -> Result<Option<Candidate>, DiscoveryError> {
        let label_locator = Locator::css_with_text("label", req.intent.label());
        let probes = self.driver.query(&label_locator).await?;
        if probes.is_empty() {
            return Ok(None);
        }
        let Some(target_id) = self.driver.attribute(&label_locator, "for").await? else {
            return Ok(None);
        };
        if target_id.is_empty() {
            return Ok(None);
        }
        // Bound through a generated id: workable today, volatile tomorrow.
        let locator = Locator::css(format!("#{target_id}"));
        if self.gate_pass(spec, &locator).await? {
            return Ok(Some(self.accept(req, &locator, Strategy::LabelFor)));
        }
        Ok(None)
    }

    async fn try_role_name(
        &self,
        req: &DiscoveryRequest,
        spec: &GateSpec,
        disambiguate: bool,
    ) -> Result<Option<Candidate>, DiscoveryError> {
        let roles: Vec<String> = match &req.intent.hints.role {
            Some(role) => vec![role.clone()],
            None => roles_for_action(req.intent.action())
                .iter()
                .map(|r| r.to_string())
                .collect(),
        };

        for role in roles {
            let locator = Locator::role(&role, NamePattern::regex_ci(req.intent.label()));
            let probes = self.driver.query(&locator).await?;
            match (probes.len(), disambiguate) {
                (0, _) => continue,
                (1, false) => {
                    if self.gate_pass(spec, &locator).await? {
                        return Ok(Some(self.accept(req, &locator, Strategy::RoleName)));
                    }
                }
                (_, false) => {
                    // Ambiguous; the disambiguation tier owns this case.
                    continue;
                }
                (_, true) => {
                    // Drop tab-homed candidates and dismissal controls,
                    // then bind the first survivor by position.
                    let survivor = probes
                        .iter()
                        .enumerate()
                        .find(|(_, p)| !p.in_tab && !is_dismissal_name(&p.name));
                    let Some((index, _)) = survivor else {
                        continue;
                    };
                    let picked = locator.clone().nth(index);
                    if self.gate_pass(spec, &picked).await? {
                        return Ok(Some(
                            self.accept(req, &picked, Strategy::RoleNameDisambiguated),
                        ));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn try_region_scoped(
        &self,
        req: &DiscoveryRequest,
        landmark: Option<&Locator>,
    ) -> Result<Option<Candidate>, DiscoveryError> {
        let Some(landmark) = landmark else {
            return Ok(None);
        };

        // The subtree may still be rendering; give it a bounded readiness
        // window plus a settle pause before searching inside it.
        if let Err(err) = self
            .driver
            .wait_for_dom_idle(self.config.region_ready_timeout.as_millis() as u64)
            .await
        {
            debug!(target: "pacts::discovery", %err, "region readiness wait elapsed");
        }
        sleep(self.config.region_settle).await;

        // Scoped rerun of the label and role tiers; the chain itself
        // carries the scope, so the gate needs no separate landmark.
        let spec = GateSpec::for_action(req.intent.action(), req.heal_round)
            .with_visibility(req.visibility);

        let mut locators = Vec::new();
        locators.extend(aria_label_locators(req));
        locators.extend(name_attr_locators(req));
        locators.extend(placeholder_locators(req));
        for role in roles_for_action(req.intent.action()) {
            locators.push(Locator::role(*role, NamePattern::regex_ci(req.intent.label())));
        }
        locators.extend(text_has_locators(req));

        for locator in locators {
            let scoped = locator.scoped_under(landmark);
            if self.gate_pass(&spec, &scoped).await? {
                return Ok(Some(self.accept(req, &scoped, Strategy::RegionScoped)));
            }
        }
        Ok(None)
    }

    async fn try_plugins(
        &self,
        req: &DiscoveryRequest,
        spec: &GateSpec,
    ) -> Result<Option<Candidate>, DiscoveryError> {
        for plugin in &self.plugins {
            if !req.origin.contains(plugin.origin_pattern()) {
                continue;
            }
            if let Some(candidate) = plugin.discover(&self.driver, &req.intent).await? {
                if let Ok(locator) = Locator::parse(&candidate.selector) {
                    if self.gate_pass(spec, &locator).await? {
                        return Ok(Some(candidate));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Resolve a `within` hint to a concrete landmark locator, once per
    /// discovery.
    pub async fn resolve_landmark(&self, within: &str) -> Option<Locator> {
        let mut candidates = vec![
            Locator::css(format!("[aria-label=\"{within}\"]")),
            Locator::css(format!("[aria-label*=\"{}\" i]", within.to_lowercase())),
        ];
        for role in ["region", "navigation", "dialog", "complementary"] {
            candidates.push(Locator::role(role, NamePattern::regex_ci(within)));
        }
        for locator in candidates {
            match self.driver.query(&locator).await {
                Ok(probes) if !probes.is_empty() => return Some(locator),
                Ok(_) => continue,
                Err(err) => {
                    debug!(target: "pacts::discovery", %err, "landmark probe failed");
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Pure locator generators per tier
// ---------------------------------------------------------------------------

fn input_tags(req: &DiscoveryRequest) -> &'static [&'static str] {
    match req.intent.action() {
        pacts_core_types::Action::Click | pacts_core_types::Action::Hover => &["button", "a"],
        _ => &["input", "textarea", "select"],
    }
}

fn aria_label_locators(req: &DiscoveryRequest) -> Vec<Locator> {
    let label = req.intent.label();
    let lower = label.to_lowercase();
    let tags = input_tags(req);
    let mut locators: Vec<Locator> = tags
        .iter()
        .map(|tag| Locator::css(format!("{tag}[aria-label=\"{label}\"]")))
        .collect();
    locators.extend(
        tags.iter()
            .map(|tag| Locator::css(format!("{tag}[aria-label*=\"{lower}\" i]"))),
    );
    // Tag-free fallbacks would happily bind a toggle button to a fill
    // intent, so they stay reserved for pointer actions.
    if matches!(
        req.intent.action(),
        pacts_core_types::Action::Click | pacts_core_types::Action::Hover | pacts_core_types::Action::Press
    ) {
        locators.push(Locator::css(format!("[aria-label=\"{label}\"]")));
        locators.push(Locator::css(format!("[aria-label*=\"{lower}\" i]")));
    }
    locators
}

fn name_attr_locators(req: &DiscoveryRequest) -> Vec<Locator> {
    let mut locators = Vec::new();
    for name in name_candidates(req.intent.label()) {
        for tag in ["input", "textarea", "select"] {
            locators.push(Locator::css(format!("{tag}[name=\"{name}\"]")));
        }
    }
    locators
}

fn placeholder_locators(req: &DiscoveryRequest) -> Vec<Locator> {
    let label = req.intent.label().to_lowercase();
    vec![
        Locator::css(format!("input[placeholder*=\"{label}\" i]")),
        Locator::css(format!("textarea[placeholder*=\"{label}\" i]")),
    ]
}

fn text_has_locators(req: &DiscoveryRequest) -> Vec<Locator> {
    let label = req.intent.label();
    let mut locators = Vec::new();
    for role in roles_for_action(req.intent.action()) {
        let tag = tag_for_role(role);
        if tag != "*" {
            locators.push(Locator::css_with_text(tag, label));
        }
    }
    locators.push(Locator::css_with_text("*", label));
    locators
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_gate::Gate;
    use browser_driver::fake::{FakeDriver, FakeElement};
    use pacts_core_types::{Action, Step};
    use selector_cache::{CacheConfig, InMemoryStore, SelectorCache};

    fn engine(driver: Arc<FakeDriver>) -> DiscoveryEngine {
        let driver: Arc<dyn BrowserDriver> = driver;
        let gate = Arc::new(Gate::new(driver.clone()));
        let cache = Arc::new(SelectorCache::new(
            CacheConfig::default(),
            Arc::new(InMemoryStore::default()),
        ));
        DiscoveryEngine::new(
            driver,
            gate,
            cache,
            TelemetrySink::new(),
            DiscoveryConfig::default(),
        )
    }

    fn request(intent: Intent) -> DiscoveryRequest {
        DiscoveryRequest {
            req_id: ReqId::new(),
            step_idx: 0,
            heal_round: 0,
            origin: "https://shop.test".into(),
            intent,
            visibility: VisibilityMode::Required,
            bypass_cache: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aria_label_tier_wins_for_labeled_inputs() {
        let driver = FakeDriver::new("https://shop.test");
        driver.add_element(
            FakeElement::new("search", "input")
                .with_attr("type", "search")
                .with_aria_label("Search"),
        );
        let engine = engine(driver);
        let req = request(Intent::new(
            Step::new("Search", Action::Fill).with_value("rust"),
        ));

        let candidate = engine.discover(&req).await.unwrap().unwrap();
        assert_eq!(candidate.strategy, Strategy::AriaLabel);
        assert_eq!(candidate.selector, "input[aria-label=\"Search\"]");
        assert!(candidate.stable);

        // The pass-through write landed in the cache with the producing
        // strategy recorded.
        let entry = engine
            .cache
            .read("https://shop.test", "Search", None)
            .unwrap();
        assert_eq!(entry.strategy, Strategy::AriaLabel);
        assert!(entry.stable);
    }

    #[tokio::test(start_paused = true)]
    async fn second_discovery_replays_from_the_cache() {
        let driver = FakeDriver::new("https://shop.test");
        driver.add_element(
            FakeElement::new("search", "input").with_aria_label("Search"),
        );
        let engine = engine(driver);
        let req = request(Intent::new(Step::new("Search", Action::Fill)));

        let first = engine.discover(&req).await.unwrap().unwrap();
        assert_eq!(first.strategy, Strategy::AriaLabel);

        let second = engine.discover(&req).await.unwrap().unwrap();
        assert_eq!(second.strategy, Strategy::Cached);
        assert_eq!(second.selector, first.selector);
        assert_eq!(
            second.meta.get("source_strategy").and_then(|v| v.as_str()),
            Some("aria_label")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_role_matches_fall_to_disambiguation() {
        let driver = FakeDriver::new("https://shop.test");
        driver.add_element(
            FakeElement::new("tab-save", "button")
                .with_text("Save")
                .inside_tab(),
        );
        driver.add_element(FakeElement::new("primary-save", "button").with_text("Save"));
        let engine = engine(driver);
        let req = request(Intent::new(Step::new("Save", Action::Click)));

        let candidate = engine.discover(&req).await.unwrap().unwrap();
        assert_eq!(candidate.strategy, Strategy::RoleNameDisambiguated);
        assert!(candidate.selector.contains("nth=1"), "{}", candidate.selector);
        assert!(!candidate.stable);
    }

    #[tokio::test(start_paused = true)]
    async fn within_hint_scopes_the_search_to_the_landmark() {
        let driver = FakeDriver::new("https://shop.test");
        // The out-of-region duplicate comes first in DOM order, so every
        // global tier either matches both or binds the wrong one.
        driver.add_element(
            FakeElement::new("outer", "input")
                .with_attr("placeholder", "Search apps")
                .with_bbox(10.0, 10.0, 200.0, 32.0),
        );
        driver.add_element(FakeElement::new("panel", "div").with_aria_label("App Launcher"));
        driver.add_element(
            FakeElement::new("inner", "input")
                .with_attr("placeholder", "Search apps")
                .with_parent("panel")
                .with_bbox(400.0, 300.0, 200.0, 32.0),
        );
        let engine = engine(driver);
        let req = request(Intent::new(
            Step::new("Search apps", Action::Fill).with_within("App Launcher"),
        ));

        let candidate = engine.discover(&req).await.unwrap().unwrap();
        assert_eq!(candidate.strategy, Strategy::RegionScoped);
        assert!(candidate.selector.contains(" >> "), "{}", candidate.selector);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cache_entry_is_invalidated_after_two_gate_failures() {
        // Page is empty, so every live tier misses and the cached binding
        // fails the gate on each attempt.
        let driver = FakeDriver::new("https://shop.test");
        let engine = engine(driver);

        let stale = Candidate::new("input[aria-label=\"Legacy\"]", Strategy::AriaLabel, 0.9);
        engine
            .cache
            .write("https://shop.test", "Search", None, &stale)
            .unwrap();

        let req = request(Intent::new(Step::new("Search", Action::Fill)));
        assert!(engine.discover(&req).await.unwrap().is_none());
        // First rejection only counts; the entry survives.
        assert!(engine.cache.read("https://shop.test", "Search", None).is_some());

        assert!(engine.discover(&req).await.unwrap().is_none());
        // Second rejection within the same step hard-invalidates.
        assert!(engine.cache.read("https://shop.test", "Search", None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_page_yields_no_candidate() {
        let driver = FakeDriver::new("https://shop.test");
        let engine = engine(driver);
        let req = request(Intent::new(Step::new("Ghost", Action::Click)));
        assert!(engine.discover(&req).await.unwrap().is_none());
    }
}

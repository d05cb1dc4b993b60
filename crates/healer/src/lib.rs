//! Self-healing.
//!
//! A heal round is a fixed reveal → reprobe → stabilize sequence. Reveal
//! repairs the environment (focus, scroll, overlays, network settle);
//! reprobe proposes a replacement selector from a per-round ladder;
//! stabilize re-runs the actionability gate at the current round's
//! tolerances. Two guards bound the loop independently of the round
//! ceiling: a reprobe that returns nothing twice in a row, and a reprobe
//! that re-proposes the selector that just failed.

use std::sync::Arc;
use std::time::Instant;

use action_gate::{Gate, GateSpec, VisibilityMode};
use browser_driver::{BrowserDriver, Locator, NamePattern};
use discovery_engine::{name_candidates, roles_for_action};
use pacts_core_types::{
    Action, Candidate, EngineConfig, FailureKind, HealEvent, Intent, ReqId, Strategy,
};
use pacts_telemetry::{Tag, TelemetrySink};
use selector_cache::SelectorCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NETWORK_SETTLE_MS: u64 = 2_000;

#[derive(Clone, Debug)]
pub struct HealerConfig {
    pub max_heal_rounds: u32,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self { max_heal_rounds: 3 }
    }
}

impl From<&EngineConfig> for HealerConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_heal_rounds: cfg.effective_max_heal_rounds(),
        }
    }
}

/// Everything one heal round needs; the healer never sees run state.
#[derive(Clone, Debug)]
pub struct HealRequest {
    pub req_id: ReqId,
    pub step_idx: usize,
    /// The round being executed (1-based).
    pub round: u32,
    pub origin: String,
    pub intent: Intent,
    pub failure: FailureKind,
    pub last_selector: Option<String>,
    /// Snapshot of the run's heal history.
    pub prior_events: Vec<HealEvent>,
    pub cancel: CancellationToken,
}

/// Proposed mutations, returned whole. `events` is the full extended
/// list; the coordinator installs it by reassignment so the append is
/// always observable.
#[derive(Clone, Debug)]
pub struct HealOutcome {
    pub events: Vec<HealEvent>,
    pub new_candidate: Option<Candidate>,
    /// Round value to install (the ceiling when a guard fired).
    pub heal_round: u32,
    pub failure: FailureKind,
    pub force_terminal: bool,
    pub rca_detail: Option<String>,
}

pub struct Healer {
    driver: Arc<dyn BrowserDriver>,
    gate: Arc<Gate>,
    cache: Arc<SelectorCache>,
    telemetry: Arc<TelemetrySink>,
    config: HealerConfig,
}

impl Healer {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        gate: Arc<Gate>,
        cache: Arc<SelectorCache>,
        telemetry: Arc<TelemetrySink>,
        config: HealerConfig,
    ) -> Self {
        Self {
            driver,
            gate,
            cache,
            telemetry,
            config,
        }
    }

    pub async fn heal(&self, req: HealRequest) -> HealOutcome {
        let started = Instant::now();
        let mut actions: Vec<String> = Vec::new();

        if req.cancel.is_cancelled() {
            return self.cancelled(req, actions, started);
        }

        // Phase A: environmental corrections, all best-effort.
        self.reveal(&req, &mut actions).await;

        if req.cancel.is_cancelled() {
            return self.cancelled(req, actions, started);
        }

        // Phase B: selector drift correction.
        let proposal = self.reprobe(&req, &mut actions).await;

        let Some(locator) = proposal else {
            return self.handle_reprobe_none(req, actions, started);
        };

        if let Some(outcome) = self
            .check_identical_selector(&req, &locator, &mut actions, started)
            .await
        {
            return outcome;
        }

        if req.cancel.is_cancelled() {
            return self.cancelled(req, actions, started);
        }

        // Phase C: stabilize under the round's adaptive tolerances.
        self.stabilize(req, locator, actions, started).await
    }

    fn cancelled(
        &self,
        req: HealRequest,
        actions: Vec<String>,
        started: Instant,
    ) -> HealOutcome {
        let event = self.event(&req, actions, None, None, false, started);
        HealOutcome {
            events: extend(req.prior_events, event),
            new_candidate: None,
            heal_round: self.config.max_heal_rounds,
            failure: FailureKind::Cancelled,
            force_terminal: true,
            rca_detail: Some("run cancelled during healing".into()),
        }
    }

    async fn reveal(&self, req: &HealRequest, actions: &mut Vec<String>) {
        if self.driver.bring_to_front().await.is_ok() {
            actions.push("bring_to_front".into());
        }
        if let Some(selector) = &req.last_selector {
            if let Ok(locator) = Locator::parse(selector) {
                if self.driver.scroll_into_view(&locator).await.is_ok() {
                    actions.push("scroll_into_view".into());
                }
            }
        }
        if self.driver.dismiss_overlays().await.is_ok() {
            actions.push("dismiss_overlays".into());
        }
        match self.driver.wait_for_network_idle(NETWORK_SETTLE_MS).await {
            Ok(()) => actions.push("wait_for_network_idle".into()),
            Err(err) => debug!(target: "pacts::heal", %err, "network settle window elapsed"),
        }
    }

    /// Per-round reprobe ladder. Returns the first locator that resolves
    /// to at least one live element.
    async fn reprobe(&self, req: &HealRequest, actions: &mut Vec<String>) -> Option<Locator> {
        let candidates = match req.round {
            1 => self.reprobe_role_relaxed(&req.intent),
            2 => self.reprobe_label_fallbacks(&req.intent).await,
            _ => self.reprobe_css_heuristics(req).await,
        };
        actions.push(format!("reprobe:{}", reprobe_tier_name(req.round)));

        for locator in candidates {
            match self.driver.query(&locator).await {
                Ok(probes) if !probes.is_empty() => return Some(locator),
                Ok(_) => continue,
                Err(err) => {
                    debug!(target: "pacts::heal", %err, "reprobe query failed");
                }
            }
        }
        None
    }

    fn reprobe_role_relaxed(&self, intent: &Intent) -> Vec<Locator> {
        let mut roles: Vec<String> = Vec::new();
        if let Some(role) = &intent.hints.role {
            roles.push(role.clone());
        }
        roles.extend(
            roles_for_action(intent.action())
                .iter()
                .map(|r| r.to_string()),
        );
        roles
            .into_iter()
            .map(|role| Locator::role(role, NamePattern::regex_ci(intent.label())))
            .collect()
    }

    async fn reprobe_label_fallbacks(&self, intent: &Intent) -> Vec<Locator> {
        let mut locators = Vec::new();
        // label[for] resolution first, then placeholder containment.
        let label_locator = Locator::css_with_text("label", intent.label());
        if let Ok(Some(target_id)) = self.driver.attribute(&label_locator, "for").await {
            if !target_id.is_empty() {
                locators.push(Locator::css(format!("#{target_id}")));
            }
        }
        let lower = intent.label().to_lowercase();
        locators.push(Locator::css(format!("input[placeholder*=\"{lower}\" i]")));
        locators.push(Locator::css(format!("textarea[placeholder*=\"{lower}\" i]")));
        locators
    }

    async fn reprobe_css_heuristics(&self, req: &HealRequest) -> Vec<Locator> {
        let mut locators = Vec::new();
        // Last-known-good binding from the cache leads this tier.
        if let Some(entry) = self.cache.read(
            &req.origin,
            req.intent.label(),
            req.intent.step.within.as_deref(),
        ) {
            if let Ok(locator) = Locator::parse(&entry.selector) {
                locators.push(locator);
            }
        }
        for keyword in name_candidates(req.intent.label()) {
            locators.push(Locator::css(format!("[id*=\"{keyword}\" i]")));
            locators.push(Locator::css(format!("[class*=\"{keyword}\" i]")));
        }
        locators
    }

    /// Guard: a reprobe that found nothing, twice in a row for the same
    /// step, terminates the run with a descriptive cause.
    fn handle_reprobe_none(
        &self,
        req: HealRequest,
        actions: Vec<String>,
        started: Instant,
    ) -> HealOutcome {
        let previous_was_none = req
            .prior_events
            .iter()
            .rev()
            .find(|e| e.step_idx == req.step_idx)
            .map(|e| e.new_selector.is_none())
            .unwrap_or(false);

        let event = self.event(&req, actions, None, None, false, started);
        self.telemetry.record_heal(req.failure.name());

        if previous_was_none {
            let rca = format!(
                "element '{}' not found after {} discovery attempts",
                req.intent.label(),
                req.round
            );
            self.telemetry.emit(
                Tag::Heal,
                &req.req_id,
                req.step_idx,
                req.round,
                0,
                format!("repeated-none guard fired: {rca}"),
            );
            return HealOutcome {
                events: extend(req.prior_events, event),
                new_candidate: None,
                heal_round: self.config.max_heal_rounds,
                failure: FailureKind::DiscoveryNone,
                force_terminal: true,
                rca_detail: Some(rca),
            };
        }

        HealOutcome {
            events: extend(req.prior_events, event),
            new_candidate: None,
            heal_round: req.round,
            failure: FailureKind::DiscoveryNone,
            force_terminal: false,
            rca_detail: Some(format!(
                "no replacement selector for '{}' in round {}",
                req.intent.label(),
                req.round
            )),
        }
    }

    /// Guard: a reprobe that re-proposes what the previous heal round
    /// already proposed. Fills get one activation attempt (the
    /// hidden-input case); everything else terminates.
    async fn check_identical_selector(
        &self,
        req: &HealRequest,
        locator: &Locator,
        actions: &mut Vec<String>,
        started: Instant,
    ) -> Option<HealOutcome> {
        let proposed = locator.to_string();
        let previous = req
            .prior_events
            .iter()
            .rev()
            .find(|e| e.step_idx == req.step_idx)
            .and_then(|e| e.new_selector.clone());
        if previous.as_deref() != Some(proposed.as_str()) {
            return None;
        }

        if req.intent.action() == Action::Fill {
            // Escalate through activation instead of giving up.
            let activator = Locator::role("button", NamePattern::regex_ci(req.intent.label()));
            if self.driver.click(&activator).await.is_ok() {
                actions.push("activate_adjacent".into());
                if matches!(self.driver.is_visible(locator).await, Ok(true)) {
                    return None; // proceed to stabilize
                }
            }
        }

        let rca = "Selector repeatedly failed validation".to_string();
        self.telemetry.emit(
            Tag::Heal,
            &req.req_id,
            req.step_idx,
            req.round,
            0,
            format!("identical-selector guard fired on '{proposed}'"),
        );
        self.telemetry.record_heal(req.failure.name());
        let event = self.event(
            req,
            actions.clone(),
            req.last_selector.clone(),
            Some(proposed),
            false,
            started,
        );
        Some(HealOutcome {
            events: extend(req.prior_events.clone(), event),
            new_candidate: None,
            heal_round: self.config.max_heal_rounds,
            failure: req.failure,
            force_terminal: true,
            rca_detail: Some(rca),
        })
    }

    async fn stabilize(
        &self,
        req: HealRequest,
        locator: Locator,
        mut actions: Vec<String>,
        started: Instant,
    ) -> HealOutcome {
        let visibility = if req.intent.action().defers_visibility() {
            VisibilityMode::Deferred
        } else {
            VisibilityMode::Required
        };
        let spec = GateSpec::for_action(req.intent.action(), req.round).with_visibility(visibility);

        let report = match self.gate.evaluate(&locator, &spec).await {
            Ok(report) => report,
            Err(err) => {
                warn!(target: "pacts::heal", %err, "stabilize gate errored");
                actions.push("stabilize:errored".into());
                let event = self.event(
                    &req,
                    actions,
                    req.last_selector.clone(),
                    Some(locator.to_string()),
                    false,
                    started,
                );
                self.telemetry.record_heal(req.failure.name());
                return HealOutcome {
                    events: extend(req.prior_events, event),
                    new_candidate: None,
                    heal_round: req.round,
                    failure: FailureKind::Timeout,
                    force_terminal: false,
                    rca_detail: Some(err.to_string()),
                };
            }
        };

        let selector = locator.to_string();
        self.telemetry.record_heal(req.failure.name());

        if report.overall() {
            let candidate = Candidate::new(
                selector.clone(),
                reprobe_strategy(req.round),
                reprobe_confidence(req.round),
            );
            if let Err(err) = self.cache.write(
                &req.origin,
                req.intent.label(),
                req.intent.step.within.as_deref(),
                &candidate,
            ) {
                warn!(target: "pacts::heal", %err, "cache write after heal failed");
            }
            let mut event = self.event(
                &req,
                actions,
                req.last_selector.clone(),
                Some(selector.clone()),
                true,
                started,
            );
            event.gate_result = Some(report.to_json());
            self.telemetry.emit(
                Tag::Heal,
                &req.req_id,
                req.step_idx,
                req.round,
                event.duration_ms,
                format!("healed '{}' -> {}", req.intent.label(), selector),
            );
            return HealOutcome {
                events: extend(req.prior_events, event),
                new_candidate: Some(candidate),
                heal_round: req.round,
                failure: FailureKind::None,
                force_terminal: false,
                rca_detail: None,
            };
        }

        let kind = report.failure_kind();
        let mut event = self.event(
            &req,
            actions,
            req.last_selector.clone(),
            Some(selector),
            false,
            started,
        );
        event.gate_result = Some(report.to_json());
        HealOutcome {
            events: extend(req.prior_events, event),
            new_candidate: None,
            heal_round: req.round,
            failure: kind,
            force_terminal: false,
            rca_detail: Some(format!("healed selector failed the gate: {kind}")),
        }
    }

    fn event(
        &self,
        req: &HealRequest,
        actions: Vec<String>,
        old_selector: Option<String>,
        new_selector: Option<String>,
        success: bool,
        started: Instant,
    ) -> HealEvent {
        HealEvent {
            round: req.round,
            step_idx: req.step_idx,
            failure_kind: req.failure,
            actions,
            old_selector,
            new_selector,
            gate_result: None,
            success,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Components return extended lists; mutation in place would be invisible
/// to the coordinator's change detection.
fn extend(mut events: Vec<HealEvent>, event: HealEvent) -> Vec<HealEvent> {
    events.push(event);
    events
}

fn reprobe_tier_name(round: u32) -> &'static str {
    match round {
        1 => "role_name_relaxed",
        2 => "label_fallbacks",
        _ => "css_heuristics",
    }
}

fn reprobe_strategy(round: u32) -> Strategy {
    match round {
        1 => Strategy::RoleName,
        2 => Strategy::Placeholder,
        _ => Strategy::Id,
    }
}

fn reprobe_confidence(round: u32) -> f64 {
    match round {
        1 => 0.85,
        2 => 0.88,
        _ => 0.70,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browser_driver::fake::{FakeDriver, FakeElement};
    use pacts_core_types::Step;
    use selector_cache::{CacheConfig, InMemoryStore, SelectorCache};

    fn healer(driver: Arc<FakeDriver>) -> Healer {
        let driver: Arc<dyn BrowserDriver> = driver;
        let gate = Arc::new(Gate::new(driver.clone()));
        let cache = Arc::new(SelectorCache::new(
            CacheConfig::default(),
            Arc::new(InMemoryStore::default()),
        ));
        Healer::new(
            driver,
            gate,
            cache,
            TelemetrySink::new(),
            HealerConfig::default(),
        )
    }

    fn request(intent: Intent, round: u32, prior: Vec<HealEvent>) -> HealRequest {
        HealRequest {
            req_id: ReqId::new(),
            step_idx: 0,
            round,
            origin: "https://shop.test".into(),
            intent,
            failure: FailureKind::DiscoveryNone,
            last_selector: Some("#stale-id".into()),
            prior_events: prior,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn round_one_recovers_a_drifted_selector_by_role() {
        let driver = FakeDriver::new("https://shop.test");
        driver.add_element(FakeElement::new("save", "button").with_text("Save"));
        let healer = healer(driver.clone());

        let outcome = healer
            .heal(request(Intent::new(Step::new("Save", Action::Click)), 1, vec![]))
            .await;

        assert_eq!(outcome.failure, FailureKind::None);
        assert!(!outcome.force_terminal);
        let candidate = outcome.new_candidate.expect("healed candidate");
        assert_eq!(candidate.selector, "role=button[name=/Save/i]");
        assert_eq!(outcome.events.len(), 1);
        let event = &outcome.events[0];
        assert!(event.success);
        assert_eq!(event.old_selector.as_deref(), Some("#stale-id"));
        assert_eq!(event.new_selector.as_deref(), Some("role=button[name=/Save/i]"));
        assert!(event.actions.iter().any(|a| a == "dismiss_overlays"));
        // The healed binding lands in the cache for the next run.
        assert!(healer
            .cache
            .read("https://shop.test", "Save", None)
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_none_guard_terminates_on_the_second_empty_reprobe() {
        let driver = FakeDriver::new("https://shop.test");
        let healer = healer(driver);
        let intent = Intent::new(Step::new("Ghost", Action::Click));

        let first = healer.heal(request(intent.clone(), 1, vec![])).await;
        assert!(!first.force_terminal);
        assert_eq!(first.events.len(), 1);
        assert!(first.events[0].new_selector.is_none());

        let second = healer.heal(request(intent, 2, first.events)).await;
        assert!(second.force_terminal);
        assert_eq!(second.failure, FailureKind::DiscoveryNone);
        assert_eq!(second.heal_round, 3);
        assert_eq!(second.events.len(), 2);
        assert!(second
            .rca_detail
            .as_deref()
            .unwrap()
            .contains("not found after"));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_selector_guard_terminates_non_fill_actions() {
        let driver = FakeDriver::new("https://shop.test");
        driver.add_element(
            FakeElement::new("save", "button")
                .with_id("save-btn")
                .with_text("Save"),
        );
        let healer = healer(driver);

        // The css-heuristics tier leads with the last-known-good cache
        // binding, so round three re-proposes what the previous round
        // already tried.
        healer
            .cache
            .write(
                "https://shop.test",
                "Save",
                None,
                &Candidate::new("#save-btn", Strategy::Id, 0.6),
            )
            .unwrap();
        let prior = vec![HealEvent {
            round: 2,
            step_idx: 0,
            failure_kind: FailureKind::NotUnique,
            actions: vec!["reprobe:label_fallbacks".into()],
            old_selector: Some("#stale-id".into()),
            new_selector: Some("#save-btn".into()),
            gate_result: None,
            success: false,
            duration_ms: 10,
        }];

        let outcome = healer
            .heal(request(Intent::new(Step::new("Save", Action::Click)), 3, prior))
            .await;
        assert!(outcome.force_terminal);
        assert_eq!(outcome.heal_round, 3);
        assert_eq!(
            outcome.rca_detail.as_deref(),
            Some("Selector repeatedly failed validation")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prior_events_are_preserved_as_a_prefix() {
        let driver = FakeDriver::new("https://shop.test");
        driver.add_element(FakeElement::new("save", "button").with_text("Save"));
        let healer = healer(driver);

        let prior = vec![HealEvent {
            round: 1,
            step_idx: 0,
            failure_kind: FailureKind::NotVisible,
            actions: vec!["bring_to_front".into()],
            old_selector: None,
            new_selector: Some("#old".into()),
            gate_result: None,
            success: false,
            duration_ms: 10,
        }];
        let outcome = healer
            .heal(request(
                Intent::new(Step::new("Save", Action::Click)),
                2,
                prior.clone(),
            ))
            .await;
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.events[0], prior[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_observed_between_phases() {
        let driver = FakeDriver::new("https://shop.test");
        let healer = healer(driver);
        let mut req = request(Intent::new(Step::new("Save", Action::Click)), 1, vec![]);
        req.cancel = CancellationToken::new();
        req.cancel.cancel();

        let outcome = healer.heal(req).await;
        assert!(outcome.force_terminal);
        assert_eq!(outcome.failure, FailureKind::Cancelled);
    }
}

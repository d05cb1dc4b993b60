//! Actionability gate.
//!
//! Five predicates decide whether a candidate selector may be acted on:
//! unique, visible, enabled, stable, in-scope. Tolerances and timeouts
//! scale with the current heal round, so retries get progressively more
//! forgiving without ever looping forever.

mod report;
mod spec;

pub use report::GateReport;
pub use spec::{GateSpec, VisibilityMode};

use std::sync::Arc;
use std::time::{Duration, Instant};

use browser_driver::{BoundingBox, BrowserDriver, DriverError, Locator};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::debug;

#[derive(Debug, Error)]
pub enum GateError {
    /// A predicate exceeded its time budget.
    #[error("gate predicate '{0}' timed out")]
    Timeout(&'static str),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Gate tuning; the per-predicate budget grows by one second per heal
/// round on top of the base.
#[derive(Clone, Debug)]
pub struct GateConfig {
    pub base_predicate_timeout_ms: u64,
    pub stability_interval_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            base_predicate_timeout_ms: 2_000,
            stability_interval_ms: 120,
        }
    }
}

pub struct Gate {
    driver: Arc<dyn BrowserDriver>,
    config: GateConfig,
}

impl Gate {
    pub fn new(driver: Arc<dyn BrowserDriver>) -> Self {
        Self {
            driver,
            config: GateConfig::default(),
        }
    }

    pub fn with_config(driver: Arc<dyn BrowserDriver>, config: GateConfig) -> Self {
        Self { driver, config }
    }

    fn predicate_timeout(&self, heal_round: u32) -> Duration {
        Duration::from_millis(self.config.base_predicate_timeout_ms + 1_000 * heal_round as u64)
    }

    /// Evaluate every predicate for `locator` under `spec`.
    ///
    /// Uniqueness is judged on the whole page; `in_scope` then verifies
    /// the bound element actually lives under the landmark, so a
    /// candidate that exists globally but outside the region fails
    /// `NotScoped` rather than vanishing.
    pub async fn evaluate(
        &self,
        locator: &Locator,
        spec: &GateSpec,
    ) -> Result<GateReport, GateError> {
        let start = Instant::now();
        let budget = self.predicate_timeout(spec.heal_round);

        let probes = timeout(budget, self.driver.query(locator))
            .await
            .map_err(|_| GateError::Timeout("unique"))??;
        let match_count = probes.len();
        let unique = match_count == 1;

        let in_scope = match (&spec.within, probes.first()) {
            (Some(landmark), Some(bound)) => {
                let scoped = locator.scoped_under(landmark);
                let scoped_probes = timeout(budget, self.driver.query(&scoped))
                    .await
                    .map_err(|_| GateError::Timeout("in_scope"))??;
                scoped_probes.iter().any(|p| probes_equivalent(p, bound))
            }
            _ => true,
        };

        let probe = probes.into_iter().next();

        let visible = match spec.visibility {
            VisibilityMode::Deferred => true,
            VisibilityMode::Required => probe
                .as_ref()
                .map(|p| p.visible && (spec.allow_covered || !p.covered))
                .unwrap_or(false),
        };

        let enabled = spec.action.is_read_only()
            || probe
                .as_ref()
                .map(|p| p.enabled && !(spec.action.writes_value() && p.read_only))
                .unwrap_or(false);

        // Stability only makes sense once a single live element is bound.
        let stable = if unique {
            timeout(budget, self.sample_stability(locator, spec.heal_round))
                .await
                .map_err(|_| GateError::Timeout("stable"))??
        } else {
            false
        };

        let report = GateReport {
            unique,
            visible,
            enabled,
            stable,
            in_scope,
            match_count,
            latency_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            target: "pacts::gate",
            locator = %locator,
            ?report,
            "gate evaluated"
        );
        Ok(report)
    }

    /// Sample the bounding box `3 + heal_round` times, 120 ms apart; the
    /// box must stay within `2.0 + 0.5 * heal_round` px of the first
    /// sample in both dimensions. The bound is strict, so a box that
    /// oscillates by exactly the tolerance still fails at round zero.
    async fn sample_stability(
        &self,
        locator: &Locator,
        heal_round: u32,
    ) -> Result<bool, DriverError> {
        let samples = 3 + heal_round as usize;
        let tolerance = 2.0 + 0.5 * heal_round as f64;
        let mut first: Option<BoundingBox> = None;

        for i in 0..samples {
            if i > 0 {
                sleep(Duration::from_millis(self.config.stability_interval_ms)).await;
            }
            let Some(bbox) = self.driver.bounding_box(locator).await? else {
                return Ok(false);
            };
            match &first {
                None => first = Some(bbox),
                Some(reference) => {
                    if reference.drift(&bbox) >= tolerance {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }
}

/// Two probes from separate queries refer to the same element when their
/// identity-bearing fields line up. Element handles do not survive across
/// round-trips, so this heuristic stands in for pointer equality.
fn probes_equivalent(a: &browser_driver::ElementProbe, b: &browser_driver::ElementProbe) -> bool {
    a.tag == b.tag && a.id == b.id && a.name == b.name && a.bbox.drift(&b.bbox) < 8.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use browser_driver::fake::{FakeDriver, FakeElement};
    use pacts_core_types::{Action, FailureKind};

    fn gate(driver: Arc<FakeDriver>) -> Gate {
        Gate::new(driver)
    }

    #[tokio::test(start_paused = true)]
    async fn single_visible_enabled_element_passes() {
        let driver = FakeDriver::new("https://a.test");
        driver.add_element(FakeElement::new("go", "button").with_text("Go"));
        let report = gate(driver)
            .evaluate(
                &Locator::parse("button:has-text(\"Go\")").unwrap(),
                &GateSpec::for_action(Action::Click, 0),
            )
            .await
            .unwrap();
        assert!(report.overall());
        assert_eq!(report.failure_kind(), FailureKind::None);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_matches_fail_unique_first() {
        let driver = FakeDriver::new("https://a.test");
        driver.add_element(FakeElement::new("a", "button").with_text("Save"));
        driver.add_element(FakeElement::new("b", "button").with_text("Save"));
        let report = gate(driver)
            .evaluate(
                &Locator::parse("button:has-text(\"Save\")").unwrap(),
                &GateSpec::for_action(Action::Click, 0),
            )
            .await
            .unwrap();
        assert!(!report.unique);
        assert_eq!(report.failure_kind(), FailureKind::NotUnique);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_element_fails_unless_visibility_deferred() {
        let driver = FakeDriver::new("https://a.test");
        driver.add_element(
            FakeElement::new("q", "input")
                .with_attr("placeholder", "Search")
                .hidden(),
        );
        let locator = Locator::parse("input[placeholder*=\"search\" i]").unwrap();

        let strict = gate(driver.clone())
            .evaluate(&locator, &GateSpec::for_action(Action::Fill, 0))
            .await
            .unwrap();
        assert_eq!(strict.failure_kind(), FailureKind::NotVisible);

        let deferred = gate(driver)
            .evaluate(
                &locator,
                &GateSpec::for_action(Action::Fill, 0).with_visibility(VisibilityMode::Deferred),
            )
            .await
            .unwrap();
        assert!(deferred.visible);
        assert!(deferred.overall());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_target_fails_for_click_but_not_hover() {
        let driver = FakeDriver::new("https://a.test");
        driver.add_element(FakeElement::new("go", "button").with_text("Go").disabled());
        let locator = Locator::parse("button:has-text(\"Go\")").unwrap();

        let click = gate(driver.clone())
            .evaluate(&locator, &GateSpec::for_action(Action::Click, 0))
            .await
            .unwrap();
        assert_eq!(click.failure_kind(), FailureKind::NotEnabled);

        let hover = gate(driver)
            .evaluate(&locator, &GateSpec::for_action(Action::Hover, 0))
            .await
            .unwrap();
        assert!(hover.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_input_rejects_fill() {
        let driver = FakeDriver::new("https://a.test");
        driver.add_element(
            FakeElement::new("q", "input")
                .with_aria_label("Search")
                .read_only(),
        );
        let report = gate(driver)
            .evaluate(
                &Locator::parse("input[aria-label=\"Search\"]").unwrap(),
                &GateSpec::for_action(Action::Fill, 0),
            )
            .await
            .unwrap();
        assert_eq!(report.failure_kind(), FailureKind::NotEnabled);
    }

    #[tokio::test(start_paused = true)]
    async fn exact_tolerance_oscillation_fails_round_zero_passes_round_one() {
        let driver = FakeDriver::new("https://a.test");
        driver.add_element(
            FakeElement::new("jumpy", "button")
                .with_text("Go")
                .oscillating(2.0),
        );
        let locator = Locator::parse("button:has-text(\"Go\")").unwrap();

        let round0 = gate(driver.clone())
            .evaluate(&locator, &GateSpec::for_action(Action::Click, 0))
            .await
            .unwrap();
        assert_eq!(round0.failure_kind(), FailureKind::Unstable);

        let round1 = gate(driver)
            .evaluate(&locator, &GateSpec::for_action(Action::Click, 1))
            .await
            .unwrap();
        assert!(round1.stable);
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_outside_landmark_fails_in_scope() {
        let driver = FakeDriver::new("https://a.test");
        driver.add_element(FakeElement::new("panel", "div").with_aria_label("Sidebar"));
        driver.add_element(FakeElement::new("outside", "button").with_text("Save"));

        let spec = GateSpec::for_action(Action::Click, 0)
            .with_within(Locator::parse("[aria-label=\"Sidebar\"]").unwrap());
        let report = gate(driver)
            .evaluate(&Locator::parse("button:has-text(\"Save\")").unwrap(), &spec)
            .await
            .unwrap();
        assert!(!report.in_scope);
        assert_eq!(report.failure_kind(), FailureKind::NotScoped);
    }

    #[tokio::test(start_paused = true)]
    async fn covered_center_point_fails_unless_allowed() {
        let driver = FakeDriver::new("https://a.test");
        driver.add_element(FakeElement::new("go", "button").with_text("Go").covered());
        let locator = Locator::parse("button:has-text(\"Go\")").unwrap();

        let strict = gate(driver.clone())
            .evaluate(&locator, &GateSpec::for_action(Action::Click, 0))
            .await
            .unwrap();
        assert_eq!(strict.failure_kind(), FailureKind::NotVisible);

        let relaxed = gate(driver)
            .evaluate(
                &locator,
                &GateSpec::for_action(Action::Click, 0).with_allow_covered(),
            )
            .await
            .unwrap();
        assert!(relaxed.visible);
    }
}

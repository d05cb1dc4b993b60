//! Step executor.
//!
//! Advances exactly one step per invocation and hands control back to the
//! coordinator: readiness wait, discovery, the actionability gate, the
//! hidden-fill activation ladder, the typed action itself, lightweight
//! verification, and the screenshot. Failures are classified, never
//! raised; `step_idx` bookkeeping belongs to the coordinator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use action_gate::{Gate, GateError, GateReport, GateSpec, VisibilityMode};
use browser_driver::{BrowserDriver, DriverError, Locator, NamePattern};
use chrono::Utc;
use discovery_engine::{DiscoveryEngine, DiscoveryRequest};
use pacts_core_types::{
    Action, Candidate, EngineConfig, ExecutedStep, FailureKind, PlanStep, ReqId,
};
use pacts_telemetry::{Tag, TelemetrySink};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub action_timeout_ms: u64,
    pub readiness_wait_ms: u64,
    pub spa_readiness_wait_ms: u64,
    pub spa_markers: Vec<String>,
    /// Per-character delay for `type`.
    pub type_char_delay_ms: u64,
    /// Settle window after filling autocomplete-wired inputs.
    pub autocomplete_debounce_ms: u64,
    pub screenshot_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: 5_000,
            readiness_wait_ms: 500,
            spa_readiness_wait_ms: 1_000,
            spa_markers: vec!["/#/".into(), "#!".into()],
            type_char_delay_ms: 50,
            autocomplete_debounce_ms: 200,
            screenshot_dir: PathBuf::from("artifacts/screenshots"),
        }
    }
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            action_timeout_ms: cfg.action_timeout_ms,
            readiness_wait_ms: cfg.readiness_wait_ms,
            spa_readiness_wait_ms: cfg.spa_readiness_wait_ms,
            spa_markers: cfg.spa_markers.clone(),
            screenshot_dir: cfg.screenshot_dir.clone(),
            ..Self::default()
        }
    }
}

/// Proposed mutation set from one step attempt. The coordinator installs
/// whatever it accepts; the executor itself never touches run state.
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    pub failure: FailureKind,
    /// Candidate bound during this attempt (kept on failure for healing).
    pub candidate: Option<Candidate>,
    /// Present only on success.
    pub executed: Option<ExecutedStep>,
    /// Wait steps suspend for a human signal instead of executing.
    pub requires_human: bool,
    pub gate_report: Option<GateReport>,
    /// Activation ladder entries that ran for a hidden fill.
    pub activation_actions: Vec<String>,
    pub rca_detail: Option<String>,
    pub screenshot: Option<String>,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        self.failure == FailureKind::None && self.executed.is_some()
    }

    fn failed(kind: FailureKind, rca: impl Into<String>) -> Self {
        Self {
            failure: kind,
            rca_detail: Some(rca.into()),
            ..Self::default()
        }
    }
}

pub struct StepExecutor {
    driver: Arc<dyn BrowserDriver>,
    discovery: Arc<DiscoveryEngine>,
    gate: Arc<Gate>,
    telemetry: Arc<TelemetrySink>,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        discovery: Arc<DiscoveryEngine>,
        gate: Arc<Gate>,
        telemetry: Arc<TelemetrySink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            driver,
            discovery,
            gate,
            telemetry,
            config,
        }
    }

    /// Run one step. Infallible by contract: driver exceptions fold into
    /// `Timeout` with the original message preserved for the heal record.
    pub async fn execute(
        &self,
        req_id: &ReqId,
        step_idx: usize,
        entry: &PlanStep,
        heal_round: u32,
        origin: &str,
        bypass_cache: bool,
    ) -> StepOutcome {
        let started = Instant::now();
        let intent = &entry.intent;
        let action = intent.action();

        // Wait steps never touch the driver; they flag the run for HITL.
        if action == Action::Wait {
            self.telemetry.emit(
                Tag::Exec,
                req_id,
                step_idx,
                heal_round,
                0,
                format!("step '{}' suspends for human input", intent.label()),
            );
            return StepOutcome {
                requires_human: true,
                ..StepOutcome::default()
            };
        }

        // Readiness: let the page settle, longer for SPA landings.
        let landing = self.driver.current_url().await.unwrap_or_default();
        let readiness = if self
            .config
            .spa_markers
            .iter()
            .any(|m| landing.contains(m.as_str()))
        {
            self.config.spa_readiness_wait_ms
        } else {
            self.config.readiness_wait_ms
        };
        if let Err(err) = self.driver.wait_for_dom_idle(readiness).await {
            debug!(target: "pacts::exec", %err, "readiness window elapsed");
        }

        let visibility = if action.defers_visibility() {
            VisibilityMode::Deferred
        } else {
            VisibilityMode::Required
        };

        // Bind a candidate: reuse a healed binding, otherwise discover.
        let candidate = match &entry.candidate {
            Some(candidate) => candidate.clone(),
            None => {
                let request = DiscoveryRequest {
                    req_id: req_id.clone(),
                    step_idx,
                    heal_round,
                    origin: origin.to_string(),
                    intent: intent.clone(),
                    visibility,
                    bypass_cache,
                };
                match self.discovery.discover(&request).await {
                    Ok(Some(candidate)) => candidate,
                    Ok(None) => {
                        return StepOutcome::failed(
                            FailureKind::DiscoveryNone,
                            format!("element '{}' not found by any discovery tier", intent.label()),
                        );
                    }
                    Err(err) => {
                        return StepOutcome::failed(FailureKind::Timeout, err.to_string());
                    }
                }
            }
        };

        let locator = match Locator::parse(&candidate.selector) {
            Ok(locator) => locator,
            Err(err) => {
                return StepOutcome::failed(
                    FailureKind::DiscoveryNone,
                    format!("candidate selector unparseable: {err}"),
                );
            }
        };

        // Gate with the current heal round. Region-scoped selectors carry
        // their landmark in the chain already; scoping them again would
        // double-nest the subtree search.
        let mut spec = GateSpec::for_action(action, heal_round).with_visibility(visibility);
        if candidate.strategy != pacts_core_types::Strategy::RegionScoped {
            if let Some(within) = &intent.step.within {
                if let Some(landmark) = self.discovery.resolve_landmark(within).await {
                    spec = spec.with_within(landmark);
                }
            }
        }

        let report = match self.gate.evaluate(&locator, &spec).await {
            Ok(report) => report,
            Err(GateError::Timeout(predicate)) => {
                return StepOutcome {
                    candidate: Some(candidate),
                    ..StepOutcome::failed(
                        FailureKind::Timeout,
                        format!("gate predicate '{predicate}' timed out"),
                    )
                };
            }
            Err(GateError::Driver(err)) => {
                return StepOutcome {
                    candidate: Some(candidate),
                    ..StepOutcome::failed(FailureKind::Timeout, err.to_string())
                };
            }
        };
        self.telemetry.emit(
            Tag::Gate,
            req_id,
            step_idx,
            heal_round,
            report.latency_ms,
            format!(
                "gate {} for '{}'",
                if report.overall() { "passed" } else { "failed" },
                candidate.selector
            ),
        );

        if !report.overall() {
            let kind = report.failure_kind();
            return StepOutcome {
                candidate: Some(candidate),
                gate_report: Some(report),
                ..StepOutcome::failed(kind, format!("gate failed: {kind}"))
            };
        }

        // Deferred visibility must be made real before acting.
        let mut activation_actions = Vec::new();
        if action == Action::Fill {
            match self.driver.is_visible(&locator).await {
                Ok(true) => {}
                Ok(false) => match self.activate_hidden_fill(intent.label(), &locator).await {
                    Some(actions) => activation_actions = actions,
                    None => {
                        return StepOutcome {
                            candidate: Some(candidate),
                            gate_report: Some(report),
                            ..StepOutcome::failed(
                                FailureKind::NotVisible,
                                format!(
                                    "input '{}' stayed hidden after activation attempts",
                                    intent.label()
                                ),
                            )
                        };
                    }
                },
                Err(err) => {
                    return StepOutcome {
                        candidate: Some(candidate),
                        ..StepOutcome::failed(FailureKind::Timeout, err.to_string())
                    };
                }
            }
        }

        // Typed dispatch under the action timeout.
        let url_before = self.driver.current_url().await.unwrap_or_default();
        let dispatch = timeout(
            Duration::from_millis(self.config.action_timeout_ms),
            self.dispatch(action, intent, &locator),
        )
        .await;
        match dispatch {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return StepOutcome {
                    candidate: Some(candidate),
                    activation_actions,
                    ..StepOutcome::failed(FailureKind::Timeout, err.to_string())
                };
            }
            Err(_) => {
                return StepOutcome {
                    candidate: Some(candidate),
                    activation_actions,
                    ..StepOutcome::failed(
                        FailureKind::Timeout,
                        format!("{action} exceeded {} ms", self.config.action_timeout_ms),
                    )
                };
            }
        }

        // Lightweight verification: observe navigation-ish effects, no
        // strong post-condition.
        if matches!(action, Action::Click | Action::Press | Action::Select) {
            let _ = self.driver.wait_for_dom_idle(300).await;
            let url_after = self.driver.current_url().await.unwrap_or_default();
            if url_after != url_before {
                self.telemetry.emit(
                    Tag::Exec,
                    req_id,
                    step_idx,
                    heal_round,
                    0,
                    format!("navigation observed: {url_before} -> {url_after}"),
                );
            }
        }

        let screenshot = self.capture_screenshot(req_id, step_idx, intent.label()).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.telemetry.record_step_duration(duration_ms);
        self.telemetry.emit(
            Tag::Exec,
            req_id,
            step_idx,
            heal_round,
            duration_ms,
            format!("{action} '{}' via {}", intent.label(), candidate.selector),
        );

        StepOutcome {
            failure: FailureKind::None,
            executed: Some(ExecutedStep {
                step_idx,
                label: intent.label().to_string(),
                action,
                selector: Some(candidate.selector.clone()),
                strategy: Some(candidate.strategy),
                duration_ms,
                screenshot: screenshot.clone(),
                finished_at: Utc::now(),
            }),
            candidate: Some(candidate),
            requires_human: false,
            gate_report: Some(report),
            activation_actions,
            rca_detail: None,
            screenshot,
        }
    }

    async fn dispatch(
        &self,
        action: Action,
        intent: &pacts_core_types::Intent,
        locator: &Locator,
    ) -> Result<(), DriverError> {
        let value = intent.step.value.as_deref();
        match action {
            Action::Click => self.driver.click(locator).await,
            Action::Fill => {
                self.driver.fill(locator, value.unwrap_or_default()).await?;
                if self.wired_to_autocomplete(locator).await {
                    sleep(Duration::from_millis(self.config.autocomplete_debounce_ms)).await;
                }
                Ok(())
            }
            Action::Type => {
                self.driver
                    .type_text(
                        locator,
                        value.unwrap_or_default(),
                        self.config.type_char_delay_ms,
                    )
                    .await
            }
            Action::Press => self.driver.press(value.unwrap_or("Enter")).await,
            Action::Select => {
                self.driver
                    .select_option(locator, value.unwrap_or_default())
                    .await
            }
            Action::Check => self.driver.set_checked(locator, true).await,
            Action::Uncheck => self.driver.set_checked(locator, false).await,
            Action::Hover => self.driver.hover(locator).await,
            Action::Focus => self.driver.focus(locator).await,
            Action::Wait => Ok(()),
        }
    }

    async fn wired_to_autocomplete(&self, locator: &Locator) -> bool {
        match self.driver.attribute(locator, "aria-autocomplete").await {
            Ok(Some(value)) => !value.is_empty() && value != "none",
            _ => false,
        }
    }

    /// Bounded activation ladder for inputs hidden behind a collapse
    /// toggle: an adjacent search button, a hamburger toggle, the
    /// input's label, and the `/` hotkey as a last resort. One visibility
    /// re-check per rung.
    async fn activate_hidden_fill(
        &self,
        label: &str,
        target: &Locator,
    ) -> Option<Vec<String>> {
        let rungs: Vec<(&str, Activation)> = vec![
            (
                "activate_adjacent",
                Activation::Click(Locator::role("button", NamePattern::regex_ci(label))),
            ),
            (
                "activate_hamburger",
                Activation::Click(Locator::css("[aria-label*=\"menu\" i]")),
            ),
            (
                "activate_label",
                Activation::Click(Locator::css_with_text("label", label)),
            ),
            ("activate_hotkey", Activation::Press("/")),
        ];

        let mut attempted = Vec::new();
        for (name, rung) in rungs {
            let acted = match rung {
                Activation::Click(activator) => self.driver.click(&activator).await.is_ok(),
                Activation::Press(key) => self.driver.press(key).await.is_ok(),
            };
            if !acted {
                continue;
            }
            attempted.push(name.to_string());
            match self.driver.is_visible(target).await {
                Ok(true) => return Some(attempted),
                Ok(false) => continue,
                Err(err) => {
                    warn!(target: "pacts::exec", %err, "visibility re-check failed");
                    continue;
                }
            }
        }
        None
    }

    async fn capture_screenshot(
        &self,
        req_id: &ReqId,
        step_idx: usize,
        label: &str,
    ) -> Option<String> {
        let bytes = match self.driver.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "pacts::exec", %err, "screenshot failed");
                return None;
            }
        };
        let name = format!("{}_step{:02}_{}.png", req_id, step_idx + 1, slug(label));
        let path = self.config.screenshot_dir.join(name);
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(target: "pacts::exec", %err, "screenshot dir unavailable");
                return None;
            }
        }
        match std::fs::write(&path, bytes) {
            Ok(()) => Some(path.to_string_lossy().to_string()),
            Err(err) => {
                warn!(target: "pacts::exec", %err, "screenshot write failed");
                None
            }
        }
    }
}

enum Activation {
    Click(Locator),
    Press(&'static str),
}

/// Deterministic filename fragment from a human label.
pub fn slug(label: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

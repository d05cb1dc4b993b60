//! Run coordinator.
//!
//! One coordinator drives one run: a single task owning the `RunState`,
//! routing each step through discovery and execution, into healing on
//! failure, into the HITL bridge on wait steps, and finally to a verdict.
//! Components only propose mutations; every write into the state,
//! including the whole-list reassignment of `heal_events` and
//! `executed_steps`, happens here.

mod blocked;
mod builder;

pub use blocked::{BlockedDetector, DefaultBlockedDetector};
pub use builder::EngineStack;

use std::sync::Arc;
use std::time::Instant;

use browser_driver::BrowserDriver;
use healer::{HealRequest, Healer};
use hitl_bridge::{HitlBridge, HitlError, HitlSignal};
use pacts_core_types::{
    EngineConfig, FailureKind, HealEvent, Intent, ReqId, RunRecord, RunState, Verdict,
};
use pacts_telemetry::{RunStore, Tag, TelemetrySink};
use step_executor::{StepExecutor, StepOutcome};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("run record persistence failed: {0}")]
    Persistence(#[from] pacts_telemetry::TelemetryError),
    #[error("cache initialisation failed: {0}")]
    Cache(#[from] selector_cache::CacheError),
}

/// Pipeline phases, used for router telemetry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Plan,
    Exec,
    Heal,
    Hitl,
    Verdict,
    End,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Exec => "exec",
            Phase::Heal => "heal",
            Phase::Hitl => "hitl",
            Phase::Verdict => "verdict",
            Phase::End => "end",
        }
    }
}

pub struct RunCoordinator {
    driver: Arc<dyn BrowserDriver>,
    executor: Arc<StepExecutor>,
    healer: Arc<Healer>,
    hitl: Arc<HitlBridge>,
    telemetry: Arc<TelemetrySink>,
    run_store: Option<Arc<RunStore>>,
    blocked: Arc<dyn BlockedDetector>,
    config: EngineConfig,
}

impl RunCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        executor: Arc<StepExecutor>,
        healer: Arc<Healer>,
        hitl: Arc<HitlBridge>,
        telemetry: Arc<TelemetrySink>,
        run_store: Option<Arc<RunStore>>,
        blocked: Arc<dyn BlockedDetector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            driver,
            executor,
            healer,
            hitl,
            telemetry,
            run_store,
            blocked,
            config,
        }
    }

    /// Execute a plan end-to-end and return the persisted record. Never
    /// raises: every internal failure folds into the verdict.
    pub async fn run(
        &self,
        url: &str,
        intents: Vec<Intent>,
        cancel: CancellationToken,
    ) -> RunRecord {
        let req_id = ReqId::new();
        let mut state = RunState::new(req_id.clone(), url, intents);
        let origin = origin_of(url);
        let mut phase = Phase::Plan;
        info!(target: "pacts::router", req_id = %req_id, url, steps = state.plan.len(), "run accepted");

        // Acquire the driver and land on the origin. A dead browser is a
        // timeout verdict, not a crash.
        if let Err(err) = self.open_session(&mut state, url).await {
            state.failure = FailureKind::Timeout;
            state.rca_detail = Some(err);
            return self.finish(state).await;
        }
        self.transition(&req_id, &mut phase, Phase::Exec, state.step_idx);

        loop {
            if cancel.is_cancelled() {
                state.failure = FailureKind::Cancelled;
                state.rca_detail = Some("run cancelled".into());
                break;
            }
            if !state.steps_remaining() {
                break;
            }

            // Blocking signals short-circuit before the step is attempted.
            if let Some(signature) = self.blocked.detect(&self.driver).await {
                state.failure = FailureKind::Blocked;
                state.rca_detail = Some(format!("blocking challenge detected ({signature})"));
                break;
            }

            let step_idx = state.step_idx;
            let entry = state.plan[step_idx].clone();
            let outcome = self
                .executor
                .execute(
                    &req_id,
                    step_idx,
                    &entry,
                    state.heal_round,
                    &origin,
                    self.config.bypass_cache_for(&origin),
                )
                .await;

            if outcome.requires_human {
                self.transition(&req_id, &mut phase, Phase::Hitl, step_idx);
                match self.suspend_for_human(&mut state, &cancel).await {
                    Ok(()) => {
                        self.transition(&req_id, &mut phase, Phase::Exec, state.step_idx);
                        continue;
                    }
                    Err(()) => break,
                }
            }

            if outcome.is_success() {
                self.apply_success(&mut state, outcome);
                continue;
            }

            self.apply_failure(&mut state, &outcome);

            let max_rounds = self.config.effective_max_heal_rounds();
            if !state.failure.is_healable() || state.heal_round >= max_rounds {
                break;
            }

            self.transition(&req_id, &mut phase, Phase::Heal, step_idx);
            let heal = self
                .healer
                .heal(HealRequest {
                    req_id: req_id.clone(),
                    step_idx,
                    round: state.heal_round + 1,
                    origin: origin.clone(),
                    intent: entry.intent.clone(),
                    failure: state.failure,
                    last_selector: state.last_selector.clone(),
                    prior_events: state.heal_events.clone(),
                    cancel: cancel.clone(),
                })
                .await;

            // Whole-list reassignment keeps every append observable.
            state.heal_events = heal.events;
            state.heal_round = heal.heal_round;
            state.plan[step_idx].candidate = heal.new_candidate;
            state.failure = heal.failure;
            if let Some(rca) = heal.rca_detail {
                state.rca_detail = Some(rca);
            }
            if heal.force_terminal {
                break;
            }
            self.transition(&req_id, &mut phase, Phase::Exec, step_idx);
        }

        self.transition(&req_id, &mut phase, Phase::Verdict, state.step_idx);
        let record = self.finish(state).await;
        self.transition(&req_id, &mut phase, Phase::End, record.executed_steps.len());
        record
    }

    async fn open_session(&self, state: &mut RunState, url: &str) -> Result<(), String> {
        self.driver
            .start()
            .await
            .map_err(|err| format!("browser start failed: {err}"))?;
        if let Some(path) = &self.config.session_state_path {
            if path.exists() {
                match self.driver.storage_state_load(path).await {
                    Ok(()) => {
                        state.context.storage_state_path = Some(path.clone());
                        info!(target: "pacts::router", path = %path.display(), "session state restored");
                    }
                    Err(err) => {
                        warn!(target: "pacts::router", %err, "session state restore failed");
                    }
                }
            }
        }
        self.driver
            .goto(url)
            .await
            .map_err(|err| format!("navigation to {url} failed: {err}"))
    }

    fn apply_success(&self, state: &mut RunState, outcome: StepOutcome) {
        let step_idx = state.step_idx;
        if let Some(candidate) = &outcome.candidate {
            state.last_selector = Some(candidate.selector.clone());
            state.plan[step_idx].candidate = Some(candidate.clone());
        }

        if let Some(executed) = outcome.executed {
            // Extended copy, installed whole.
            let mut steps = state.context.executed_steps.clone();
            steps.push(executed);
            state.context.executed_steps = steps;
        }

        // An activation ladder that rescued a hidden fill is a heal in
        // its own right; record it so the artifact can replay it.
        if !outcome.activation_actions.is_empty() {
            let event = HealEvent {
                round: state.heal_round,
                step_idx,
                failure_kind: FailureKind::NotVisible,
                actions: outcome.activation_actions.clone(),
                old_selector: None,
                new_selector: state.last_selector.clone(),
                gate_result: outcome.gate_report.as_ref().map(|r| r.to_json()),
                success: true,
                duration_ms: 0,
            };
            let mut events = state.heal_events.clone();
            events.push(event);
            state.heal_events = events;
        }

        state.step_idx += 1;
        state.heal_round = 0;
        state.failure = FailureKind::None;
        state.rca_detail = None;
    }

    fn apply_failure(&self, state: &mut RunState, outcome: &StepOutcome) {
        state.failure = outcome.failure;
        if let Some(candidate) = &outcome.candidate {
            state.last_selector = Some(candidate.selector.clone());
        }
        if let Some(rca) = &outcome.rca_detail {
            state.rca_detail = Some(rca.clone());
        }
    }

    /// One HITL pause per wait step; the session snapshot is taken at
    /// most once per run, immediately after the first successful
    /// resumption.
    async fn suspend_for_human(
        &self,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        state.requires_human = true;
        let started = Instant::now();
        match self.hitl.await_signal(cancel).await {
            Ok(signal) => {
                state.human_input = match &signal {
                    HitlSignal::Input(value) => Some(value.clone()),
                    HitlSignal::Continue => None,
                };
                self.telemetry.emit(
                    Tag::Hitl,
                    &state.req_id,
                    state.step_idx,
                    state.heal_round,
                    started.elapsed().as_millis() as u64,
                    "human signal received, resuming",
                );

                if let Some(path) = &self.config.session_state_path {
                    if !state.session_state_saved {
                        match self.driver.storage_state_save(path).await {
                            Ok(()) => {
                                state.session_state_saved = true;
                                state.context.storage_state_path = Some(path.clone());
                            }
                            Err(err) => {
                                warn!(target: "pacts::router", %err, "session snapshot failed");
                            }
                        }
                    }
                }

                state.step_idx += 1;
                state.heal_round = 0;
                state.requires_human = false;
                state.human_input = None;
                Ok(())
            }
            Err(HitlError::TimedOut { waited_ms }) => {
                state.failure = FailureKind::WaitForHuman;
                state.rca_detail = Some(format!("no human signal within {waited_ms} ms"));
                state.requires_human = false;
                Err(())
            }
            Err(HitlError::Cancelled) => {
                state.failure = FailureKind::Cancelled;
                state.rca_detail = Some("run cancelled while awaiting human input".into());
                state.requires_human = false;
                Err(())
            }
        }
    }

    async fn finish(&self, state: RunState) -> RunRecord {
        let req_id = state.req_id.clone();
        let verdict = if state.is_pass() {
            Verdict::Pass
        } else if state.failure == FailureKind::Blocked {
            Verdict::Blocked {
                signature: state
                    .rca_detail
                    .clone()
                    .unwrap_or_else(|| "unknown blocking signature".into()),
            }
        } else {
            Verdict::Fail {
                kind: state.failure,
                rca_detail: state
                    .rca_detail
                    .clone()
                    .unwrap_or_else(|| format!("step {} failed: {}", state.step_idx, state.failure)),
            }
        };

        let artifacts: Vec<String> = state
            .context
            .executed_steps
            .iter()
            .filter_map(|s| s.screenshot.clone())
            .collect();

        if let Err(err) = self.driver.stop().await {
            warn!(target: "pacts::router", %err, "driver release failed");
        }

        let record = state.into_record(verdict, artifacts);
        self.telemetry.emit(
            Tag::Router,
            &req_id,
            record.executed_steps.len(),
            record.heal_rounds,
            (record.end - record.start).num_milliseconds().max(0) as u64,
            format!("run finished: {:?}", record.verdict),
        );
        if let Some(store) = &self.run_store {
            if let Err(err) = store.append(&record) {
                warn!(target: "pacts::router", %err, "run record persistence failed");
            }
        }
        record
    }

    fn transition(&self, req_id: &ReqId, phase: &mut Phase, to: Phase, step_idx: usize) {
        if *phase == to {
            return;
        }
        self.telemetry.emit(
            Tag::Router,
            req_id,
            step_idx,
            0,
            0,
            format!("{} -> {}", phase.name(), to.name()),
        );
        *phase = to;
    }
}

/// Scheme + host (+ port) of a URL; the cache keys on this.
pub fn origin_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let mut origin = format!(
                "{}://{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default()
            );
            if let Some(port) = parsed.port() {
                origin.push_str(&format!(":{port}"));
            }
            origin
        }
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_strip_paths_and_keep_ports() {
        assert_eq!(origin_of("https://shop.test/search?q=1"), "https://shop.test");
        assert_eq!(
            origin_of("http://localhost:3000/#/app"),
            "http://localhost:3000"
        );
        assert_eq!(origin_of("not a url"), "not a url");
    }
}

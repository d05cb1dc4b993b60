//! Run state owned by the coordinator, plus the persisted run record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::candidate::{Candidate, Strategy};
use crate::step::{Action, Intent};

/// Unique identifier of a run.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReqId(pub String);

impl ReqId {
    pub fn new() -> Self {
        Self(format!("req-{}", Uuid::new_v4()))
    }
}

impl Default for ReqId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classified failure of a step, a heal attempt, or the whole run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[default]
    None,
    NotUnique,
    NotVisible,
    NotEnabled,
    Unstable,
    NotScoped,
    Timeout,
    DiscoveryNone,
    Blocked,
    WaitForHuman,
    Cancelled,
}

impl FailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::None => "none",
            FailureKind::NotUnique => "not_unique",
            FailureKind::NotVisible => "not_visible",
            FailureKind::NotEnabled => "not_enabled",
            FailureKind::Unstable => "unstable",
            FailureKind::NotScoped => "not_scoped",
            FailureKind::Timeout => "timeout",
            FailureKind::DiscoveryNone => "discovery_none",
            FailureKind::Blocked => "blocked",
            FailureKind::WaitForHuman => "wait_for_human",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Failures the healer is allowed to attempt to recover.
    pub fn is_healable(&self) -> bool {
        matches!(
            self,
            FailureKind::NotVisible
                | FailureKind::NotEnabled
                | FailureKind::Unstable
                | FailureKind::NotUnique
                | FailureKind::Timeout
                | FailureKind::DiscoveryNone
        )
    }

    /// Failures that short-circuit straight to a terminal verdict.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FailureKind::Blocked | FailureKind::WaitForHuman | FailureKind::Cancelled
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal outcome of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail {
        kind: FailureKind,
        rca_detail: String,
    },
    Blocked {
        signature: String,
    },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// One healer invocation, recorded for observability and the artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealEvent {
    pub round: u32,
    pub step_idx: usize,
    pub failure_kind: FailureKind,
    /// Reveal/activation actions attempted, in order.
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<Value>,
    pub success: bool,
    pub duration_ms: u64,
}

/// A successfully executed step, appended by the coordinator only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutedStep {
    pub step_idx: usize,
    pub label: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Browser-side context carried by the run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_state_path: Option<PathBuf>,
    #[serde(default)]
    pub executed_steps: Vec<ExecutedStep>,
}

/// A plan entry: the accepted intent plus the candidate currently bound to
/// it. The intent is append-only; the candidate slot is rewritten by the
/// coordinator when discovery or healing produces a better binding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
}

impl PlanStep {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            candidate: None,
        }
    }
}

/// The typed state the coordinator drives through the pipeline.
///
/// Mutation discipline: only the coordinator writes this struct. Components
/// return proposed values (including whole replacement lists for
/// `heal_events` and `executed_steps`) which the coordinator installs, so
/// that every append is observable as a fresh snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub req_id: ReqId,
    pub step_idx: usize,
    pub heal_round: u32,
    pub plan: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub failure: FailureKind,
    #[serde(default)]
    pub heal_events: Vec<HealEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rca_detail: Option<String>,
    #[serde(default)]
    pub requires_human: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_input: Option<String>,
    pub context: RunContext,
    /// Session state is snapshotted at most once per run.
    #[serde(default)]
    pub session_state_saved: bool,
    pub started_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(req_id: ReqId, url: impl Into<String>, intents: Vec<Intent>) -> Self {
        Self {
            req_id,
            step_idx: 0,
            heal_round: 0,
            plan: intents.into_iter().map(PlanStep::new).collect(),
            verdict: None,
            failure: FailureKind::None,
            heal_events: Vec::new(),
            last_selector: None,
            rca_detail: None,
            requires_human: false,
            human_input: None,
            context: RunContext {
                url: url.into(),
                storage_state_path: None,
                executed_steps: Vec::new(),
            },
            session_state_saved: false,
            started_at: Utc::now(),
        }
    }

    /// The plan entry the run is currently positioned on.
    pub fn current(&self) -> Option<&PlanStep> {
        self.plan.get(self.step_idx)
    }

    pub fn steps_remaining(&self) -> bool {
        self.step_idx < self.plan.len()
    }

    /// Pass condition: every step executed and no failure pending.
    pub fn is_pass(&self) -> bool {
        self.step_idx == self.plan.len() && self.failure == FailureKind::None
    }

    /// Fold the terminal state into the persisted record.
    pub fn into_record(self, verdict: Verdict, artifacts: Vec<String>) -> RunRecord {
        RunRecord {
            req_id: self.req_id,
            start: self.started_at,
            end: Utc::now(),
            verdict,
            heal_rounds: self.heal_events.len() as u32,
            heal_events: self.heal_events,
            executed_steps: self.context.executed_steps,
            rca_detail: self.rca_detail,
            artifacts,
        }
    }
}

/// One persisted record per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub req_id: ReqId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub verdict: Verdict,
    pub heal_rounds: u32,
    #[serde(default)]
    pub heal_events: Vec<HealEvent>,
    #[serde(default)]
    pub executed_steps: Vec<ExecutedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rca_detail: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;

    fn plan(n: usize) -> Vec<Intent> {
        (0..n)
            .map(|i| Intent::new(Step::new(format!("Button {i}"), Action::Click)))
            .collect()
    }

    #[test]
    fn empty_plan_is_an_immediate_pass() {
        let state = RunState::new(ReqId::new(), "https://example.test", plan(0));
        assert!(state.is_pass());
        assert!(!state.steps_remaining());
    }

    #[test]
    fn pass_requires_all_steps_and_no_failure() {
        let mut state = RunState::new(ReqId::new(), "https://example.test", plan(2));
        assert!(!state.is_pass());
        state.step_idx = 2;
        assert!(state.is_pass());
        state.failure = FailureKind::Timeout;
        assert!(!state.is_pass());
    }

    #[test]
    fn healable_and_terminal_kinds_are_disjoint() {
        for kind in [
            FailureKind::NotUnique,
            FailureKind::NotVisible,
            FailureKind::NotEnabled,
            FailureKind::Unstable,
            FailureKind::Timeout,
            FailureKind::DiscoveryNone,
        ] {
            assert!(kind.is_healable());
            assert!(!kind.is_terminal());
        }
        for kind in [
            FailureKind::Blocked,
            FailureKind::WaitForHuman,
            FailureKind::Cancelled,
        ] {
            assert!(kind.is_terminal());
            assert!(!kind.is_healable());
        }
        assert!(!FailureKind::NotScoped.is_terminal());
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut state = RunState::new(ReqId::new(), "https://example.test", plan(1));
        state.step_idx = 1;
        state.heal_events = vec![HealEvent {
            round: 1,
            step_idx: 0,
            failure_kind: FailureKind::NotVisible,
            actions: vec!["scroll_into_view".into()],
            old_selector: Some("#old".into()),
            new_selector: Some("[aria-label=\"Button 0\"]".into()),
            gate_result: None,
            success: true,
            duration_ms: 240,
        }];
        let record = state.into_record(Verdict::Pass, vec!["shot.png".into()]);
        let json = serde_json::to_string(&record).unwrap();
        let back: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.heal_rounds, 1);
    }
}

//! Artifact emission.
//!
//! A passed run is worth keeping: the artifact is a reusable test script
//! annotated with the exact selectors, strategies and heal steps that
//! made the run pass, plus pointers to the captured screenshots.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pacts_core_types::{Action, HealEvent, Intent, RunRecord, Verdict};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One replayable step with its resolved binding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactStep {
    pub label: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
    /// Selector that actually passed, when the step executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// Heal actions that were needed to make this step pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heal_actions: Vec<String>,
}

/// The whole emitted document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub scenario: String,
    pub req_id: String,
    pub url: String,
    pub generated_at: DateTime<Utc>,
    pub verdict: Verdict,
    pub steps: Vec<ArtifactStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heal_events: Vec<HealEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<String>,
}

impl Artifact {
    pub fn from_run(scenario: &str, url: &str, plan: &[Intent], record: &RunRecord) -> Self {
        let steps = plan
            .iter()
            .enumerate()
            .map(|(idx, intent)| {
                let executed = record.executed_steps.iter().find(|s| s.step_idx == idx);
                let heal_actions = record
                    .heal_events
                    .iter()
                    .filter(|e| e.step_idx == idx && e.success)
                    .flat_map(|e| e.actions.iter().cloned())
                    .collect();
                ArtifactStep {
                    label: intent.label().to_string(),
                    action: intent.action(),
                    value: intent.step.value.clone(),
                    within: intent.step.within.clone(),
                    selector: executed.and_then(|s| s.selector.clone()),
                    strategy: executed
                        .and_then(|s| s.strategy)
                        .map(|s| s.name().to_string()),
                    screenshot: executed.and_then(|s| s.screenshot.clone()),
                    heal_actions,
                }
            })
            .collect();

        Self {
            scenario: scenario.to_string(),
            req_id: record.req_id.0.clone(),
            url: url.to_string(),
            generated_at: Utc::now(),
            verdict: record.verdict.clone(),
            steps,
            heal_events: record.heal_events.clone(),
            screenshots: record.artifacts.clone(),
        }
    }

    /// Write to `<dir>/<req_id>.json` and return the path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ArtifactError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.req_id));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacts_core_types::{ExecutedStep, FailureKind, ReqId, Step, Strategy};

    fn passing_record() -> (Vec<Intent>, RunRecord) {
        let plan = vec![
            Intent::new(Step::new("Search", Action::Fill).with_value("X")),
            Intent::new(Step::new("Go", Action::Click)),
        ];
        let record = RunRecord {
            req_id: ReqId::new(),
            start: Utc::now(),
            end: Utc::now(),
            verdict: Verdict::Pass,
            heal_rounds: 1,
            heal_events: vec![HealEvent {
                round: 0,
                step_idx: 0,
                failure_kind: FailureKind::NotVisible,
                actions: vec!["activate_adjacent".into()],
                old_selector: None,
                new_selector: Some("input[aria-label=\"Search\"]".into()),
                gate_result: None,
                success: true,
                duration_ms: 12,
            }],
            executed_steps: vec![
                ExecutedStep {
                    step_idx: 0,
                    label: "Search".into(),
                    action: Action::Fill,
                    selector: Some("input[aria-label=\"Search\"]".into()),
                    strategy: Some(Strategy::Placeholder),
                    duration_ms: 40,
                    screenshot: Some("req_step01_search.png".into()),
                    finished_at: Utc::now(),
                },
                ExecutedStep {
                    step_idx: 1,
                    label: "Go".into(),
                    action: Action::Click,
                    selector: Some("role=button[name=/Go/i]".into()),
                    strategy: Some(Strategy::RoleName),
                    duration_ms: 25,
                    screenshot: Some("req_step02_go.png".into()),
                    finished_at: Utc::now(),
                },
            ],
            rca_detail: None,
            artifacts: vec!["req_step01_search.png".into(), "req_step02_go.png".into()],
        };
        (plan, record)
    }

    #[test]
    fn artifact_annotates_steps_with_bindings_and_heals() {
        let (plan, record) = passing_record();
        let artifact = Artifact::from_run("Search flow", "https://shop.test", &plan, &record);

        assert_eq!(artifact.steps.len(), 2);
        let first = &artifact.steps[0];
        assert_eq!(first.selector.as_deref(), Some("input[aria-label=\"Search\"]"));
        assert_eq!(first.strategy.as_deref(), Some("placeholder"));
        assert_eq!(first.heal_actions, vec!["activate_adjacent".to_string()]);
        let second = &artifact.steps[1];
        assert!(second.heal_actions.is_empty());
        assert_eq!(second.strategy.as_deref(), Some("role_name"));
    }

    #[test]
    fn artifact_round_trips_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (plan, record) = passing_record();
        let artifact = Artifact::from_run("Search flow", "https://shop.test", &plan, &record);

        let path = artifact.write_to(dir.path()).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().ends_with(".json"));
        let raw = std::fs::read_to_string(path).unwrap();
        let back: Artifact = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.scenario, "Search flow");
        assert_eq!(back.steps.len(), 2);
        assert_eq!(back.verdict, Verdict::Pass);
    }
}

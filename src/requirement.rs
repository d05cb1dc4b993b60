//! Requirement-file parsing.
//!
//! Two formats are accepted: a plain-text document with a scenario header
//! and one step per line, and a YAML document with the same content
//! spelled out. Step lines follow
//!
//! ```text
//! <action> <label> [= <value>] [within <landmark>]
//! ```
//!
//! Leading list markers (`1.`, `-`, `*`) are tolerated so hand-written
//! checklists parse as-is.

use std::path::Path;

use pacts_core_types::{Action, Step};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequirementError {
    #[error("requirement file unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml requirement malformed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("line {line}: unknown action '{action}'")]
    UnknownAction { line: usize, action: String },
    #[error("line {line}: step has no label")]
    MissingLabel { line: usize },
    #[error("requirement contains no steps")]
    Empty,
}

/// A parsed requirement: scenario name plus the ordered step list.
#[derive(Clone, Debug, PartialEq)]
pub struct Requirement {
    pub scenario: String,
    pub steps: Vec<Step>,
}

impl Requirement {
    pub fn load(path: &Path) -> Result<Self, RequirementError> {
        let raw = std::fs::read_to_string(path)?;
        let by_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if by_ext {
            Self::parse_yaml(&raw)
        } else {
            Self::parse_text(&raw)
        }
    }

    pub fn parse_yaml(raw: &str) -> Result<Self, RequirementError> {
        #[derive(Deserialize)]
        struct YamlStep {
            label: String,
            action: String,
            #[serde(default)]
            value: Option<String>,
            #[serde(default)]
            expected: Option<String>,
            #[serde(default)]
            within: Option<String>,
            #[serde(default)]
            test_case_id: Option<String>,
        }
        #[derive(Deserialize)]
        struct YamlRequirement {
            scenario: String,
            steps: Vec<YamlStep>,
        }

        let parsed: YamlRequirement = serde_yaml::from_str(raw)?;
        let mut steps = Vec::new();
        for (idx, step) in parsed.steps.into_iter().enumerate() {
            let action = Action::parse(&step.action).ok_or(RequirementError::UnknownAction {
                line: idx + 1,
                action: step.action.clone(),
            })?;
            if step.label.trim().is_empty() {
                return Err(RequirementError::MissingLabel { line: idx + 1 });
            }
            steps.push(Step {
                label: step.label,
                action,
                value: step.value,
                expected: step.expected,
                within: step.within,
                test_case_id: step.test_case_id,
            });
        }
        if steps.is_empty() {
            return Err(RequirementError::Empty);
        }
        Ok(Self {
            scenario: parsed.scenario,
            steps,
        })
    }

    pub fn parse_text(raw: &str) -> Result<Self, RequirementError> {
        let mut scenario = String::new();
        let mut steps = Vec::new();

        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix("Scenario:") {
                scenario = name.trim().to_string();
                continue;
            }

            let stripped = strip_list_marker(line);
            let mut words = stripped.splitn(2, char::is_whitespace);
            let head = words.next().unwrap_or_default();

            let Some(action) = Action::parse(head) else {
                // The first non-step line doubles as the scenario header.
                if scenario.is_empty() && steps.is_empty() {
                    scenario = stripped.to_string();
                    continue;
                }
                return Err(RequirementError::UnknownAction {
                    line: lineno + 1,
                    action: head.to_string(),
                });
            };

            let rest = words.next().unwrap_or("").trim();
            let (rest, within) = split_off_keyword(rest, " within ");
            let (label, value) = match rest.split_once('=') {
                Some((label, value)) => (label.trim(), Some(value.trim().to_string())),
                None => (rest.as_str(), None),
            };

            if label.is_empty() && action != Action::Wait {
                return Err(RequirementError::MissingLabel { line: lineno + 1 });
            }

            steps.push(Step {
                label: if label.is_empty() {
                    "wait".to_string()
                } else {
                    label.to_string()
                },
                action,
                value,
                expected: None,
                within,
                test_case_id: None,
            });
        }

        if steps.is_empty() {
            return Err(RequirementError::Empty);
        }
        if scenario.is_empty() {
            scenario = "unnamed scenario".to_string();
        }
        Ok(Self { scenario, steps })
    }
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim_start_matches(['-', '*']).trim_start();
    match line.split_once('.') {
        Some((number, rest)) if number.chars().all(|c| c.is_ascii_digit()) && !number.is_empty() => {
            rest.trim_start()
        }
        _ => line,
    }
}

fn split_off_keyword(rest: &str, keyword: &str) -> (String, Option<String>) {
    match rest.rfind(keyword) {
        Some(idx) => {
            let landmark = rest[idx + keyword.len()..].trim().to_string();
            let head = rest[..idx].trim().to_string();
            if landmark.is_empty() {
                (rest.to_string(), None)
            } else {
                (head, Some(landmark))
            }
        }
        None => (rest.to_string(), None),
    }
}

//! Input model: raw steps and normalized intents.

use serde::{Deserialize, Serialize};

use crate::candidate::Strategy;

/// Typed browser action requested by a step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Click,
    Fill,
    Type,
    Press,
    Select,
    Check,
    Uncheck,
    Hover,
    Focus,
    Wait,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click => "click",
            Action::Fill => "fill",
            Action::Type => "type",
            Action::Press => "press",
            Action::Select => "select",
            Action::Check => "check",
            Action::Uncheck => "uncheck",
            Action::Hover => "hover",
            Action::Focus => "focus",
            Action::Wait => "wait",
        }
    }

    /// Parse the textual form used by requirement files.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "click" => Some(Action::Click),
            "fill" => Some(Action::Fill),
            "type" => Some(Action::Type),
            "press" => Some(Action::Press),
            "select" => Some(Action::Select),
            "check" => Some(Action::Check),
            "uncheck" => Some(Action::Uncheck),
            "hover" => Some(Action::Hover),
            "focus" => Some(Action::Focus),
            "wait" => Some(Action::Wait),
            _ => None,
        }
    }

    /// Actions that never require an enabled target (the gate passes
    /// `enabled` automatically for these).
    pub fn is_read_only(&self) -> bool {
        matches!(self, Action::Hover | Action::Focus | Action::Wait)
    }

    /// Actions that write into the target and therefore also reject
    /// read-only inputs.
    pub fn writes_value(&self) -> bool {
        matches!(
            self,
            Action::Fill | Action::Type | Action::Select | Action::Check | Action::Uncheck
        )
    }

    /// Fillable inputs are often hidden behind a collapse toggle, so
    /// visibility is deferred to the executor's activation pass.
    pub fn defers_visibility(&self) -> bool {
        matches!(self, Action::Fill)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One raw step as produced by the requirement parser or the planner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Human label of the target element ("Search", "Save", ...).
    pub label: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Optional region-scoping hint: the label of a prior landmark element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<String>,
}

impl Step {
    pub fn new(label: impl Into<String>, action: Action) -> Self {
        Self {
            label: label.into(),
            action,
            value: None,
            expected: None,
            within: None,
            test_case_id: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_within(mut self, landmark: impl Into<String>) -> Self {
        self.within = Some(landmark.into());
        self
    }
}

/// Planner hints attached to a normalized step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hints {
    /// ARIA role the target is expected to carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Optional override of the discovery tier order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_order: Option<Vec<Strategy>>,
}

/// A normalized step. Once the coordinator accepts an intent it is
/// append-only: later stages attach candidates next to it, never edit it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(flatten)]
    pub step: Step,
    #[serde(default)]
    pub hints: Hints,
}

impl Intent {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            hints: Hints::default(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.hints.role = Some(role.into());
        self
    }

    pub fn label(&self) -> &str {
        &self.step.label
    }

    pub fn action(&self) -> Action {
        self.step.action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_text() {
        for action in [
            Action::Click,
            Action::Fill,
            Action::Type,
            Action::Press,
            Action::Select,
            Action::Check,
            Action::Uncheck,
            Action::Hover,
            Action::Focus,
            Action::Wait,
        ] {
            assert_eq!(Action::parse(action.name()), Some(action));
        }
        assert_eq!(Action::parse("double-click"), None);
    }

    #[test]
    fn read_only_actions_skip_enabled_check() {
        assert!(Action::Hover.is_read_only());
        assert!(Action::Focus.is_read_only());
        assert!(!Action::Click.is_read_only());
        assert!(!Action::Fill.is_read_only());
    }

    #[test]
    fn only_fill_defers_visibility() {
        assert!(Action::Fill.defers_visibility());
        assert!(!Action::Type.defers_visibility());
        assert!(!Action::Click.defers_visibility());
    }

    #[test]
    fn intent_serde_flattens_step() {
        let intent = Intent::new(
            Step::new("Search", Action::Fill)
                .with_value("rust")
                .with_within("App Launcher"),
        )
        .with_role("searchbox");
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["label"], "Search");
        assert_eq!(json["action"], "fill");
        assert_eq!(json["within"], "App Launcher");
        assert_eq!(json["hints"]["role"], "searchbox");
        let back: Intent = serde_json::from_value(json).unwrap();
        assert_eq!(back, intent);
    }
}

//! Step normalization.
//!
//! The planner turns raw steps into intents the engine consumes. The
//! shipped implementation is rule-based: role hints derived from the
//! action and label keywords. An LLM-backed planner slots in behind the
//! same trait; the engine only ever sees intents.

use pacts_core_types::{Action, Hints, Intent, Step};

pub trait Planner: Send + Sync {
    fn plan(&self, steps: Vec<Step>) -> Vec<Intent>;
}

/// Keyword-driven normalization, no model calls.
#[derive(Default)]
pub struct RuleBasedPlanner;

impl RuleBasedPlanner {
    pub fn new() -> Self {
        Self
    }

    fn role_hint(step: &Step) -> Option<String> {
        let label = step.label.to_lowercase();
        match step.action {
            Action::Fill | Action::Type => {
                if label.contains("search") {
                    Some("searchbox".into())
                } else if label.contains("password")
                    || label.contains("email")
                    || label.contains("user")
                    || label.contains("name")
                    || label.contains("code")
                {
                    Some("textbox".into())
                } else {
                    None
                }
            }
            Action::Click => {
                if label.contains("link") || label.ends_with(" page") {
                    Some("link".into())
                } else {
                    Some("button".into())
                }
            }
            Action::Select => Some("combobox".into()),
            Action::Check | Action::Uncheck => Some("checkbox".into()),
            _ => None,
        }
    }
}

impl Planner for RuleBasedPlanner {
    fn plan(&self, steps: Vec<Step>) -> Vec<Intent> {
        steps
            .into_iter()
            .map(|step| {
                let hints = Hints {
                    role: Self::role_hint(&step),
                    tier_order: None,
                };
                Intent { step, hints }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_steps_get_input_role_hints() {
        let planner = RuleBasedPlanner::new();
        let intents = planner.plan(vec![
            Step::new("Search", Action::Fill).with_value("x"),
            Step::new("Password", Action::Fill).with_value("secret"),
            Step::new("Biography", Action::Fill).with_value("text"),
        ]);
        assert_eq!(intents[0].hints.role.as_deref(), Some("searchbox"));
        assert_eq!(intents[1].hints.role.as_deref(), Some("textbox"));
        assert_eq!(intents[2].hints.role, None);
    }

    #[test]
    fn click_steps_default_to_buttons() {
        let planner = RuleBasedPlanner::new();
        let intents = planner.plan(vec![
            Step::new("Save", Action::Click),
            Step::new("Settings link", Action::Click),
        ]);
        assert_eq!(intents[0].hints.role.as_deref(), Some("button"));
        assert_eq!(intents[1].hints.role.as_deref(), Some("link"));
    }

    #[test]
    fn wait_steps_carry_no_hints() {
        let planner = RuleBasedPlanner::new();
        let intents = planner.plan(vec![Step::new("2FA", Action::Wait)]);
        assert_eq!(intents[0].hints, Hints::default());
    }
}

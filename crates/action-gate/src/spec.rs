//! What the caller is asking the gate to check.

use browser_driver::Locator;
use pacts_core_types::Action;

/// Visibility handling. `Deferred` is the executor's fill exception: the
/// input may be hidden now because an activation step will reveal it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VisibilityMode {
    #[default]
    Required,
    Deferred,
}

#[derive(Clone, Debug)]
pub struct GateSpec {
    pub action: Action,
    pub heal_round: u32,
    pub visibility: VisibilityMode,
    /// Ignore center-point occlusion.
    pub allow_covered: bool,
    /// Landmark the candidate must live under.
    pub within: Option<Locator>,
}

impl GateSpec {
    pub fn for_action(action: Action, heal_round: u32) -> Self {
        Self {
            action,
            heal_round,
            visibility: VisibilityMode::Required,
            allow_covered: false,
            within: None,
        }
    }

    pub fn with_visibility(mut self, visibility: VisibilityMode) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_allow_covered(mut self) -> Self {
        self.allow_covered = true;
        self
    }

    pub fn with_within(mut self, landmark: Locator) -> Self {
        self.within = Some(landmark);
        self
    }
}

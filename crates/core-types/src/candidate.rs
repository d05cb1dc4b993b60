//! Discovery output: selector candidates and the strategies that produce
//! them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named discovery strategy, in default precedence order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Cached,
    AriaLabel,
    NameAttr,
    Placeholder,
    LabelFor,
    RoleName,
    RoleNameDisambiguated,
    TextHas,
    Id,
    RegionScoped,
    AppSpecific,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Cached => "cached",
            Strategy::AriaLabel => "aria_label",
            Strategy::NameAttr => "name_attr",
            Strategy::Placeholder => "placeholder",
            Strategy::LabelFor => "label_for",
            Strategy::RoleName => "role_name",
            Strategy::RoleNameDisambiguated => "role_name_disambiguated",
            Strategy::TextHas => "text_has",
            Strategy::Id => "id",
            Strategy::RegionScoped => "region_scoped",
            Strategy::AppSpecific => "app_specific",
        }
    }

    /// Strategies whose identifier is intrinsic to the element's semantics.
    /// Everything else binds to incidental structure and is tagged unstable.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            Strategy::AriaLabel | Strategy::NameAttr | Strategy::Placeholder | Strategy::RoleName
        )
    }

    /// Baseline confidence before the per-round decay is applied.
    pub fn baseline_confidence(&self) -> f64 {
        match self {
            Strategy::Cached => 0.95,
            Strategy::AriaLabel => 0.92,
            Strategy::NameAttr => 0.90,
            Strategy::Placeholder => 0.88,
            Strategy::RoleName => 0.85,
            Strategy::LabelFor => 0.80,
            Strategy::RoleNameDisambiguated => 0.75,
            Strategy::TextHas => 0.70,
            Strategy::AppSpecific => 0.65,
            Strategy::RegionScoped => 0.82,
            Strategy::Id => 0.60,
        }
    }

    /// The default tier order walked by discovery.
    pub fn default_tier_order() -> Vec<Strategy> {
        vec![
            Strategy::Cached,
            Strategy::AriaLabel,
            Strategy::NameAttr,
            Strategy::Placeholder,
            Strategy::LabelFor,
            Strategy::RoleName,
            Strategy::RoleNameDisambiguated,
            Strategy::TextHas,
            Strategy::RegionScoped,
            Strategy::AppSpecific,
        ]
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved selector with the metadata needed to score and replay it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub selector: String,
    pub confidence: f64,
    pub strategy: Strategy,
    pub stable: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl Candidate {
    pub fn new(selector: impl Into<String>, strategy: Strategy, confidence: f64) -> Self {
        Self {
            selector: selector.into(),
            confidence,
            strategy,
            stable: strategy.is_stable(),
            meta: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Explicit stability override, used when a cached entry carries the
    /// stability of the strategy that originally produced it.
    pub fn with_stable(mut self, stable: bool) -> Self {
        self.stable = stable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stability_follows_the_producing_strategy() {
        assert!(Strategy::AriaLabel.is_stable());
        assert!(Strategy::NameAttr.is_stable());
        assert!(Strategy::Placeholder.is_stable());
        assert!(Strategy::RoleName.is_stable());
        for unstable in [
            Strategy::Cached,
            Strategy::LabelFor,
            Strategy::RoleNameDisambiguated,
            Strategy::TextHas,
            Strategy::Id,
            Strategy::RegionScoped,
            Strategy::AppSpecific,
        ] {
            assert!(!unstable.is_stable(), "{unstable} must not be stable");
        }
    }

    #[test]
    fn candidate_inherits_stability() {
        let c = Candidate::new("[aria-label=\"Search\"]", Strategy::AriaLabel, 0.92);
        assert!(c.stable);
        let c = Candidate::new("#search", Strategy::Id, 0.6);
        assert!(!c.stable);
    }

    #[test]
    fn default_tier_order_starts_at_the_cache() {
        let order = Strategy::default_tier_order();
        assert_eq!(order.first(), Some(&Strategy::Cached));
        assert_eq!(order.last(), Some(&Strategy::AppSpecific));
    }
}

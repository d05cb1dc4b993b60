//! Gate verdict per candidate.

use pacts_core_types::FailureKind;
use serde::{Deserialize, Serialize};

/// Outcome of one gate evaluation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub unique: bool,
    pub visible: bool,
    pub enabled: bool,
    pub stable: bool,
    pub in_scope: bool,
    /// How many elements the (scoped) query matched.
    pub match_count: usize,
    pub latency_ms: u64,
}

impl GateReport {
    pub fn overall(&self) -> bool {
        self.unique && self.visible && self.enabled && self.stable && self.in_scope
    }

    /// First failing predicate in gate order. A candidate that exists on
    /// the page but not under the requested landmark reports `NotScoped`
    /// rather than `NotUnique`, since the element is present, just
    /// elsewhere.
    pub fn failure_kind(&self) -> FailureKind {
        if !self.unique {
            if !self.in_scope {
                return FailureKind::NotScoped;
            }
            return FailureKind::NotUnique;
        }
        if !self.visible {
            return FailureKind::NotVisible;
        }
        if !self.enabled {
            return FailureKind::NotEnabled;
        }
        if !self.stable {
            return FailureKind::Unstable;
        }
        if !self.in_scope {
            return FailureKind::NotScoped;
        }
        FailureKind::None
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing() -> GateReport {
        GateReport {
            unique: true,
            visible: true,
            enabled: true,
            stable: true,
            in_scope: true,
            match_count: 1,
            latency_ms: 5,
        }
    }

    #[test]
    fn failure_kind_follows_gate_order() {
        assert_eq!(passing().failure_kind(), FailureKind::None);

        let mut report = passing();
        report.visible = false;
        report.stable = false;
        assert_eq!(report.failure_kind(), FailureKind::NotVisible);

        let mut report = passing();
        report.stable = false;
        assert_eq!(report.failure_kind(), FailureKind::Unstable);
    }

    #[test]
    fn out_of_scope_beats_not_unique_when_nothing_matched() {
        let report = GateReport {
            unique: false,
            in_scope: false,
            match_count: 0,
            ..passing()
        };
        assert_eq!(report.failure_kind(), FailureKind::NotScoped);
    }
}

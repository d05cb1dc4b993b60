//! Tagged event model.

use chrono::{DateTime, Utc};
use pacts_core_types::ReqId;
use serde::{Deserialize, Serialize};

/// Stable event tag, one per pipeline stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tag {
    Discovery,
    Gate,
    Exec,
    Heal,
    Cache,
    Hitl,
    Router,
}

impl Tag {
    pub fn label(&self) -> &'static str {
        match self {
            Tag::Discovery => "DISCOVERY",
            Tag::Gate => "GATE",
            Tag::Exec => "EXEC",
            Tag::Heal => "HEAL",
            Tag::Cache => "CACHE",
            Tag::Hitl => "HITL",
            Tag::Router => "ROUTER",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.label())
    }
}

/// One structured event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub tag: Tag,
    pub req_id: ReqId,
    pub step_idx: usize,
    pub heal_round: u32,
    pub latency_ms: u64,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(
        tag: Tag,
        req_id: ReqId,
        step_idx: usize,
        heal_round: u32,
        latency_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tag,
            req_id,
            step_idx,
            heal_round,
            latency_ms,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_render_bracketed() {
        assert_eq!(Tag::Discovery.to_string(), "[DISCOVERY]");
        assert_eq!(Tag::Hitl.to_string(), "[HITL]");
    }
}

//! Engine configuration: every operator-recognized knob with its default.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Hard ceiling on the healing bound; the knob is clamped, never trusted.
pub const MAX_HEAL_ROUNDS_CEILING: u32 = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Healing bound per step.
    pub max_heal_rounds: u32,
    /// Total discovery wall-clock budget per intent.
    pub discovery_total_timeout_ms: u64,
    /// Base timeout of every driver action.
    pub action_timeout_ms: u64,
    /// Readiness wait before each step.
    pub readiness_wait_ms: u64,
    /// Readiness wait when the landing URL matches an SPA marker.
    pub spa_readiness_wait_ms: u64,
    /// URL fragments that mark a single-page app (operators may extend).
    pub spa_markers: Vec<String>,
    pub cache_fast_ttl_s: u64,
    pub cache_durable_ttl_s: u64,
    /// Permit durable writes of raw `#id` selectors.
    pub allow_id_cache: bool,
    /// Permit cache hits flagged unstable.
    pub allow_unstable_hit: bool,
    /// Keep the label-first tier order; turning this off moves the
    /// role-name tiers ahead of the label-derived ones.
    pub label_first_discovery: bool,
    /// Confidence decay subtracted per heal round.
    pub confidence_decay_per_round: f64,
    pub hitl_timeout_ms: u64,
    pub hitl_poll_interval_ms: u64,
    /// Environment variable polled first for human input.
    pub hitl_env_var: String,
    /// File whose content is the human input (deleted on read).
    pub hitl_code_file: PathBuf,
    /// Presence file signalling plain continuation (deleted on read).
    pub hitl_flag_file: PathBuf,
    /// Enables session-state persist/restore when set.
    pub session_state_path: Option<PathBuf>,
    /// Origin patterns for which cached form selectors are bypassed.
    pub bypass_form_cache_for_origin: Vec<String>,
    /// Directory screenshots are written to.
    pub screenshot_dir: PathBuf,
    /// Directory run artifacts are written to.
    pub artifact_dir: PathBuf,
    /// Durable cache snapshot location.
    pub cache_path: PathBuf,
    /// Run-record store location (JSON lines).
    pub run_store_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_heal_rounds: 3,
            discovery_total_timeout_ms: 30_000,
            action_timeout_ms: 5_000,
            readiness_wait_ms: 500,
            spa_readiness_wait_ms: 1_000,
            spa_markers: vec!["/#/".into(), "#!".into()],
            cache_fast_ttl_s: 24 * 3600,
            cache_durable_ttl_s: 7 * 24 * 3600,
            allow_id_cache: true,
            allow_unstable_hit: true,
            label_first_discovery: true,
            confidence_decay_per_round: 0.03,
            hitl_timeout_ms: 900_000,
            hitl_poll_interval_ms: 500,
            hitl_env_var: "PACTS_2FA_CODE".into(),
            hitl_code_file: PathBuf::from("hitl/2fa_code.txt"),
            hitl_flag_file: PathBuf::from("hitl/continue.ok"),
            session_state_path: None,
            bypass_form_cache_for_origin: Vec::new(),
            screenshot_dir: PathBuf::from("artifacts/screenshots"),
            artifact_dir: PathBuf::from("artifacts"),
            cache_path: PathBuf::from(".pacts/selector_cache.json"),
            run_store_path: PathBuf::from(".pacts/runs.jsonl"),
        }
    }
}

impl EngineConfig {
    /// The healing bound actually enforced (knob clamped to the ceiling).
    pub fn effective_max_heal_rounds(&self) -> u32 {
        self.max_heal_rounds.min(MAX_HEAL_ROUNDS_CEILING)
    }

    /// Readiness wait for a landing URL, SPA-aware.
    pub fn readiness_wait_for(&self, url: &str) -> u64 {
        if self.spa_markers.iter().any(|m| url.contains(m.as_str())) {
            self.spa_readiness_wait_ms
        } else {
            self.readiness_wait_ms
        }
    }

    /// Whether cached form selectors must be bypassed for this origin.
    pub fn bypass_cache_for(&self, origin: &str) -> bool {
        self.bypass_form_cache_for_origin
            .iter()
            .any(|pattern| origin.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_knobs() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_heal_rounds, 3);
        assert_eq!(cfg.discovery_total_timeout_ms, 30_000);
        assert_eq!(cfg.action_timeout_ms, 5_000);
        assert_eq!(cfg.readiness_wait_ms, 500);
        assert_eq!(cfg.spa_readiness_wait_ms, 1_000);
        assert_eq!(cfg.hitl_timeout_ms, 900_000);
        assert!(cfg.allow_id_cache);
        assert!(cfg.allow_unstable_hit);
        assert_eq!(cfg.hitl_env_var, "PACTS_2FA_CODE");
    }

    #[test]
    fn heal_rounds_clamp_at_the_ceiling() {
        let mut cfg = EngineConfig::default();
        cfg.max_heal_rounds = 12;
        assert_eq!(cfg.effective_max_heal_rounds(), 5);
        cfg.max_heal_rounds = 4;
        assert_eq!(cfg.effective_max_heal_rounds(), 4);
    }

    #[test]
    fn spa_marker_extends_the_readiness_wait() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.readiness_wait_for("https://a.test/login"), 500);
        assert_eq!(cfg.readiness_wait_for("https://a.test/#/login"), 1_000);
    }

    #[test]
    fn partial_config_files_deserialize_over_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"max_heal_rounds": 5}"#).unwrap();
        assert_eq!(cfg.max_heal_rounds, 5);
        assert_eq!(cfg.action_timeout_ms, 5_000);
    }
}

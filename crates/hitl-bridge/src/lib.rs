//! Human-in-the-loop bridge.
//!
//! Suspended runs wait on three signaling channels, polled in order: a
//! process environment variable, a file whose content is the input, and
//! a bare presence file. Nothing ever reads from a terminal, so the
//! engine behaves identically in headless, CI, and embedded contexts.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use pacts_core_types::EngineConfig;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum HitlError {
    #[error("no human signal within {waited_ms} ms")]
    TimedOut { waited_ms: u64 },
    #[error("run cancelled while awaiting human input")]
    Cancelled,
}

/// What the human provided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HitlSignal {
    /// A value (e.g. a 2FA code) from the env var or the content file.
    Input(String),
    /// Bare continuation from the presence file.
    Continue,
}

#[derive(Clone, Debug)]
pub struct HitlConfig {
    pub env_var: String,
    pub code_file: PathBuf,
    pub flag_file: PathBuf,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            env_var: "PACTS_2FA_CODE".into(),
            code_file: PathBuf::from("hitl/2fa_code.txt"),
            flag_file: PathBuf::from("hitl/continue.ok"),
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(900),
        }
    }
}

impl From<&EngineConfig> for HitlConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            env_var: cfg.hitl_env_var.clone(),
            code_file: cfg.hitl_code_file.clone(),
            flag_file: cfg.hitl_flag_file.clone(),
            poll_interval: Duration::from_millis(cfg.hitl_poll_interval_ms),
            timeout: Duration::from_millis(cfg.hitl_timeout_ms),
        }
    }
}

pub struct HitlBridge {
    config: HitlConfig,
}

impl HitlBridge {
    pub fn new(config: HitlConfig) -> Self {
        Self { config }
    }

    /// Block until one of the three channels fires, the timeout elapses,
    /// or the run is cancelled. Content and presence files are consumed
    /// on read.
    pub async fn await_signal(&self, cancel: &CancellationToken) -> Result<HitlSignal, HitlError> {
        let started = Instant::now();
        info!(
            target: "pacts::hitl",
            env_var = %self.config.env_var,
            code_file = %self.config.code_file.display(),
            flag_file = %self.config.flag_file.display(),
            "awaiting human signal"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(HitlError::Cancelled);
            }

            if let Some(signal) = self.poll_once() {
                return Ok(signal);
            }

            if started.elapsed() >= self.config.timeout {
                return Err(HitlError::TimedOut {
                    waited_ms: self.config.timeout.as_millis() as u64,
                });
            }
            sleep(self.config.poll_interval).await;
        }
    }

    fn poll_once(&self) -> Option<HitlSignal> {
        if let Ok(value) = env::var(&self.config.env_var) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                info!(target: "pacts::hitl", "signal received via environment");
                return Some(HitlSignal::Input(trimmed.to_string()));
            }
        }

        if self.config.code_file.exists() {
            match std::fs::read_to_string(&self.config.code_file) {
                Ok(content) => {
                    let _ = std::fs::remove_file(&self.config.code_file);
                    info!(target: "pacts::hitl", "signal received via content file");
                    return Some(HitlSignal::Input(content.trim().to_string()));
                }
                Err(err) => {
                    debug!(target: "pacts::hitl", %err, "content file unreadable, retrying");
                }
            }
        }

        if self.config.flag_file.exists() {
            let _ = std::fs::remove_file(&self.config.flag_file);
            info!(target: "pacts::hitl", "signal received via presence file");
            return Some(HitlSignal::Continue);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(dir: &std::path::Path, env_var: &str) -> HitlBridge {
        HitlBridge::new(HitlConfig {
            env_var: env_var.to_string(),
            code_file: dir.join("2fa_code.txt"),
            flag_file: dir.join("continue.ok"),
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(900),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn environment_variable_wins_first() {
        let dir = tempfile::tempdir().unwrap();
        env::set_var("PACTS_TEST_2FA_A", "123456");
        let bridge = bridge(dir.path(), "PACTS_TEST_2FA_A");
        let signal = bridge
            .await_signal(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(signal, HitlSignal::Input("123456".into()));
        env::remove_var("PACTS_TEST_2FA_A");
    }

    #[tokio::test(start_paused = true)]
    async fn content_file_is_read_then_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path(), "PACTS_TEST_2FA_B");
        std::fs::write(dir.path().join("2fa_code.txt"), "654321\n").unwrap();

        let signal = bridge
            .await_signal(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(signal, HitlSignal::Input("654321".into()));
        assert!(!dir.path().join("2fa_code.txt").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn presence_file_signals_plain_continuation() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path(), "PACTS_TEST_2FA_C");
        std::fs::write(dir.path().join("continue.ok"), "").unwrap();

        let signal = bridge
            .await_signal(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(signal, HitlSignal::Continue);
        assert!(!dir.path().join("continue.ok").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_with_the_configured_bound() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path(), "PACTS_TEST_2FA_D");
        let err = bridge
            .await_signal(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            HitlError::TimedOut { waited_ms } => assert_eq!(waited_ms, 900_000),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path(), "PACTS_TEST_2FA_E");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bridge.await_signal(&cancel).await.unwrap_err();
        assert!(matches!(err, HitlError::Cancelled));
    }
}

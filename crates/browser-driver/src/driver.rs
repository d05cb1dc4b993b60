//! The capability surface the engine drives the browser through.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DriverError;
use crate::locator::Locator;

/// Viewport-relative bounding box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Largest per-dimension drift between two samples.
    pub fn drift(&self, other: &BoundingBox) -> f64 {
        let dx = (self.x - other.x).abs().max((self.width - other.width).abs());
        let dy = (self.y - other.y)
            .abs()
            .max((self.height - other.height).abs());
        dx.max(dy)
    }
}

/// One element matched by a query, with everything the gate needs in a
/// single round-trip.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementProbe {
    pub tag: String,
    pub bbox: BoundingBox,
    pub visible: bool,
    /// Center point is occluded by an unrelated element.
    pub covered: bool,
    pub enabled: bool,
    pub read_only: bool,
    /// Computed accessible name.
    pub name: String,
    /// Ancestor chain contains `role=tab`.
    pub in_tab: bool,
    /// Raw `id` attribute when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Session-state blob: cookies plus per-origin web storage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub cookies: Value,
    #[serde(default)]
    pub origins: Vec<OriginStorage>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginStorage {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<(String, String)>,
    #[serde(default)]
    pub session_storage: Vec<(String, String)>,
}

/// Launch and timeout knobs of a single driver instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverConfig {
    pub executable: PathBuf,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    /// Attach to an already-running browser instead of launching.
    pub websocket_url: Option<String>,
    /// Default deadline for every driver action.
    pub action_timeout_ms: u64,
    /// Transport command deadline.
    pub command_deadline_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            user_data_dir: PathBuf::from(".pacts/profile"),
            headless: true,
            websocket_url: None,
            action_timeout_ms: 5_000,
            command_deadline_ms: 30_000,
            heartbeat_interval_ms: 15_000,
        }
    }
}

/// Thin capability surface over a real browser.
///
/// Contract: every action observes a timeout and fails with
/// `DriverError::Timeout` when it elapses. No method fails because an
/// element is "not actionable"; callers run the gate for that. Methods
/// are reentrant within a run but never called concurrently across steps.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn start(&self) -> Result<(), DriverError>;
    async fn stop(&self) -> Result<(), DriverError>;

    async fn goto(&self, url: &str) -> Result<(), DriverError>;
    async fn current_url(&self) -> Result<String, DriverError>;

    /// Resolve a locator to every matching element.
    async fn query(&self, locator: &Locator) -> Result<Vec<ElementProbe>, DriverError>;

    async fn click(&self, locator: &Locator) -> Result<(), DriverError>;
    /// Clear then set the value.
    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError>;
    /// Character-by-character input with a per-character delay.
    async fn type_text(
        &self,
        locator: &Locator,
        value: &str,
        per_char_delay_ms: u64,
    ) -> Result<(), DriverError>;
    /// Keyboard key by name (`Enter`, `Escape`, ...), sent to the focused
    /// element.
    async fn press(&self, key: &str) -> Result<(), DriverError>;
    async fn select_option(&self, locator: &Locator, value: &str) -> Result<(), DriverError>;
    async fn set_checked(&self, locator: &Locator, checked: bool) -> Result<(), DriverError>;
    async fn hover(&self, locator: &Locator) -> Result<(), DriverError>;
    async fn focus(&self, locator: &Locator) -> Result<(), DriverError>;

    async fn attribute(
        &self,
        locator: &Locator,
        name: &str,
    ) -> Result<Option<String>, DriverError>;
    async fn accessible_name(&self, locator: &Locator) -> Result<Option<String>, DriverError>;
    async fn bounding_box(&self, locator: &Locator) -> Result<Option<BoundingBox>, DriverError>;
    async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError>;
    async fn is_enabled(&self, locator: &Locator) -> Result<bool, DriverError>;

    // Healing utilities.
    async fn scroll_into_view(&self, locator: &Locator) -> Result<(), DriverError>;
    async fn dismiss_overlays(&self) -> Result<(), DriverError>;
    async fn wait_for_dom_idle(&self, timeout_ms: u64) -> Result<(), DriverError>;
    async fn wait_for_network_idle(&self, timeout_ms: u64) -> Result<(), DriverError>;
    async fn bring_to_front(&self) -> Result<(), DriverError>;

    async fn storage_state_save(&self, path: &Path) -> Result<(), DriverError>;
    async fn storage_state_load(&self, path: &Path) -> Result<(), DriverError>;

    /// PNG screenshot of the viewport.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// Escape hatch for plug-ins (app-specific strategies, blocked-page
    /// detectors).
    async fn evaluate(&self, script: &str) -> Result<Value, DriverError>;
}

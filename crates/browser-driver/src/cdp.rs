//! `BrowserDriver` implementation over raw CDP commands.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::driver::{BoundingBox, BrowserDriver, DriverConfig, ElementProbe, OriginStorage, StorageState};
use crate::errors::DriverError;
use crate::js;
use crate::locator::Locator;
use crate::transport::{CdpTransport, ChromiumTransport, CommandTarget, NoopTransport};

const QUERY_POLL_MS: u64 = 100;
const DOM_SAMPLE_MS: u64 = 150;
const NETWORK_SAMPLE_MS: u64 = 250;

#[derive(Clone, Debug)]
struct PageSession {
    target_id: String,
    session_id: String,
}

/// One driver instance drives exactly one page in one browser.
pub struct CdpDriver {
    cfg: DriverConfig,
    transport: Arc<dyn CdpTransport>,
    session: Mutex<Option<PageSession>>,
}

impl CdpDriver {
    /// Build a driver, falling back to the noop transport when neither a
    /// websocket URL nor a local browser executable is available.
    pub fn new(cfg: DriverConfig) -> Self {
        let have_browser = cfg.websocket_url.is_some()
            || !cfg.executable.as_os_str().is_empty()
            || crate::transport::detect_browser_executable().is_some();
        let transport: Arc<dyn CdpTransport> = if have_browser {
            Arc::new(ChromiumTransport::new(cfg.clone()))
        } else {
            warn!(
                target: "pacts::driver",
                "no browser found; driver running on the noop transport"
            );
            Arc::new(NoopTransport)
        };
        Self::with_transport(cfg, transport)
    }

    pub fn with_transport(cfg: DriverConfig, transport: Arc<dyn CdpTransport>) -> Self {
        Self {
            cfg,
            transport,
            session: Mutex::new(None),
        }
    }

    fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.action_timeout_ms)
    }

    async fn session(&self) -> Result<PageSession, DriverError> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or(DriverError::NotStarted)
    }

    async fn page_command(&self, method: &str, params: Value) -> Result<Value, DriverError> {
        let session = self.session().await?;
        self.transport
            .send_command(CommandTarget::Session(session.session_id), method, params)
            .await
    }

    /// Evaluate an expression in the page, unwrapping the CDP envelope.
    async fn eval(&self, expression: &str) -> Result<Value, DriverError> {
        let response = self
            .page_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                    "userGesture": true,
                }),
            )
            .await?;

        if let Some(details) = response.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("page script raised");
            return Err(DriverError::Script(text.to_string()));
        }

        Ok(response
            .get("result")
            .and_then(|res| res.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Run an action body against the first chain match, polling until the
    /// element appears or the action timeout elapses.
    async fn eval_action(&self, locator: &Locator, body: &str) -> Result<Value, DriverError> {
        let script = js::action_script(locator, body);
        let deadline = Instant::now() + self.action_timeout();
        loop {
            let value = self.eval(&script).await?;
            let found = value
                .get("found")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if found {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(format!(
                    "element not found for locator '{locator}'"
                )));
            }
            sleep(Duration::from_millis(QUERY_POLL_MS)).await;
        }
    }

    /// First probe of a locator, polled under the action timeout.
    async fn first_probe(&self, locator: &Locator) -> Result<ElementProbe, DriverError> {
        let deadline = Instant::now() + self.action_timeout();
        loop {
            let probes = self.query(locator).await?;
            if let Some(probe) = probes.into_iter().next() {
                return Ok(probe);
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(format!(
                    "no element matched locator '{locator}'"
                )));
            }
            sleep(Duration::from_millis(QUERY_POLL_MS)).await;
        }
    }

    async fn dispatch_mouse(&self, kind: &str, x: f64, y: f64, pressed: bool) -> Result<(), DriverError> {
        let mut payload = json!({
            "type": kind,
            "x": x,
            "y": y,
            "pointerType": "mouse",
        });
        if pressed {
            payload["button"] = json!("left");
            payload["buttons"] = json!(1);
            payload["clickCount"] = json!(1);
        }
        self.page_command("Input.dispatchMouseEvent", payload)
            .await?;
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<(), DriverError> {
        self.page_command("Input.insertText", json!({ "text": text }))
            .await?;
        Ok(())
    }
}

/// Key descriptor for `Input.dispatchKeyEvent`.
fn key_spec(key: &str) -> (String, String, i64, Option<String>) {
    match key {
        "Enter" => ("Enter".into(), "Enter".into(), 13, Some("\r".into())),
        "Tab" => ("Tab".into(), "Tab".into(), 9, None),
        "Escape" => ("Escape".into(), "Escape".into(), 27, None),
        "Backspace" => ("Backspace".into(), "Backspace".into(), 8, None),
        "Delete" => ("Delete".into(), "Delete".into(), 46, None),
        "ArrowDown" => ("ArrowDown".into(), "ArrowDown".into(), 40, None),
        "ArrowUp" => ("ArrowUp".into(), "ArrowUp".into(), 38, None),
        "ArrowLeft" => ("ArrowLeft".into(), "ArrowLeft".into(), 37, None),
        "ArrowRight" => ("ArrowRight".into(), "ArrowRight".into(), 39, None),
        "Space" => (" ".into(), "Space".into(), 32, Some(" ".into())),
        other => {
            // Single printable characters map to themselves.
            let text = (other.chars().count() == 1).then(|| other.to_string());
            (other.to_string(), format!("Key{}", other.to_uppercase()), 0, text)
        }
    }
}

#[async_trait]
impl BrowserDriver for CdpDriver {
    async fn start(&self) -> Result<(), DriverError> {
        self.transport.start().await?;

        let created = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank" }),
            )
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Internal("createTarget returned no targetId".into()))?
            .to_string();

        let attached = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Internal("attachToTarget returned no sessionId".into()))?
            .to_string();

        *self.session.lock().await = Some(PageSession {
            target_id,
            session_id,
        });

        // Domain enables are best-effort; pages work without them.
        if let Err(err) = self.page_command("Page.enable", json!({})).await {
            debug!(target: "pacts::driver", ?err, "Page.enable failed");
        }
        if let Err(err) = self.page_command("Runtime.enable", json!({})).await {
            debug!(target: "pacts::driver", ?err, "Runtime.enable failed");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            let result = self
                .transport
                .send_command(
                    CommandTarget::Browser,
                    "Target.closeTarget",
                    json!({ "targetId": session.target_id }),
                )
                .await;
            if let Err(err) = result {
                debug!(target: "pacts::driver", ?err, "closeTarget failed during stop");
            }
        }
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.page_command("Page.navigate", json!({ "url": url }))
            .await?;
        // Settle to DOM readiness under the transport deadline; navigation
        // timeouts surface as Timeout like any other action.
        self.wait_for_dom_idle(self.cfg.command_deadline_ms).await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let value = self.eval("location.href").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Internal("location.href was not a string".into()))
    }

    async fn query(&self, locator: &Locator) -> Result<Vec<ElementProbe>, DriverError> {
        let value = self.eval(&js::query_script(locator)).await?;
        serde_json::from_value(value)
            .map_err(|err| DriverError::Internal(format!("malformed probe payload: {err}")))
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        let probe = self.first_probe(locator).await?;
        let (x, y) = probe.bbox.center();
        self.dispatch_mouse("mousePressed", x, y, true).await?;
        self.dispatch_mouse("mouseReleased", x, y, true).await
    }

    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        self.eval_action(locator, js::focus_and_select_body())
            .await?;
        self.insert_text(value).await
    }

    async fn type_text(
        &self,
        locator: &Locator,
        value: &str,
        per_char_delay_ms: u64,
    ) -> Result<(), DriverError> {
        self.eval_action(locator, js::focus_body()).await?;
        for ch in value.chars() {
            self.insert_text(&ch.to_string()).await?;
            if per_char_delay_ms > 0 {
                sleep(Duration::from_millis(per_char_delay_ms)).await;
            }
        }
        Ok(())
    }

    async fn press(&self, key: &str) -> Result<(), DriverError> {
        let (key_name, code, vk, text) = key_spec(key);
        let mut down = json!({
            "type": "keyDown",
            "key": key_name,
            "code": code,
            "windowsVirtualKeyCode": vk,
            "nativeVirtualKeyCode": vk,
        });
        if let Some(text) = &text {
            down["text"] = json!(text);
        }
        self.page_command("Input.dispatchKeyEvent", down).await?;
        self.page_command(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": key_name,
                "code": code,
                "windowsVirtualKeyCode": vk,
                "nativeVirtualKeyCode": vk,
            }),
        )
        .await?;
        Ok(())
    }

    async fn select_option(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        let result = self
            .eval_action(locator, &js::select_option_body(value))
            .await?;
        match result.get("status").and_then(Value::as_str) {
            Some("selected") => Ok(()),
            Some("option-missing") => Err(DriverError::Timeout(format!(
                "option '{value}' not present under locator '{locator}'"
            ))),
            other => Err(DriverError::Internal(format!(
                "select returned unexpected status {other:?}"
            ))),
        }
    }

    async fn set_checked(&self, locator: &Locator, checked: bool) -> Result<(), DriverError> {
        self.eval_action(locator, &js::set_checked_body(checked))
            .await?;
        Ok(())
    }

    async fn hover(&self, locator: &Locator) -> Result<(), DriverError> {
        let probe = self.first_probe(locator).await?;
        let (x, y) = probe.bbox.center();
        self.dispatch_mouse("mouseMoved", x, y, false).await
    }

    async fn focus(&self, locator: &Locator) -> Result<(), DriverError> {
        self.eval_action(locator, js::focus_body()).await?;
        Ok(())
    }

    async fn attribute(
        &self,
        locator: &Locator,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        let result = self
            .eval_action(locator, &js::attribute_body(name))
            .await?;
        Ok(result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn accessible_name(&self, locator: &Locator) -> Result<Option<String>, DriverError> {
        let result = self
            .eval_action(locator, js::accessible_name_body())
            .await?;
        Ok(result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn bounding_box(&self, locator: &Locator) -> Result<Option<BoundingBox>, DriverError> {
        Ok(self.query(locator).await?.into_iter().next().map(|p| p.bbox))
    }

    async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
        Ok(self
            .query(locator)
            .await?
            .first()
            .map(|p| p.visible)
            .unwrap_or(false))
    }

    async fn is_enabled(&self, locator: &Locator) -> Result<bool, DriverError> {
        Ok(self
            .query(locator)
            .await?
            .first()
            .map(|p| p.enabled)
            .unwrap_or(false))
    }

    async fn scroll_into_view(&self, locator: &Locator) -> Result<(), DriverError> {
        self.eval_action(locator, js::scroll_into_view_body())
            .await?;
        Ok(())
    }

    async fn dismiss_overlays(&self) -> Result<(), DriverError> {
        self.press("Escape").await?;
        let acted = self.eval(js::dismiss_overlays_script()).await?;
        debug!(
            target: "pacts::driver",
            acted = acted.get("acted").and_then(serde_json::Value::as_u64).unwrap_or(0),
            "overlay dismissal pass"
        );
        Ok(())
    }

    async fn wait_for_dom_idle(&self, timeout_ms: u64) -> Result<(), DriverError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut previous: Option<(String, u64)> = None;
        loop {
            let sample = self.eval(js::dom_sample_script()).await?;
            let ready = sample
                .get("ready")
                .and_then(Value::as_str)
                .unwrap_or("loading")
                .to_string();
            let nodes = sample.get("nodes").and_then(Value::as_u64).unwrap_or(0);
            let settled = ready != "loading"
                && previous
                    .as_ref()
                    .map(|(r, n)| *r == ready && *n == nodes)
                    .unwrap_or(false);
            if settled {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout("dom idle".into()));
            }
            previous = Some((ready, nodes));
            sleep(Duration::from_millis(DOM_SAMPLE_MS)).await;
        }
    }

    async fn wait_for_network_idle(&self, timeout_ms: u64) -> Result<(), DriverError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut previous: Option<u64> = None;
        loop {
            let count = self
                .eval(js::network_sample_script())
                .await?
                .as_u64()
                .unwrap_or(0);
            if previous == Some(count) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout("network idle".into()));
            }
            previous = Some(count);
            sleep(Duration::from_millis(NETWORK_SAMPLE_MS)).await;
        }
    }

    async fn bring_to_front(&self) -> Result<(), DriverError> {
        self.page_command("Page.bringToFront", json!({})).await?;
        Ok(())
    }

    async fn storage_state_save(&self, path: &Path) -> Result<(), DriverError> {
        let cookies = self
            .page_command("Network.getCookies", json!({}))
            .await?
            .get("cookies")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));

        let dump = self.eval(js::storage_dump_script()).await?;
        let origin = dump
            .get("origin")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let pairs = |key: &str| -> Vec<(String, String)> {
            dump.get(key)
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|pair| {
                            let kv = pair.as_array()?;
                            Some((kv.first()?.as_str()?.to_string(), kv.get(1)?.as_str()?.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let state = StorageState {
            cookies,
            origins: vec![OriginStorage {
                origin,
                local_storage: pairs("local"),
                session_storage: pairs("session"),
            }],
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(&state)
            .map_err(|err| DriverError::Internal(err.to_string()))?;
        std::fs::write(path, payload)?;
        Ok(())
    }

    async fn storage_state_load(&self, path: &Path) -> Result<(), DriverError> {
        let raw = std::fs::read_to_string(path)?;
        let state: StorageState =
            serde_json::from_str(&raw).map_err(|err| DriverError::Internal(err.to_string()))?;

        if state.cookies.as_array().map(|c| !c.is_empty()).unwrap_or(false) {
            self.page_command("Network.setCookies", json!({ "cookies": state.cookies }))
                .await?;
        }

        // Web storage can only be restored once the page is on the right
        // origin; mismatched origins are skipped, not errors.
        let current = self.current_url().await.unwrap_or_default();
        for origin in &state.origins {
            if !origin.origin.is_empty() && current.starts_with(&origin.origin) {
                let local = serde_json::to_string(&origin.local_storage)
                    .map_err(|err| DriverError::Internal(err.to_string()))?;
                let session = serde_json::to_string(&origin.session_storage)
                    .map_err(|err| DriverError::Internal(err.to_string()))?;
                self.eval(&js::storage_restore_script(&local, &session))
                    .await?;
            }
        }
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let response = self
            .page_command("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = response
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Internal("missing screenshot payload".into()))?;
        BASE64
            .decode(data)
            .map_err(|err| DriverError::Internal(err.to_string()))
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        self.eval(script).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_specs_cover_the_common_keys() {
        let (key, _, vk, text) = key_spec("Enter");
        assert_eq!(key, "Enter");
        assert_eq!(vk, 13);
        assert_eq!(text.as_deref(), Some("\r"));

        let (_, _, vk, text) = key_spec("Escape");
        assert_eq!(vk, 27);
        assert!(text.is_none());

        let (key, _, _, text) = key_spec("/");
        assert_eq!(key, "/");
        assert_eq!(text.as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn unstarted_driver_reports_not_started() {
        let driver = CdpDriver::with_transport(DriverConfig::default(), Arc::new(NoopTransport));
        let err = driver.current_url().await.unwrap_err();
        assert!(matches!(err, DriverError::NotStarted));
    }
}

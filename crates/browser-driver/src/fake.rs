//! In-memory page model implementing `BrowserDriver`.
//!
//! Test suites script a page out of `FakeElement`s (attributes,
//! visibility, enablement, oscillating bounding boxes, reveal effects)
//! and drive the real engine against it. Locator chains are interpreted
//! natively over the restricted selector subset discovery emits.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::driver::{BoundingBox, BrowserDriver, ElementProbe};
use crate::errors::DriverError;
use crate::locator::{parse_css_parts, Locator, Segment};

/// One scripted element.
#[derive(Clone, Debug)]
pub struct FakeElement {
    /// Stable handle used by scripting effects and assertions.
    pub key: String,
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attrs: HashMap<String, String>,
    pub text: String,
    pub value: String,
    pub checked: bool,
    pub visible: bool,
    pub covered: bool,
    pub enabled: bool,
    pub read_only: bool,
    pub bbox: BoundingBox,
    pub in_tab: bool,
    /// Key of the containing element, when containment matters.
    pub parent: Option<String>,
    /// Bbox x drifts by this amplitude on alternating samples.
    pub oscillation: f64,
    /// Clicking this element makes the referenced element visible.
    pub reveals: Option<String>,
    /// Becomes visible when overlays are dismissed.
    pub revealed_by_overlay_dismiss: bool,
}

impl FakeElement {
    pub fn new(key: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tag: tag.into(),
            id: None,
            classes: Vec::new(),
            attrs: HashMap::new(),
            text: String::new(),
            value: String::new(),
            checked: false,
            visible: true,
            covered: false,
            enabled: true,
            read_only: false,
            bbox: BoundingBox {
                x: 10.0,
                y: 10.0,
                width: 120.0,
                height: 32.0,
            },
            in_tab: false,
            parent: None,
            oscillation: 0.0,
            reveals: None,
            revealed_by_overlay_dismiss: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_aria_label(self, label: impl Into<String>) -> Self {
        self.with_attr("aria-label", label)
    }

    pub fn with_role(self, role: impl Into<String>) -> Self {
        self.with_attr("role", role)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn covered(mut self) -> Self {
        self.covered = true;
        self
    }

    pub fn inside_tab(mut self) -> Self {
        self.in_tab = true;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_bbox(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.bbox = BoundingBox {
            x,
            y,
            width,
            height,
        };
        self
    }

    pub fn oscillating(mut self, amplitude: f64) -> Self {
        self.oscillation = amplitude;
        self
    }

    pub fn reveals_on_click(mut self, target_key: impl Into<String>) -> Self {
        self.reveals = Some(target_key.into());
        self
    }

    pub fn revealed_by_overlay_dismiss(mut self) -> Self {
        self.revealed_by_overlay_dismiss = true;
        self
    }

    fn role(&self) -> Option<String> {
        if let Some(role) = self.attrs.get("role") {
            return Some(role.clone());
        }
        let input_type = self.attrs.get("type").map(String::as_str);
        match (self.tag.as_str(), input_type) {
            ("button", _) => Some("button".into()),
            ("a", _) if self.attrs.contains_key("href") => Some("link".into()),
            ("select", _) => Some("combobox".into()),
            ("textarea", _) => Some("textbox".into()),
            ("input", Some("search")) => Some("searchbox".into()),
            ("input", Some("checkbox")) => Some("checkbox".into()),
            ("input", Some("radio")) => Some("radio".into()),
            ("input", Some("button" | "submit")) => Some("button".into()),
            ("input", _) => Some("textbox".into()),
            _ => None,
        }
    }

    fn accessible_name(&self) -> String {
        for attr in ["aria-label", "placeholder", "title"] {
            if let Some(value) = self.attrs.get(attr) {
                if !value.is_empty() {
                    return value.clone();
                }
            }
        }
        self.text.clone()
    }

    fn attr_lookup(&self, name: &str) -> Option<String> {
        match name {
            "id" => self.id.clone(),
            "class" => (!self.classes.is_empty()).then(|| self.classes.join(" ")),
            other => self.attrs.get(other).cloned(),
        }
    }
}

#[derive(Default)]
struct FakePage {
    url: String,
    elements: Vec<FakeElement>,
    sample_counter: u64,
    action_log: Vec<String>,
    focused: Option<String>,
    /// `(key, url)`: pressing the key navigates.
    navigate_on_press: Option<(String, String)>,
    /// Canned responses for `evaluate`, matched by script substring.
    eval_results: Vec<(String, Value)>,
    started: bool,
}

/// Scriptable driver for engine tests.
pub struct FakeDriver {
    page: Mutex<FakePage>,
}

impl FakeDriver {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            page: Mutex::new(FakePage {
                url: url.into(),
                ..FakePage::default()
            }),
        })
    }

    pub fn add_element(&self, element: FakeElement) {
        self.page.lock().elements.push(element);
    }

    pub fn set_navigate_on_press(&self, key: impl Into<String>, url: impl Into<String>) {
        self.page.lock().navigate_on_press = Some((key.into(), url.into()));
    }

    pub fn set_eval_result(&self, script_contains: impl Into<String>, value: Value) {
        self.page
            .lock()
            .eval_results
            .push((script_contains.into(), value));
    }

    /// Snapshot of the action log for assertions.
    pub fn action_log(&self) -> Vec<String> {
        self.page.lock().action_log.clone()
    }

    pub fn is_started(&self) -> bool {
        self.page.lock().started
    }

    /// Key of the element holding focus, when any.
    pub fn focused_key(&self) -> Option<String> {
        self.page.lock().focused.clone()
    }

    pub fn element_value(&self, key: &str) -> Option<String> {
        self.page
            .lock()
            .elements
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.clone())
    }

    pub fn element_checked(&self, key: &str) -> Option<bool> {
        self.page
            .lock()
            .elements
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.checked)
    }

    pub fn element_visible(&self, key: &str) -> Option<bool> {
        self.page
            .lock()
            .elements
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.visible)
    }

    fn log(&self, entry: String) {
        self.page.lock().action_log.push(entry);
    }

    /// Resolve a locator chain to element indices, scoping each segment
    /// under the previous segment's matches.
    fn resolve(&self, page: &FakePage, locator: &Locator) -> Vec<usize> {
        let mut current: Option<Vec<usize>> = None;
        for segment in &locator.segments {
            match segment {
                Segment::Nth { index } => {
                    let set = current.take().unwrap_or_default();
                    current = Some(set.into_iter().skip(*index).take(1).collect());
                }
                other => {
                    let scope: Option<&[usize]> = current.as_deref();
                    let mut next = Vec::new();
                    for (idx, element) in page.elements.iter().enumerate() {
                        if !segment_matches(other, element) {
                            continue;
                        }
                        if let Some(scope) = scope {
                            if !scope
                                .iter()
                                .any(|&root| is_descendant(page, idx, root))
                            {
                                continue;
                            }
                        }
                        next.push(idx);
                    }
                    current = Some(next);
                }
            }
        }
        current.unwrap_or_default()
    }

    fn probe_at(&self, page: &mut FakePage, idx: usize) -> ElementProbe {
        page.sample_counter += 1;
        let oscillate = page.sample_counter % 2 == 1;
        let element = &page.elements[idx];
        let mut bbox = element.bbox;
        if oscillate {
            bbox.x += element.oscillation;
        }
        ElementProbe {
            tag: element.tag.clone(),
            bbox,
            visible: element.visible,
            covered: element.covered,
            enabled: element.enabled,
            read_only: element.read_only,
            name: element.accessible_name(),
            in_tab: element.in_tab,
            id: element.id.clone(),
        }
    }

    fn first_match(&self, locator: &Locator) -> Result<usize, DriverError> {
        let page = self.page.lock();
        let matches = self.resolve(&page, locator);
        matches.first().copied().ok_or_else(|| {
            DriverError::Timeout(format!("no element matched locator '{locator}'"))
        })
    }
}

fn is_descendant(page: &FakePage, child: usize, ancestor: usize) -> bool {
    if child == ancestor {
        return true;
    }
    let ancestor_key = &page.elements[ancestor].key;
    let mut cursor = page.elements[child].parent.clone();
    while let Some(key) = cursor {
        if &key == ancestor_key {
            return true;
        }
        cursor = page
            .elements
            .iter()
            .find(|e| e.key == key)
            .and_then(|e| e.parent.clone());
    }
    false
}

fn segment_matches(segment: &Segment, element: &FakeElement) -> bool {
    match segment {
        Segment::Nth { .. } => false,
        Segment::Role { role, name } => {
            let Some(actual) = element.role() else {
                return false;
            };
            if &actual != role {
                return false;
            }
            name.as_ref()
                .map(|pattern| pattern.matches(&element.accessible_name()))
                .unwrap_or(true)
        }
        Segment::Css { selector, has_text } => {
            let Some(parts) = parse_css_parts(selector) else {
                return false;
            };
            if let Some(tag) = &parts.tag {
                if &element.tag != tag {
                    return false;
                }
            }
            if let Some(id) = &parts.id {
                if element.id.as_deref() != Some(id.as_str()) {
                    return false;
                }
            }
            for class in &parts.classes {
                if !element.classes.contains(class) {
                    return false;
                }
            }
            for attr in &parts.attrs {
                if !attr.matches(element.attr_lookup(&attr.name).as_deref()) {
                    return false;
                }
            }
            if let Some(text) = has_text {
                if !element
                    .text
                    .to_lowercase()
                    .contains(&text.to_lowercase())
                {
                    return false;
                }
            }
            true
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn start(&self) -> Result<(), DriverError> {
        self.page.lock().started = true;
        self.log("start".into());
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.page.lock().started = false;
        self.log("stop".into());
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.page.lock().url = url.to_string();
        self.log(format!("goto {url}"));
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.page.lock().url.clone())
    }

    async fn query(&self, locator: &Locator) -> Result<Vec<ElementProbe>, DriverError> {
        let mut page = self.page.lock();
        let matches = self.resolve(&page, locator);
        Ok(matches
            .into_iter()
            .map(|idx| self.probe_at(&mut page, idx))
            .collect())
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        let idx = self.first_match(locator)?;
        let mut page = self.page.lock();
        let (reveals, is_checkbox) = {
            let element = &page.elements[idx];
            (
                element.reveals.clone(),
                element.attrs.get("type").map(String::as_str) == Some("checkbox"),
            )
        };
        if is_checkbox {
            let element = &mut page.elements[idx];
            element.checked = !element.checked;
        }
        if let Some(target) = reveals {
            if let Some(revealed) = page.elements.iter_mut().find(|e| e.key == target) {
                revealed.visible = true;
            }
        }
        page.action_log.push(format!("click {locator}"));
        Ok(())
    }

    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        let idx = self.first_match(locator)?;
        let mut page = self.page.lock();
        let key = page.elements[idx].key.clone();
        page.elements[idx].value = value.to_string();
        page.focused = Some(key);
        page.action_log.push(format!("fill {locator} = {value}"));
        Ok(())
    }

    async fn type_text(
        &self,
        locator: &Locator,
        value: &str,
        _per_char_delay_ms: u64,
    ) -> Result<(), DriverError> {
        let idx = self.first_match(locator)?;
        let mut page = self.page.lock();
        let key = page.elements[idx].key.clone();
        page.elements[idx].value.push_str(value);
        page.focused = Some(key);
        page.action_log.push(format!("type {locator} = {value}"));
        Ok(())
    }

    async fn press(&self, key: &str) -> Result<(), DriverError> {
        let mut page = self.page.lock();
        if let Some((trigger, url)) = page.navigate_on_press.clone() {
            if trigger == key {
                page.url = url;
            }
        }
        page.action_log.push(format!("press {key}"));
        Ok(())
    }

    async fn select_option(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        let idx = self.first_match(locator)?;
        let mut page = self.page.lock();
        if let Some(options) = page.elements[idx].attrs.get("options").cloned() {
            if !options.split(',').any(|o| o.trim() == value) {
                return Err(DriverError::Timeout(format!(
                    "option '{value}' not present under locator '{locator}'"
                )));
            }
        }
        page.elements[idx].value = value.to_string();
        page.action_log.push(format!("select {locator} = {value}"));
        Ok(())
    }

    async fn set_checked(&self, locator: &Locator, checked: bool) -> Result<(), DriverError> {
        let idx = self.first_match(locator)?;
        let mut page = self.page.lock();
        let current = page.elements[idx].checked;
        if current != checked {
            page.elements[idx].checked = checked;
            page.action_log.push(format!("set_checked {locator} = {checked}"));
        } else {
            page.action_log.push(format!("set_checked_noop {locator}"));
        }
        Ok(())
    }

    async fn hover(&self, locator: &Locator) -> Result<(), DriverError> {
        self.first_match(locator)?;
        self.log(format!("hover {locator}"));
        Ok(())
    }

    async fn focus(&self, locator: &Locator) -> Result<(), DriverError> {
        let idx = self.first_match(locator)?;
        let mut page = self.page.lock();
        let key = page.elements[idx].key.clone();
        page.focused = Some(key);
        page.action_log.push(format!("focus {locator}"));
        Ok(())
    }

    async fn attribute(
        &self,
        locator: &Locator,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        let idx = self.first_match(locator)?;
        let page = self.page.lock();
        Ok(page.elements[idx].attr_lookup(name))
    }

    async fn accessible_name(&self, locator: &Locator) -> Result<Option<String>, DriverError> {
        let idx = self.first_match(locator)?;
        let page = self.page.lock();
        Ok(Some(page.elements[idx].accessible_name()))
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
        self.log(format!("scroll_into_view {locator}"));
        Ok(())
    }

    async fn dismiss_overlays(&self) -> Result<(), DriverError> {
        let mut page = self.page.lock();
        for element in page.elements.iter_mut() {
            element.covered = false;
            if element.revealed_by_overlay_dismiss {
                element.visible = true;
            }
        }
        page.action_log.push("dismiss_overlays".into());
        Ok(())
    }

    async fn wait_for_dom_idle(&self, _timeout_ms: u64) -> Result<(), DriverError> {
        self.log("wait_for_dom_idle".into());
        Ok(())
    }

    async fn wait_for_network_idle(&self, _timeout_ms: u64) -> Result<(), DriverError> {
        self.log("wait_for_network_idle".into());
        Ok(())
    }

    async fn bring_to_front(&self) -> Result<(), DriverError> {
        self.log("bring_to_front".into());
        Ok(())
    }

    async fn storage_state_save(&self, path: &Path) -> Result<(), DriverError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = json!({ "cookies": [], "origins": [] });
        std::fs::write(path, serde_json::to_string_pretty(&state).unwrap_or_default())?;
        self.log(format!("storage_state_save {}", path.display()));
        Ok(())
    }

    async fn storage_state_load(&self, path: &Path) -> Result<(), DriverError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str::<Value>(&raw)
            .map_err(|err| DriverError::Internal(err.to_string()))?;
        self.log(format!("storage_state_load {}", path.display()));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.log("screenshot".into());
        // PNG signature followed by a marker payload.
        Ok(vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a])
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        let page = self.page.lock();
        for (needle, value) in &page.eval_results {
            if script.contains(needle.as_str()) {
                return Ok(value.clone());
            }
        }
        Ok(Value::Null)
    }
}

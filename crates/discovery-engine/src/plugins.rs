//! App-specific discovery plug-ins, keyed by URL origin pattern.
//!
//! Plug-ins are the last tier before discovery gives up; they encode
//! site-specific interaction protocols the generic ladder cannot express.

use std::sync::Arc;

use async_trait::async_trait;
use browser_driver::{BrowserDriver, Locator, NamePattern};
use pacts_core_types::{Action, Candidate, Intent, Strategy};

use crate::DiscoveryError;

#[async_trait]
pub trait AppSpecificStrategy: Send + Sync {
    /// Substring the page origin must contain for this plug-in to run.
    fn origin_pattern(&self) -> &str;

    async fn discover(
        &self,
        driver: &Arc<dyn BrowserDriver>,
        intent: &Intent,
    ) -> Result<Option<Candidate>, DiscoveryError>;
}

/// Combobox protocol: bind the combobox by role, and annotate the
/// candidate so the executor drives it as click → type value → Enter,
/// verifying `aria-expanded` flips back to false.
pub struct ComboboxProtocol {
    origin_pattern: String,
}

impl ComboboxProtocol {
    pub fn new(origin_pattern: impl Into<String>) -> Self {
        Self {
            origin_pattern: origin_pattern.into(),
        }
    }
}

#[async_trait]
impl AppSpecificStrategy for ComboboxProtocol {
    fn origin_pattern(&self) -> &str {
        &self.origin_pattern
    }

    async fn discover(
        &self,
        driver: &Arc<dyn BrowserDriver>,
        intent: &Intent,
    ) -> Result<Option<Candidate>, DiscoveryError> {
        if !matches!(intent.action(), Action::Fill | Action::Select | Action::Type) {
            return Ok(None);
        }
        let locator = Locator::role("combobox", NamePattern::regex_ci(intent.label()));
        let probes = driver.query(&locator).await?;
        if probes.is_empty() {
            return Ok(None);
        }
        let candidate = Candidate::new(
            locator.to_string(),
            Strategy::AppSpecific,
            Strategy::AppSpecific.baseline_confidence(),
        )
        .with_meta("protocol", "combobox")
        .with_meta("verify_attribute", "aria-expanded")
        .with_meta("verify_value", "false");
        Ok(Some(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browser_driver::fake::{FakeDriver, FakeElement};
    use pacts_core_types::Step;

    #[tokio::test]
    async fn combobox_plugin_binds_by_role_and_name() {
        let driver = FakeDriver::new("https://crm.test/app");
        driver.add_element(
            FakeElement::new("assignee", "div")
                .with_role("combobox")
                .with_aria_label("Assignee"),
        );
        let plugin = ComboboxProtocol::new("crm.test");
        let driver: Arc<dyn BrowserDriver> = driver;
        let intent = Intent::new(Step::new("Assignee", Action::Select).with_value("Ada"));

        let candidate = plugin.discover(&driver, &intent).await.unwrap().unwrap();
        assert_eq!(candidate.strategy, Strategy::AppSpecific);
        assert_eq!(
            candidate.meta.get("protocol").and_then(|v| v.as_str()),
            Some("combobox")
        );

        let click_intent = Intent::new(Step::new("Assignee", Action::Click));
        assert!(plugin.discover(&driver, &click_intent).await.unwrap().is_none());
    }
}

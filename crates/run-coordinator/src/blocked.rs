//! Blocking-signal detection.
//!
//! Anti-bot challenge pages are platform-specific, so detection is a
//! plug-in: the default carries the well-known signatures and operators
//! extend the lists through configuration.

use std::sync::Arc;

use async_trait::async_trait;
use browser_driver::{BrowserDriver, Locator};
use tracing::debug;

#[async_trait]
pub trait BlockedDetector: Send + Sync {
    /// Returns the detected signature (URL fragment or DOM marker) when
    /// the page is a challenge the engine must not fight.
    async fn detect(&self, driver: &Arc<dyn BrowserDriver>) -> Option<String>;
}

pub struct DefaultBlockedDetector {
    url_fragments: Vec<String>,
    dom_selectors: Vec<String>,
}

impl DefaultBlockedDetector {
    pub fn new() -> Self {
        Self {
            url_fragments: vec!["chal_t=".into()],
            dom_selectors: vec![".g-recaptcha".into()],
        }
    }

    pub fn with_url_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.url_fragments.push(fragment.into());
        self
    }

    pub fn with_dom_selector(mut self, selector: impl Into<String>) -> Self {
        self.dom_selectors.push(selector.into());
        self
    }
}

impl Default for DefaultBlockedDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockedDetector for DefaultBlockedDetector {
    async fn detect(&self, driver: &Arc<dyn BrowserDriver>) -> Option<String> {
        let url = match driver.current_url().await {
            Ok(url) => url,
            Err(err) => {
                debug!(target: "pacts::router", %err, "url unavailable for blocked check");
                return None;
            }
        };
        for fragment in &self.url_fragments {
            if url.contains(fragment.as_str()) {
                return Some(format!("url:{fragment}"));
            }
        }
        for selector in &self.dom_selectors {
            let Ok(locator) = Locator::parse(selector) else {
                continue;
            };
            match driver.query(&locator).await {
                Ok(probes) if !probes.is_empty() => {
                    return Some(format!("dom:{selector}"));
                }
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browser_driver::fake::{FakeDriver, FakeElement};

    #[tokio::test]
    async fn detects_url_and_dom_signatures() {
        let driver = FakeDriver::new("https://shop.test/?chal_t=abc");
        let driver: Arc<dyn BrowserDriver> = driver;
        let detector = DefaultBlockedDetector::new();
        assert_eq!(detector.detect(&driver).await.as_deref(), Some("url:chal_t="));

        let captcha = FakeDriver::new("https://shop.test");
        captcha.add_element(FakeElement::new("captcha", "div").with_class("g-recaptcha"));
        let captcha: Arc<dyn BrowserDriver> = captcha;
        assert_eq!(
            detector.detect(&captcha).await.as_deref(),
            Some("dom:.g-recaptcha")
        );

        let clean = FakeDriver::new("https://shop.test");
        let clean: Arc<dyn BrowserDriver> = clean;
        assert_eq!(detector.detect(&clean).await, None);
    }
}

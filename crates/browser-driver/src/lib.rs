//! Browser driver: the thin capability surface the pacts engine drives a
//! real browser through.
//!
//! The wire protocol is raw CDP over a websocket connection; element
//! resolution ships a locator plan into the page and interprets it there,
//! so one round-trip answers everything the actionability gate asks.

mod cdp;
mod driver;
mod errors;
mod js;
mod locator;
mod transport;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use cdp::CdpDriver;
pub use driver::{
    BoundingBox, BrowserDriver, DriverConfig, ElementProbe, OriginStorage, StorageState,
};
pub use errors::DriverError;
pub use locator::{parse_css_parts, AttrMatch, AttrOp, CssParts, Locator, NamePattern, Segment};
pub use transport::{
    detect_browser_executable, CdpTransport, ChromiumTransport, CommandTarget, NoopTransport,
    WireEvent,
};

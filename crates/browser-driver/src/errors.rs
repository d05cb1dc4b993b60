//! Driver error taxonomy.
//!
//! The contract with the layers above: a driver call either succeeds or
//! fails with one of these; "element not actionable" is never an error
//! here, callers consult the gate for that.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum DriverError {
    /// A time bound was exceeded (action, navigation, wait).
    #[error("driver timeout: {0}")]
    Timeout(String),

    /// The CDP connection or the browser process failed.
    #[error("cdp transport failure: {0}")]
    Transport(String),

    /// Browser could not be launched or attached to.
    #[error("browser launch failed: {0}")]
    Launch(String),

    /// A page-side script raised.
    #[error("script exception: {0}")]
    Script(String),

    /// The driver was used before `start` or after `stop`.
    #[error("driver not started")]
    NotStarted,

    /// Selector string could not be parsed.
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    /// Filesystem i/o around storage state or screenshots.
    #[error("driver i/o failure: {0}")]
    Io(String),

    #[error("driver internal error: {0}")]
    Internal(String),
}

impl DriverError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout(_))
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io(err.to_string())
    }
}

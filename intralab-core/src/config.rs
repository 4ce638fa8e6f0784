//! Shared validation error for the typed component configurations.

use thiserror::Error;

/// A configuration value rejected by a component's `validate()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid [{section}] config: {reason}")]
pub struct ConfigError {
    pub section: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(section: &'static str, reason: impl Into<String>) -> Self {
        Self {
            section,
            reason: reason.into(),
        }
    }
}

/// Fail with `reason` unless `ok` holds.
pub(crate) fn ensure(ok: bool, section: &'static str, reason: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::new(section, reason))
    }
}

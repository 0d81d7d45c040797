//! Cache configuration.

use crate::entries::KeyRules;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by every cache tier.
///
/// # Example
/// ```rust
/// use metacache_core::CacheConfig;
/// use std::time::Duration;
///
/// let config = CacheConfig::default()
///     .with_case_sensitive(false)
///     .with_query_timeout(Duration::from_secs(10));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether object keys are compared case-sensitively
    pub case_sensitive: bool,
    /// Maximum time a query may run, from execution to its last row
    pub query_timeout: Option<Duration>,
    /// Keep existing `Arc`s for objects that reappear in a bulk reload
    pub preserve_identity_on_reload: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            query_timeout: Some(Duration::from_secs(30)),
            preserve_identity_on_reload: true,
        }
    }
}

impl CacheConfig {
    /// Validates configuration parameters.
    ///
    /// # Errors
    /// Returns error if the query timeout is zero
    pub fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.query_timeout
            && timeout.is_zero()
        {
            return Err(CacheError::configuration(
                "query_timeout must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Builder method to set key case sensitivity.
    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Builder method to set the query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Builder method to disable the query timeout.
    pub fn without_query_timeout(mut self) -> Self {
        self.query_timeout = None;
        self
    }

    /// Builder method to control identity preservation on bulk reloads.
    pub fn with_preserve_identity(mut self, preserve: bool) -> Self {
        self.preserve_identity_on_reload = preserve;
        self
    }

    pub(crate) fn key_rules(&self) -> KeyRules {
        KeyRules::new(self.case_sensitive)
    }
}

//! Per-environment configuration.

use serde::{Deserialize, Serialize};

/// Configuration for an [`Environment`](crate::Environment).
///
/// Hosts usually build this with `Default` and override a field or two, or
/// load it from JSON next to their other runtime limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Diagnostic label used in logs
    pub name: String,

    /// Maximum bytes of native state the environment may hold (0 = unlimited)
    pub max_external_memory: usize,

    /// Report panicking cleanup hooks as failures instead of unwinding through teardown.
    ///
    /// When false, a panicking hook unwinds out of `teardown()` and leaves the
    /// environment `ShuttingDown` with its objects still tracked. The next
    /// `teardown()` call, or dropping the environment, resumes with the
    /// remaining hooks.
    pub catch_hook_panics: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_external_memory: 0,
            catch_hook_panics: true,
        }
    }
}

impl EnvironmentConfig {
    /// Config with a name and all other fields defaulted.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the external memory limit in megabytes.
    pub fn with_memory_limit_mb(mut self, mb: usize) -> Self {
        self.max_external_memory = mb * 1024 * 1024;
        self
    }

    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

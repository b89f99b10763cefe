//! Registry and reconnect tuning.

use serde::{Deserialize, Serialize};

/// Live-connection registry limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    /// Maximum engine calls in flight during connect-all / disconnect-all /
    /// restart-unhealthy fan-out.
    pub max_concurrent: usize,
    /// Deadline for each engine call made by a fan-out.
    pub operation_timeout_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            operation_timeout_ms: 30_000,
        }
    }
}

/// Startup auto-reconnect sweep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Run the sweep when the process starts.
    pub on_startup: bool,
    /// Maximum reconnect attempts in flight.
    pub max_concurrent: usize,
    /// Per-session attempt deadline.
    pub attempt_timeout_ms: u64,
    /// Row limit for each eligibility query.
    pub page_size: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            on_startup: true,
            max_concurrent: 5,
            attempt_timeout_ms: 30_000,
            page_size: 1000,
        }
    }
}

//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`, so
//! a partial JSON file only needs the keys it overrides.

mod logging;
mod runtime;

pub use logging::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "database": { "path": "/var/lib/switchboard/sessions.db" },
///   "reconnect": { "maxConcurrent": 10 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchboardSettings {
    pub database: DatabaseSettings,
    pub registry: RegistrySettings,
    pub reconnect: ReconnectSettings,
    pub logging: LoggingSettings,
}

impl SwitchboardSettings {
    /// Reject values that would make the runtime unusable.
    pub fn validate(&self) -> crate::Result<()> {
        let checks = [
            (self.registry.max_concurrent == 0, "registry.maxConcurrent", "must be at least 1"),
            (self.registry.operation_timeout_ms == 0, "registry.operationTimeoutMs", "must be positive"),
            (self.reconnect.max_concurrent == 0, "reconnect.maxConcurrent", "must be at least 1"),
            (self.reconnect.attempt_timeout_ms == 0, "reconnect.attemptTimeoutMs", "must be positive"),
            (self.reconnect.page_size == 0, "reconnect.pageSize", "must be at least 1"),
            (self.database.path.trim().is_empty(), "database.path", "must not be empty"),
        ];
        match checks.iter().find(|(failed, _, _)| *failed) {
            Some(&(_, key, reason)) => Err(crate::SettingsError::InvalidValue { key, reason }),
            None => Ok(()),
        }
    }
}

/// `~/.switchboard`, falling back to `/tmp` when HOME is unset.
pub fn switchboard_home() -> std::path::PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    std::path::PathBuf::from(home).join(".switchboard")
}

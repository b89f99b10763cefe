//! Layering: compiled defaults, then the JSON file merged over them, then
//! `SWITCHBOARD_*` environment variables. The result is validated once at
//! the end, so a bad value from any layer is caught.

use std::fmt::Display;
use std::io::ErrorKind;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{switchboard_home, SwitchboardSettings};

const CONCURRENCY: RangeInclusive<usize> = 1..=1_000;
const TIMEOUT_MS: RangeInclusive<u64> = 100..=3_600_000;

/// `~/.switchboard/settings.json`
pub fn settings_path() -> PathBuf {
    switchboard_home().join("settings.json")
}

pub fn load_settings() -> Result<SwitchboardSettings> {
    load_settings_from_path(&settings_path())
}

/// A missing file yields defaults (still subject to env overrides);
/// unreadable or malformed files and out-of-range values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<SwitchboardSettings> {
    load_with(path, |name| std::env::var(name).ok())
}

fn load_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<SwitchboardSettings> {
    let mut doc = serde_json::to_value(SwitchboardSettings::default())?;
    if let Some(file) = read_file(path)? {
        merge_into(&mut doc, file);
    }

    let mut settings: SwitchboardSettings = serde_json::from_value(doc)?;
    Env(env).apply(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_file(path: &Path) -> Result<Option<Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(None);
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    debug!(path = %path.display(), "read settings file");
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Overlay `patch` onto `base`. Objects merge key by key; any other value
/// replaces what was there. `null` leaves the base untouched, so a file can
/// spell out a key without overriding its default.
pub fn merge_into(base: &mut Value, patch: Value) {
    match (base, patch) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None if !value.is_null() => {
                        base.insert(key, value);
                    }
                    None => {}
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// `true`/`yes`/`on`/`1` and their negatives, any case.
fn parse_flag(raw: &str) -> Option<bool> {
    const YES: [&str; 4] = ["true", "yes", "on", "1"];
    const NO: [&str; 4] = ["false", "no", "off", "0"];
    let raw = raw.trim();
    if YES.iter().any(|y| raw.eq_ignore_ascii_case(y)) {
        Some(true)
    } else if NO.iter().any(|n| raw.eq_ignore_ascii_case(n)) {
        Some(false)
    } else {
        None
    }
}

fn parse_within<T>(raw: &str, range: &RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|n| range.contains(n))
}

/// Environment lookup. Unusable values are logged and skipped, leaving the
/// file or default value in place.
struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn text(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn flag(&self, name: &str) -> Option<bool> {
        let raw = self.text(name)?;
        let parsed = parse_flag(&raw);
        if parsed.is_none() {
            warn!(var = name, value = %raw, "ignoring non-boolean environment override");
        }
        parsed
    }

    fn number<T>(&self, name: &str, range: RangeInclusive<T>) -> Option<T>
    where
        T: FromStr + PartialOrd + Display,
    {
        let raw = self.text(name)?;
        let parsed = parse_within(&raw, &range);
        if parsed.is_none() {
            warn!(
                var = name,
                value = %raw,
                min = %range.start(),
                max = %range.end(),
                "ignoring out-of-range environment override"
            );
        }
        parsed
    }

    fn apply(&self, s: &mut SwitchboardSettings) {
        if let Some(v) = self.text("SWITCHBOARD_DB_PATH") {
            s.database.path = v;
        }
        if let Some(v) = self.number("SWITCHBOARD_MAX_CONCURRENT", CONCURRENCY) {
            s.registry.max_concurrent = v;
        }
        if let Some(v) = self.number("SWITCHBOARD_OPERATION_TIMEOUT_MS", TIMEOUT_MS) {
            s.registry.operation_timeout_ms = v;
        }
        if let Some(v) = self.flag("SWITCHBOARD_RECONNECT_ON_STARTUP") {
            s.reconnect.on_startup = v;
        }
        if let Some(v) = self.number("SWITCHBOARD_RECONNECT_MAX_CONCURRENT", CONCURRENCY) {
            s.reconnect.max_concurrent = v;
        }
        if let Some(v) = self.number("SWITCHBOARD_RECONNECT_TIMEOUT_MS", TIMEOUT_MS) {
            s.reconnect.attempt_timeout_ms = v;
        }
        if let Some(v) = self.text("SWITCHBOARD_LOG_LEVEL") {
            s.logging.level = v;
        }
        if let Some(v) = self.flag("SWITCHBOARD_LOG_JSON") {
            s.logging.json = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct TempFile {
        dir: tempfile::TempDir,
        path: PathBuf,
    }

    impl TempFile {
        fn with(contents: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("settings.json");
            std::fs::write(&path, contents).unwrap();
            Self { dir, path }
        }
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn merge_recurses_into_objects() {
        let mut base = json!({"registry": {"maxConcurrent": 5, "operationTimeoutMs": 30000}, "x": 1});
        merge_into(&mut base, json!({"registry": {"maxConcurrent": 9}}));
        assert_eq!(
            base,
            json!({"registry": {"maxConcurrent": 9, "operationTimeoutMs": 30000}, "x": 1})
        );
    }

    #[test]
    fn merge_nulls_keep_base_and_arrays_replace() {
        let mut base = json!({"level": "info", "tags": ["a", "b"]});
        merge_into(&mut base, json!({"level": null, "tags": ["z"], "extra": null}));
        assert_eq!(base, json!({"level": "info", "tags": ["z"]}));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(load_with(&path, env_of(&[])).unwrap(), SwitchboardSettings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let file = TempFile::with(
            r#"{"database": {"path": "/data/s.db"}, "reconnect": {"onStartup": false}}"#,
        );
        let settings = load_with(&file.path, env_of(&[])).unwrap();
        assert_eq!(settings.database.path, "/data/s.db");
        assert!(!settings.reconnect.on_startup);
        assert_eq!(settings.reconnect.max_concurrent, 5);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let file = TempFile::with("{not json");
        assert!(matches!(
            load_with(&file.path, env_of(&[])),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn wrong_type_is_a_shape_error() {
        let file = TempFile::with(r#"{"registry": {"maxConcurrent": "lots"}}"#);
        assert!(matches!(
            load_with(&file.path, env_of(&[])),
            Err(SettingsError::Shape(_))
        ));
    }

    #[test]
    fn directory_in_place_of_file_is_a_read_error() {
        let file = TempFile::with("{}");
        assert!(matches!(
            load_with(file.dir.path(), env_of(&[])),
            Err(SettingsError::Read { .. })
        ));
    }

    #[test]
    fn zero_from_file_fails_validation() {
        let file = TempFile::with(r#"{"registry": {"maxConcurrent": 0}}"#);
        assert!(matches!(
            load_with(&file.path, env_of(&[])),
            Err(SettingsError::InvalidValue { key: "registry.maxConcurrent", .. })
        ));
    }

    #[test]
    fn env_wins_over_file() {
        let file = TempFile::with(r#"{"reconnect": {"maxConcurrent": 2}}"#);
        let env = env_of(&[
            ("SWITCHBOARD_RECONNECT_MAX_CONCURRENT", "8"),
            ("SWITCHBOARD_RECONNECT_TIMEOUT_MS", " 1500 "),
            ("SWITCHBOARD_RECONNECT_ON_STARTUP", "OFF"),
            ("SWITCHBOARD_DB_PATH", "/env/s.db"),
            ("SWITCHBOARD_LOG_JSON", "yes"),
            ("SWITCHBOARD_LOG_LEVEL", "debug"),
        ]);
        let settings = load_with(&file.path, env).unwrap();
        assert_eq!(settings.reconnect.max_concurrent, 8);
        assert_eq!(settings.reconnect.attempt_timeout_ms, 1500);
        assert!(!settings.reconnect.on_startup);
        assert_eq!(settings.database.path, "/env/s.db");
        assert!(settings.logging.json);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn unusable_env_values_are_skipped() {
        let mut settings = SwitchboardSettings::default();
        Env(env_of(&[
            ("SWITCHBOARD_MAX_CONCURRENT", "0"),
            ("SWITCHBOARD_OPERATION_TIMEOUT_MS", "soon"),
            ("SWITCHBOARD_RECONNECT_TIMEOUT_MS", "50"),
            ("SWITCHBOARD_RECONNECT_ON_STARTUP", "maybe"),
            ("SWITCHBOARD_DB_PATH", "  "),
        ]))
        .apply(&mut settings);
        assert_eq!(settings, SwitchboardSettings::default());
    }

    #[test]
    fn flag_spellings() {
        for raw in ["true", "1", "yes", "on", "TRUE", "On"] {
            assert_eq!(parse_flag(raw), Some(true), "{raw}");
        }
        for raw in ["false", "0", "no", "off", "FALSE"] {
            assert_eq!(parse_flag(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_flag("2"), None);
    }

    #[test]
    fn numbers_respect_bounds() {
        assert_eq!(parse_within("30000", &TIMEOUT_MS), Some(30_000));
        assert_eq!(parse_within("50", &TIMEOUT_MS), None);
        assert_eq!(parse_within("1000", &CONCURRENCY), Some(1000));
        assert_eq!(parse_within("0", &CONCURRENCY), None);
        assert_eq!(parse_within("-1", &CONCURRENCY), None);
    }
}

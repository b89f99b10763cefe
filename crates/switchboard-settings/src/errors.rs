use std::path::PathBuf;

/// Why a settings load was rejected. Missing files are not errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Merged document did not fit [`crate::SwitchboardSettings`], e.g. a
    /// string where a number belongs.
    #[error("settings have the wrong shape: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("invalid setting {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_file() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/switchboard/settings.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/etc/switchboard/settings.json"), "{msg}");
        assert!(msg.contains("denied"), "{msg}");
    }

    #[test]
    fn shape_error_converts_from_serde() {
        let bad = serde_json::from_str::<u32>("\"five\"").unwrap_err();
        let err: SettingsError = bad.into();
        assert!(matches!(err, SettingsError::Shape(_)));
    }

    #[test]
    fn invalid_value_display() {
        let err = SettingsError::InvalidValue {
            key: "registry.maxConcurrent",
            reason: "must be at least 1",
        };
        assert_eq!(err.to_string(), "invalid setting registry.maxConcurrent: must be at least 1");
    }
}

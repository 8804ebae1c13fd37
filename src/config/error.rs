//! Error types for configuration and workflow loading

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while locating, reading or writing configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the user config directory")]
    NoConfigDir,

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("unknown setting '{key}'")]
    UnknownKey { key: String },

    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unsupported workflow format '{extension}' ({path})")]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("invalid workflow '{name}':\n  {}", .errors.join("\n  "))]
    InvalidWorkflow { name: String, errors: Vec<String> },
}

impl ConfigError {
    pub fn invalid_value(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_workflow_display_lists_errors() {
        let err = ConfigError::InvalidWorkflow {
            name: "reset".into(),
            errors: vec!["duplicate step name: a".into(), "bad ref".into()],
        };
        let display = err.to_string();
        assert!(display.contains("reset"));
        assert!(display.contains("duplicate step name: a"));
        assert!(display.contains("bad ref"));
    }

    #[test]
    fn test_invalid_value_display() {
        let err = ConfigError::invalid_value("ui.default_port", "abc", "expected a port number");
        assert_eq!(
            err.to_string(),
            "invalid value 'abc' for 'ui.default_port': expected a port number"
        );
    }
}

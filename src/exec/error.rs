//! Command execution errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("administrator privileges required to run: {command}")]
    ElevationRequired { command: String },

    #[error("invalid timeout {timeout}s for '{command}' (must be between 0 and one year)")]
    InvalidTimeout { command: String, timeout: f64 },

    #[error("command timed out after {timeout}s: {command}")]
    TimedOut { command: String, timeout: f64 },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("failed to collect output of '{command}': {message}")]
    Output { command: String, message: String },

    #[error("command cancelled: {command}")]
    Cancelled { command: String },
}

impl ExecError {
    /// Whether running the same command again could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TimedOut { .. } | Self::Spawn { .. } | Self::Output { .. }
        )
    }
}

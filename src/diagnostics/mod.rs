//! System diagnostics built on OS tool output
//!
//! Every probe runs through a [`CommandRunner`] and parses the text or JSON
//! the Windows tools print (`netstat`, `tasklist`, `ipconfig`, `ping`,
//! PowerShell `ConvertTo-Json`). Parsers are plain functions so they can be
//! tested against captured output.

pub mod hosts;
pub mod network;
pub mod ports;
pub mod processes;
pub mod services;

use crate::exec::{CommandResult, CommandRunner, CommandSpec, ExecError};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiagnosticError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("'{command}' failed with exit code {exit_code}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("could not parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("{0}")]
    InvalidInput(String),

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },
}

impl DiagnosticError {
    pub fn parse(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

/// Run a command and turn a non-zero exit code into an error
pub(crate) async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<CommandResult, DiagnosticError> {
    let result = runner.run(spec).await?;
    if result.succeeded() {
        Ok(result)
    } else {
        Err(DiagnosticError::CommandFailed {
            command: result.command.clone(),
            exit_code: result.exit_code,
            output: result.display_output(),
        })
    }
}

/// PowerShell `ConvertTo-Json` emits a bare object for a single item
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// Parse PowerShell JSON output that may be empty, one object or an array
pub(crate) fn parse_ps_json<T>(text: &str, what: &str) -> Result<Vec<T>, DiagnosticError>
where
    T: for<'de> Deserialize<'de>,
{
    let text = text.trim_start_matches('\u{feff}').trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<OneOrMany<T>>(text) {
        Ok(OneOrMany::Many(items)) => Ok(items),
        Ok(OneOrMany::One(item)) => Ok(vec![item]),
        Err(e) => Err(DiagnosticError::parse(what, e)),
    }
}

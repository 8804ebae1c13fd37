//! Command specifications and argv construction

use super::error::ExecError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default command timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: f64 = 45.0;

/// Longest timeout a command may ask for (one year)
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0 * 365.0;

/// Whether `secs` is usable as a timeout
pub fn is_valid_timeout(secs: f64) -> bool {
    secs > 0.0 && secs <= MAX_TIMEOUT_SECS
}

/// How a command is launched
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Executor {
    /// Run argv directly, no shell
    #[default]
    Process,
    /// `pwsh` when available, else Windows PowerShell
    Powershell,
    /// `cmd.exe /C`
    Cmd,
    /// `sh -c` on Unix, `cmd.exe /C` on Windows
    Shell,
}

impl fmt::Display for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Process => "process",
            Self::Powershell => "powershell",
            Self::Cmd => "cmd",
            Self::Shell => "shell",
        };
        f.write_str(name)
    }
}

/// Command text, either one string or an explicit argv
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandLine {
    Text(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Argv(argv) => argv.iter().all(|a| a.is_empty()),
        }
    }

    /// Single string form; argv entries are quoted where needed
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Argv(argv) => join_args(argv),
        }
    }

    /// Argv form; text is split with Windows quoting rules
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Self::Text(text) => split_windows_args(text),
            Self::Argv(argv) => argv.clone(),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(argv: Vec<String>) -> Self {
        Self::Argv(argv)
    }
}

/// A command to run, as declared by tools and workflow steps
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    #[serde(default)]
    pub executor: Executor,

    pub command: CommandLine,

    /// Timeout in seconds; unset or non-positive means the runner default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Requires an elevated process
    #[serde(default)]
    pub elevate: bool,

    /// Extra environment merged over the inherited one
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Working directory (`~` and `$VAR` expanded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl CommandSpec {
    pub fn new(executor: Executor, command: impl Into<CommandLine>) -> Self {
        Self {
            executor,
            command: command.into(),
            timeout: None,
            elevate: false,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn process<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            Executor::Process,
            CommandLine::Argv(argv.into_iter().map(Into::into).collect()),
        )
    }

    pub fn powershell(script: impl Into<String>) -> Self {
        Self::new(Executor::Powershell, CommandLine::Text(script.into()))
    }

    #[cfg(test)]
    pub fn cmd(text: impl Into<String>) -> Self {
        Self::new(Executor::Cmd, CommandLine::Text(text.into()))
    }

    #[cfg(test)]
    pub fn shell(text: impl Into<String>) -> Self {
        Self::new(Executor::Shell, CommandLine::Text(text.into()))
    }

    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn elevated(mut self) -> Self {
        self.elevate = true;
        self
    }

    #[cfg(test)]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[cfg(test)]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Timeout the spec asks for itself; zero, negative and NaN count as unset
    pub fn explicit_timeout(&self) -> Option<f64> {
        self.timeout.filter(|t| *t > 0.0)
    }

    /// Effective timeout in seconds
    pub fn timeout_secs(&self) -> f64 {
        self.explicit_timeout().unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// Effective timeout, rejecting values beyond [`MAX_TIMEOUT_SECS`]
    pub fn timeout_duration(&self) -> Result<Duration, ExecError> {
        let secs = self.timeout_secs();
        let invalid = || ExecError::InvalidTimeout {
            command: self.format_for_logging(),
            timeout: secs,
        };
        if !is_valid_timeout(secs) {
            return Err(invalid());
        }
        Duration::try_from_secs_f64(secs).map_err(|_| invalid())
    }

    /// Expanded working directory, if any
    pub fn resolved_cwd(&self) -> Option<PathBuf> {
        self.cwd
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(crate::config::paths::expand_path)
    }

    /// Human readable command text for logs and results
    pub fn format_for_logging(&self) -> String {
        match self.executor {
            Executor::Process => self.command.as_text(),
            other => format!("[{}] {}", other, self.command.as_text()),
        }
    }
}

/// Build the argv actually spawned for a spec
pub fn build_argv(spec: &CommandSpec) -> Result<Vec<String>, ExecError> {
    if spec.command.is_empty() {
        return Err(ExecError::EmptyCommand);
    }

    let argv = match spec.executor {
        Executor::Process => spec.command.to_argv(),
        Executor::Powershell => vec![
            powershell_program(),
            "-NoLogo".into(),
            "-NoProfile".into(),
            "-NonInteractive".into(),
            "-Command".into(),
            spec.command.as_text(),
        ],
        Executor::Cmd => cmd_argv(spec.command.as_text()),
        Executor::Shell => {
            if cfg!(windows) {
                cmd_argv(spec.command.as_text())
            } else {
                vec!["sh".into(), "-c".into(), spec.command.as_text()]
            }
        }
    };

    match argv.first() {
        Some(program) if !program.is_empty() => Ok(argv),
        _ => Err(ExecError::EmptyCommand),
    }
}

fn cmd_argv(text: String) -> Vec<String> {
    vec!["cmd.exe".into(), "/C".into(), text]
}

/// `pwsh` if it is on PATH, otherwise Windows PowerShell
pub fn powershell_program() -> String {
    if find_executable("pwsh").is_some() {
        "pwsh".into()
    } else {
        "powershell".into()
    }
}

/// Locate an executable on PATH (honours PATHEXT on Windows)
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    let extensions: Vec<String> = if cfg!(windows) {
        std::env::var("PATHEXT")
            .unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".into())
            .split(';')
            .filter(|e| !e.is_empty())
            .map(|e| e.to_lowercase())
            .collect()
    } else {
        Vec::new()
    };

    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        for ext in &extensions {
            let candidate = dir.join(format!("{name}{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Split a command line the way Windows programs do: whitespace separates,
/// double quotes group and are removed
pub fn split_windows_args(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_token = false;

    for ch in text.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"') {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}

/// Join argv for display, quoting entries with whitespace
pub fn join_args(argv: &[String]) -> String {
    argv.iter()
        .map(|a| quote_arg(a))
        .collect::<Vec<_>>()
        .join(" ")
}

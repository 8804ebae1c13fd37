//! Workflow and step definitions
//!
//! Workflows are TOML (or JSON) files listing steps. Each step either references
//! a registered tool action (`action = "network.flush_dns"`) or carries an inline
//! command specification.

use super::error::ConfigError;
use crate::exec::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// What to do when a step fails
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OnFail {
    /// Abort the remaining steps
    #[default]
    Stop,
    /// Record the failure and keep going
    Continue,
}

/// Configuration for a workflow step
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Step name (unique within workflow, defaults to `step-<n>`)
    #[serde(default)]
    pub name: String,

    /// Tool action reference, `tool.action`
    pub action: Option<String>,

    /// Inline command (alternative to `action`)
    pub command: Option<CommandSpec>,

    /// Parameters passed to the action or rendered into the command
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub on_fail: OnFail,

    /// Steps this step depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Number of retries after a failed attempt
    #[serde(default)]
    pub retries: u32,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_retry_delay() -> u64 {
    1000
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            action: None,
            command: None,
            params: BTreeMap::new(),
            on_fail: OnFail::Stop,
            depends_on: Vec::new(),
            retries: 0,
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Full workflow configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Workflow name (defaults to the file stem)
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub version: Option<u32>,

    /// Keep running after any failed step regardless of `on_fail`
    #[serde(default)]
    pub continue_on_error: bool,

    /// Default parameter values, overridable from the command line
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// Supported workflow file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Toml,
    Json,
}

impl WorkflowFormat {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension,
            }),
        }
    }
}

impl WorkflowConfig {
    /// Parse workflow text; `origin` is used for error messages and the default name
    pub fn parse(
        contents: &str,
        format: WorkflowFormat,
        origin: &Path,
    ) -> Result<Self, ConfigError> {
        let mut workflow: Self = match format {
            WorkflowFormat::Toml => toml::from_str(contents).map_err(|e| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?,
            WorkflowFormat::Json => {
                serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
                    path: origin.to_path_buf(),
                    message: e.to_string(),
                })?
            }
        };

        if workflow.name.trim().is_empty() {
            workflow.name = origin
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "workflow".into());
        }
        workflow.normalize();
        workflow
            .validate()
            .map_err(|errors| ConfigError::InvalidWorkflow {
                name: workflow.name.clone(),
                errors,
            })?;

        Ok(workflow)
    }

    /// Fill in defaulted step names
    pub fn normalize(&mut self) {
        for (idx, step) in self.steps.iter_mut().enumerate() {
            if step.name.trim().is_empty() {
                step.name = format!("step-{}", idx + 1);
            }
        }
    }

    /// Structural validation; action references are checked against the tool
    /// registry by the workflow engine
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.steps.is_empty() {
            errors.push("workflow has no steps".to_string());
        }

        let mut seen_names = HashSet::new();
        for step in &self.steps {
            if !seen_names.insert(step.name.as_str()) {
                errors.push(format!("duplicate step name: {}", step.name));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen_names.contains(dep.as_str()) {
                    errors.push(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.name, dep
                    ));
                }
                if dep == &step.name {
                    errors.push(format!("step '{}' depends on itself", step.name));
                }
            }

            match (&step.action, &step.command) {
                (None, None) => errors.push(format!(
                    "step '{}' needs either 'action' or 'command'",
                    step.name
                )),
                (Some(_), Some(_)) => errors.push(format!(
                    "step '{}' has both 'action' and 'command'",
                    step.name
                )),
                (Some(action), None) => {
                    if split_action_ref(action).is_none() {
                        errors.push(format!(
                            "step '{}' has malformed action reference '{}' (expected tool.action)",
                            step.name, action
                        ));
                    }
                }
                (None, Some(command)) => {
                    if command.command.is_empty() {
                        errors.push(format!("step '{}' has an empty command", step.name));
                    }
                    if let Some(timeout) = command.explicit_timeout()
                        && !crate::exec::is_valid_timeout(timeout)
                    {
                        errors.push(format!(
                            "step '{}' has timeout {}s, the limit is {}s",
                            step.name,
                            timeout,
                            crate::exec::MAX_TIMEOUT_SECS
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Split `tool.action` into its parts
pub fn split_action_ref(reference: &str) -> Option<(&str, &str)> {
    let (tool, action) = reference.split_once('.')?;
    if tool.is_empty() || action.is_empty() || action.contains('.') {
        return None;
    }
    Some((tool, action))
}

/// Read and validate a workflow file
pub fn load_workflow_file(path: &Path) -> Result<WorkflowConfig, ConfigError> {
    let format = WorkflowFormat::from_path(path)?;
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    WorkflowConfig::parse(&contents, format, path)
}

/// Render a parameter value as the string used in templates
pub fn param_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandLine, Executor};
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_parse_toml_workflow() {
        let toml = r#"
            name = "network-reset"
            description = "Flush DNS and renew"
            version = 1

            [params]
            host = "example.com"

            [[steps]]
            name = "flush"
            action = "network.flush_dns"

            [[steps]]
            action = "network.ping_host"
            params = { host = "1.1.1.1", count = 2 }
            on_fail = "continue"
            depends_on = ["flush"]
        "#;
        let wf =
            WorkflowConfig::parse(toml, WorkflowFormat::Toml, Path::new("reset.toml")).unwrap();
        assert_eq!(wf.name, "network-reset");
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.steps[1].name, "step-2");
        assert_eq!(wf.steps[1].on_fail, OnFail::Continue);
        assert_eq!(param_to_string(&wf.steps[1].params["count"]), "2");
        assert_eq!(param_to_string(&wf.params["host"]), "example.com");
    }

    #[test]
    fn test_parse_json_workflow_with_inline_command() {
        let json = r#"{
            "steps": [
                {"name": "echo", "command": {"executor": "process", "command": ["echo", "hi"]}}
            ]
        }"#;
        let wf =
            WorkflowConfig::parse(json, WorkflowFormat::Json, Path::new("/tmp/quick.json")).unwrap();
        assert_eq!(wf.name, "quick");
        let command = wf.steps[0].command.as_ref().unwrap();
        assert_eq!(command.executor, Executor::Process);
        assert_eq!(
            command.command,
            CommandLine::Argv(vec!["echo".into(), "hi".into()])
        );
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            WorkflowFormat::from_path(Path::new("a.TOML")).unwrap(),
            WorkflowFormat::Toml
        );
        assert_eq!(
            WorkflowFormat::from_path(Path::new("a.json")).unwrap(),
            WorkflowFormat::Json
        );
        assert!(matches!(
            WorkflowFormat::from_path(Path::new("a.yaml")),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_validation_errors() {
        let workflow = WorkflowConfig {
            name: "broken".into(),
            steps: vec![
                StepConfig {
                    name: "a".into(),
                    action: Some("network".into()),
                    ..Default::default()
                },
                StepConfig {
                    name: "a".into(),
                    ..Default::default()
                },
                StepConfig {
                    name: "c".into(),
                    action: Some("network.flush_dns".into()),
                    command: Some(CommandSpec::shell("echo hi")),
                    depends_on: vec!["missing".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let errors = workflow.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("malformed")));
        assert!(errors.iter().any(|e| e.contains("duplicate step name: a")));
        assert!(errors.iter().any(|e| e.contains("either 'action' or 'command'")));
        assert!(errors.iter().any(|e| e.contains("both")));
        assert!(errors.iter().any(|e| e.contains("missing")));
    }

    #[test]
    fn test_oversized_step_timeout_rejected() {
        let toml = r#"
            [[steps]]
            name = "wait"
            command = { command = ["ping", "localhost"], timeout = 1e20 }
        "#;
        let err = WorkflowConfig::parse(toml, WorkflowFormat::Toml, Path::new("slow.toml"))
            .unwrap_err();
        match err {
            ConfigError::InvalidWorkflow { errors, .. } => {
                assert!(errors.iter().any(|e| e.contains("step 'wait' has timeout")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let workflow = WorkflowConfig {
            name: "empty".into(),
            ..Default::default()
        };
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn test_split_action_ref() {
        assert_eq!(
            split_action_ref("network.flush_dns"),
            Some(("network", "flush_dns"))
        );
        assert_eq!(split_action_ref("network"), None);
        assert_eq!(split_action_ref(".flush"), None);
        assert_eq!(split_action_ref("a.b.c"), None);
    }

    #[test]
    fn test_load_workflow_file_invalid_reports_name() {
        let dir = TempDir::new().unwrap();
        let path: PathBuf = dir.path().join("bad.toml");
        std::fs::write(&path, "[[steps]]\nname = \"x\"\n").unwrap();

        let err = load_workflow_file(&path).unwrap_err();
        match err {
            ConfigError::InvalidWorkflow { name, errors } => {
                assert_eq!(name, "bad");
                assert!(!errors.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

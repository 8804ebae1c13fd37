//! Workflow execution state

use crate::config::{WorkflowConfig, param_to_string};
use crate::exec::CommandResult;
use crate::template::{StepVars, TemplateContext};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Not run because a dependency did not succeed
    Skipped,
    Cancelled,
}

/// Record of one executed (or skipped) step
#[derive(Debug, Clone, Serialize)]
pub struct StepRun {
    pub name: String,
    /// `tool.action` for action steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub status: StepStatus,
    /// Number of attempts made, including retries
    pub attempts: u32,
    /// Results of the last attempt
    pub results: Vec<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// A failure here did not fail the workflow
    pub tolerated: bool,
}

impl StepRun {
    pub fn skipped(name: impl Into<String>, action: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action,
            status: StepStatus::Skipped,
            attempts: 0,
            results: Vec::new(),
            error: Some(reason.into()),
            duration_ms: 0,
            tolerated: true,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// Exit code of the last command, -1 when none ran
    pub fn exit_code(&self) -> i32 {
        self.results.last().map(|r| r.exit_code).unwrap_or(-1)
    }

    /// Output of every command in the last attempt
    pub fn output(&self) -> String {
        self.results
            .iter()
            .map(CommandResult::display_output)
            .filter(|o| !o.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// What later steps see through `steps.<name>`
    pub fn to_vars(&self) -> StepVars {
        StepVars {
            output: self.output(),
            exit_code: self.exit_code(),
            success: self.succeeded(),
        }
    }
}

/// Mutable state while a workflow runs
#[derive(Debug)]
pub struct WorkflowState {
    pub workflow_name: String,

    /// Workflow parameter defaults overridden by CLI arguments
    pub params: BTreeMap<String, String>,

    /// CLI arguments
    pub args: BTreeMap<String, String>,

    pub steps: Vec<StepRun>,

    pub started_at: Instant,

    /// A step failed in a way that fails the workflow
    pub failed: bool,

    pub cancelled: bool,
}

impl WorkflowState {
    pub fn new(workflow: &WorkflowConfig, args: BTreeMap<String, String>) -> Self {
        let mut params: BTreeMap<String, String> = workflow
            .params
            .iter()
            .map(|(k, v)| (k.clone(), param_to_string(v)))
            .collect();
        params.extend(args.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            workflow_name: workflow.name.clone(),
            params,
            args,
            steps: Vec::new(),
            started_at: Instant::now(),
            failed: false,
            cancelled: false,
        }
    }

    pub fn record(&mut self, run: StepRun) {
        match run.status {
            StepStatus::Failed if !run.tolerated => self.failed = true,
            StepStatus::Cancelled => self.cancelled = true,
            _ => {}
        }
        self.steps.push(run);
    }

    pub fn get(&self, step_name: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.name == step_name)
    }

    /// First dependency of `depends_on` that did not succeed
    pub fn unmet_dependency<'a>(&self, depends_on: &'a [String]) -> Option<&'a str> {
        depends_on
            .iter()
            .find(|dep| !self.get(dep).is_some_and(StepRun::succeeded))
            .map(String::as_str)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Template context for the next step
    pub fn to_template_context(&self) -> TemplateContext {
        let mut ctx = TemplateContext::with_params(self.params.clone());
        ctx.args = self.args.clone();
        for step in &self.steps {
            ctx.add_step(step.name.clone(), step.to_vars());
        }
        ctx.set_workflow(self.workflow_name.clone());
        ctx
    }
}

/// Result of executing a workflow
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub name: String,
    pub steps: Vec<StepRun>,
    pub success: bool,
    pub cancelled: bool,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}

impl WorkflowRun {
    pub fn from_state(state: WorkflowState) -> Self {
        let duration = state.elapsed();
        Self {
            name: state.workflow_name,
            success: !state.failed && !state.cancelled,
            cancelled: state.cancelled,
            steps: state.steps,
            duration,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Exit codes of every command that ran
    pub fn exit_codes(&self) -> Vec<i32> {
        self.steps
            .iter()
            .flat_map(|s| s.results.iter().map(|r| r.exit_code))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepConfig;

    fn workflow() -> WorkflowConfig {
        let mut params = BTreeMap::new();
        params.insert("port".to_string(), serde_json::json!(3010));
        params.insert("host".to_string(), serde_json::json!("localhost"));
        WorkflowConfig {
            name: "check".into(),
            params,
            steps: vec![StepConfig {
                name: "one".into(),
                action: Some("ports.scan".into()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn run(name: &str, status: StepStatus, exit_code: i32) -> StepRun {
        StepRun {
            name: name.into(),
            action: None,
            status,
            attempts: 1,
            results: vec![CommandResult::new("cmd", exit_code).with_stdout("out")],
            error: None,
            duration_ms: 5,
            tolerated: false,
        }
    }

    #[test]
    fn test_args_override_params() {
        let mut args = BTreeMap::new();
        args.insert("port".to_string(), "8080".to_string());
        let state = WorkflowState::new(&workflow(), args);

        assert_eq!(state.params["port"], "8080");
        assert_eq!(state.params["host"], "localhost");
        assert_eq!(state.args.len(), 1);
    }

    #[test]
    fn test_failure_propagation() {
        let mut state = WorkflowState::new(&workflow(), BTreeMap::new());
        state.record(run("one", StepStatus::Succeeded, 0));
        assert!(!state.failed);

        let mut tolerated = run("two", StepStatus::Failed, 1);
        tolerated.tolerated = true;
        state.record(tolerated);
        assert!(!state.failed);

        state.record(run("three", StepStatus::Failed, 2));
        assert!(state.failed);

        let result = WorkflowRun::from_state(state);
        assert!(!result.success);
        assert_eq!(result.failed_steps(), vec!["two", "three"]);
        assert_eq!(result.exit_codes(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unmet_dependency() {
        let mut state = WorkflowState::new(&workflow(), BTreeMap::new());
        state.record(run("ok", StepStatus::Succeeded, 0));
        state.record(StepRun::skipped("skipped", None, "dependency failed"));

        assert_eq!(state.unmet_dependency(&["ok".to_string()]), None);
        assert_eq!(
            state.unmet_dependency(&["ok".to_string(), "skipped".to_string()]),
            Some("skipped")
        );
        assert_eq!(state.unmet_dependency(&["never".to_string()]), Some("never"));
    }

    #[test]
    fn test_to_template_context() {
        let mut state = WorkflowState::new(&workflow(), BTreeMap::new());
        state.record(run("one", StepStatus::Succeeded, 0));

        let ctx = state.to_template_context();
        assert_eq!(ctx.workflow.as_deref(), Some("check"));
        assert_eq!(ctx.params["port"], "3010");
        let vars = &ctx.steps["one"];
        assert_eq!(vars.output, "out");
        assert_eq!(vars.exit_code, 0);
        assert!(vars.success);
    }

    #[test]
    fn test_cancelled_run_is_not_success() {
        let mut state = WorkflowState::new(&workflow(), BTreeMap::new());
        state.record(run("one", StepStatus::Cancelled, -1));
        let result = WorkflowRun::from_state(state);
        assert!(result.cancelled);
        assert!(!result.success);
    }
}

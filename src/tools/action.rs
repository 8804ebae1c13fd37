//! Actions and their parameters

use super::ToolError;
use crate::exec::{CommandResult, CommandRunner, CommandSpec, run_sequence};
use crate::template::{TemplateContext, TemplateEngine};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// A parameter an action accepts
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ParamDef {
    pub name: String,
    pub description: String,
    pub default: Option<String>,
    pub required: bool,
    /// Value must be a non-negative integer
    pub numeric: bool,
}

impl ParamDef {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: None,
            required: true,
            numeric: false,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        description: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: Some(default.into()),
            required: false,
            numeric: false,
        }
    }

    pub fn numeric(mut self) -> Self {
        self.numeric = true;
        self
    }

    fn check(&self, value: &str) -> Result<(), String> {
        if self.numeric && value.parse::<u64>().is_err() {
            return Err("expected a non-negative integer".into());
        }
        Ok(())
    }
}

/// A diagnostic or repair operation made of one or more commands
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub id: String,
    pub label: String,
    pub description: String,
    pub requires_admin: bool,
    pub params: Vec<ParamDef>,
    /// Command templates, run in order
    pub steps: Vec<CommandSpec>,
}

impl Action {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: String::new(),
            requires_admin: false,
            params: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn admin(mut self) -> Self {
        self.requires_admin = true;
        self
    }

    pub fn param(mut self, param: ParamDef) -> Self {
        self.params.push(param);
        self
    }

    pub fn step(mut self, spec: CommandSpec) -> Self {
        self.steps.push(spec);
        self
    }

    /// Render the action's commands for `params`
    pub fn resolve(
        &self,
        engine: &TemplateEngine,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<CommandSpec>, ToolError> {
        self.resolve_in(engine, TemplateContext::with_params(params.clone()))
    }

    /// Render the action's commands in a prepared context; declared defaults
    /// fill in parameters missing from `ctx.params`
    pub fn resolve_in(
        &self,
        engine: &TemplateEngine,
        mut ctx: TemplateContext,
    ) -> Result<Vec<CommandSpec>, ToolError> {
        for def in &self.params {
            let supplied = ctx
                .params
                .get(&def.name)
                .filter(|v| !v.trim().is_empty())
                .cloned();
            let value = match (supplied, &def.default) {
                (Some(value), _) => value,
                (None, Some(default)) => default.clone(),
                (None, None) if def.required => {
                    return Err(ToolError::MissingParam {
                        action: self.id.clone(),
                        param: def.name.clone(),
                    });
                }
                (None, None) => String::new(),
            };
            def.check(&value).map_err(|reason| ToolError::InvalidParam {
                param: def.name.clone(),
                value: value.clone(),
                reason,
            })?;
            ctx.params.insert(def.name.clone(), value);
        }

        self.steps
            .iter()
            .map(|step| {
                let mut spec = engine.render_command(step, &ctx)?;
                spec.elevate |= self.requires_admin;
                Ok(spec)
            })
            .collect()
    }
}

/// Results of running one action
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// `tool.action` reference
    pub action: String,
    pub results: Vec<CommandResult>,
}

impl ActionOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(CommandResult::succeeded)
    }

    pub fn failed_exit_codes(&self) -> Vec<i32> {
        self.results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.exit_code)
            .collect()
    }

    pub fn exit_codes(&self) -> Vec<i32> {
        self.results.iter().map(|r| r.exit_code).collect()
    }

    pub fn duration_ms(&self) -> u64 {
        self.results.iter().map(|r| r.duration_ms).sum()
    }
}

/// Resolve and run an action
pub async fn execute_action(
    runner: &dyn CommandRunner,
    engine: &TemplateEngine,
    reference: &str,
    action: &Action,
    params: &BTreeMap<String, String>,
) -> Result<ActionOutcome, ToolError> {
    let specs = action.resolve(engine, params)?;
    info!(action = reference, commands = specs.len(), "running action");
    let results = run_sequence(runner, &specs).await?;
    Ok(ActionOutcome {
        action: reference.to_string(),
        results,
    })
}

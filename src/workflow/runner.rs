//! Workflow engine - orchestrates step execution

use super::executor::{ExecutionContext, execute_step};
use super::state::{StepRun, WorkflowRun, WorkflowState};
use crate::cli::output::{OutputEvent, OutputHandler};
use crate::cli::signals::CancellationToken;
use crate::config::{OnFail, WorkflowConfig, param_to_string};
use crate::exec::CommandRunner;
use crate::template::{TemplateEngine, TemplateError};
use crate::tools::{ToolError, ToolRegistry};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Errors during workflow validation and execution
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow '{name}' is invalid:\n  - {}", .errors.join("\n  - "))]
    Invalid { name: String, errors: Vec<String> },

    #[error("circular dependency detected involving step '{step}'")]
    CircularDependency { step: String },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}': {source}")]
    Tool { step: String, source: ToolError },

    #[error("step '{step}': {source}")]
    Template { step: String, source: TemplateError },

    #[error("workflow '{name}' not found{}", available_hint(.available))]
    NotFound { name: String, available: Vec<String> },

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

fn available_hint(available: &[String]) -> String {
    if available.is_empty() {
        String::new()
    } else {
        format!(" (available: {})", available.join(", "))
    }
}

/// Runs workflows against a tool registry
pub struct WorkflowEngine {
    registry: Arc<ToolRegistry>,
    engine: TemplateEngine,
    runner: Arc<dyn CommandRunner>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<ToolRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            registry,
            engine: TemplateEngine::new(),
            runner,
        }
    }

    /// Run a workflow to completion, failure, or cancellation
    pub async fn execute(
        &self,
        workflow: &WorkflowConfig,
        args: BTreeMap<String, String>,
        cancel: Option<&CancellationToken>,
        events: &dyn OutputHandler,
    ) -> Result<WorkflowRun, WorkflowError> {
        check_workflow(workflow, &self.registry, &args)?;
        let order = topological_sort(workflow)?;

        let mut state = WorkflowState::new(workflow, args);
        let ctx = ExecutionContext {
            registry: &self.registry,
            engine: &self.engine,
            runner: self.runner.as_ref(),
            cancel,
            events,
        };

        info!(workflow = %workflow.name, steps = order.len(), admin = self.runner.is_admin(), "starting workflow");
        events.emit(OutputEvent::WorkflowStart {
            name: workflow.name.clone(),
            steps: order.len(),
        });

        let total = order.len();
        for (idx, step_name) in order.iter().enumerate() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                warn!(workflow = %workflow.name, "workflow cancelled");
                state.cancelled = true;
                break;
            }

            let Some(step) = workflow.steps.iter().find(|s| &s.name == step_name) else {
                continue;
            };

            if let Some(dep) = state.unmet_dependency(&step.depends_on) {
                let reason = format!("dependency '{dep}' did not succeed");
                events.emit(OutputEvent::StepSkipped {
                    name: step.name.clone(),
                    reason: reason.clone(),
                });
                state.record(StepRun::skipped(&step.name, step.action.clone(), reason));
                continue;
            }

            events.emit(OutputEvent::StepStart {
                name: step.name.clone(),
                index: idx + 1,
                total,
            });
            let template_ctx = state.to_template_context();
            let run = execute_step(step, &template_ctx, workflow.continue_on_error, &ctx).await;

            if let Some(error) = run.error.as_ref().filter(|_| !run.succeeded()) {
                events.emit(OutputEvent::StepError {
                    name: run.name.clone(),
                    error: error.clone(),
                });
            }
            events.emit(OutputEvent::StepComplete {
                name: run.name.clone(),
                duration_ms: run.duration_ms,
                success: run.succeeded(),
                exit_code: run.exit_code(),
                output: run.output(),
            });

            let stop = !run.succeeded()
                && step.on_fail == OnFail::Stop
                && !workflow.continue_on_error;
            info!(step = %run.name, status = ?run.status, attempts = run.attempts, "step finished");
            state.record(run);

            if state.cancelled {
                break;
            }
            if stop {
                warn!(step = %step.name, "stopping workflow after failed step");
                break;
            }
        }

        let result = WorkflowRun::from_state(state);
        events.emit(OutputEvent::WorkflowComplete {
            success: result.success,
            cancelled: result.cancelled,
            duration_ms: result.duration.as_millis() as u64,
            steps_completed: result.steps.iter().filter(|s| s.succeeded()).count(),
        });
        info!(
            workflow = %result.name,
            success = result.success,
            cancelled = result.cancelled,
            "workflow finished"
        );
        Ok(result)
    }
}

/// Structural checks plus ordering and action references against `registry`
pub fn validate_with(workflow: &WorkflowConfig, registry: &ToolRegistry) -> Result<(), WorkflowError> {
    check_workflow(workflow, registry, &BTreeMap::new())
}

/// Like [`validate_with`], counting `args` as supplied parameters
fn check_workflow(
    workflow: &WorkflowConfig,
    registry: &ToolRegistry,
    args: &BTreeMap<String, String>,
) -> Result<(), WorkflowError> {
    let mut errors = workflow.validate().err().unwrap_or_default();

    let templates = TemplateEngine::new();
    for step in &workflow.steps {
        let mut texts: Vec<String> = step.params.values().map(param_to_string).collect();
        if let Some(command) = &step.command {
            texts.push(command.command.as_text());
        }
        for text in &texts {
            if let Err(e) = templates.validate(text) {
                errors.push(format!("step '{}': {e}", step.name));
            }
        }
    }

    for step in &workflow.steps {
        let Some(reference) = step.action.as_deref() else {
            continue;
        };
        match registry.lookup(reference) {
            Ok(action) => {
                for def in action.params.iter().filter(|d| d.required && d.default.is_none()) {
                    let supplied = step.params.contains_key(&def.name)
                        || workflow.params.contains_key(&def.name)
                        || args.contains_key(&def.name);
                    if !supplied {
                        errors.push(format!(
                            "step '{}': action '{}' requires parameter '{}'",
                            step.name, reference, def.name
                        ));
                    }
                }
            }
            Err(ToolError::InvalidReference { .. }) => {}
            Err(e) => errors.push(format!("step '{}': {e}", step.name)),
        }
    }

    if errors.is_empty() {
        topological_sort(workflow)?;
        Ok(())
    } else {
        Err(WorkflowError::Invalid {
            name: workflow.name.clone(),
            errors,
        })
    }
}

/// Dependencies first, declaration order otherwise
pub fn topological_sort(workflow: &WorkflowConfig) -> Result<Vec<String>, WorkflowError> {
    let step_map: HashMap<&str, &[String]> = workflow
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.as_slice()))
        .collect();

    fn visit(
        step_name: &str,
        from: &str,
        step_map: &HashMap<&str, &[String]>,
        visited: &mut HashSet<String>,
        in_progress: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) -> Result<(), WorkflowError> {
        if visited.contains(step_name) {
            return Ok(());
        }
        if in_progress.contains(step_name) {
            return Err(WorkflowError::CircularDependency {
                step: step_name.to_string(),
            });
        }
        let Some(deps) = step_map.get(step_name) else {
            return Err(WorkflowError::UnknownDependency {
                step: from.to_string(),
                dependency: step_name.to_string(),
            });
        };

        in_progress.insert(step_name.to_string());
        for dep in deps.iter() {
            visit(dep, step_name, step_map, visited, in_progress, result)?;
        }
        in_progress.remove(step_name);
        visited.insert(step_name.to_string());
        result.push(step_name.to_string());
        Ok(())
    }

    let mut result = Vec::new();
    let mut visited = HashSet::new();
    let mut in_progress = HashSet::new();
    for step in &workflow.steps {
        visit(
            &step.name,
            &step.name,
            &step_map,
            &mut visited,
            &mut in_progress,
            &mut result,
        )?;
    }
    Ok(result)
}

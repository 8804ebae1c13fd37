//! Step resolution and execution

use super::WorkflowError;
use super::retry::RetryPolicy;
use super::state::{StepRun, StepStatus};
use crate::cli::output::{OutputEvent, OutputHandler};
use crate::cli::signals::CancellationToken;
use crate::config::{OnFail, StepConfig, param_to_string};
use crate::exec::{CommandResult, CommandRunner, CommandSpec, ExecError};
use crate::template::{TemplateContext, TemplateEngine};
use crate::tools::ToolRegistry;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a step needs to run
pub struct ExecutionContext<'a> {
    pub registry: &'a ToolRegistry,
    pub engine: &'a TemplateEngine,
    pub runner: &'a dyn CommandRunner,
    pub cancel: Option<&'a CancellationToken>,
    pub events: &'a dyn OutputHandler,
}

/// Render the step's own parameters on top of the workflow parameters
fn step_params(
    step: &StepConfig,
    engine: &TemplateEngine,
    ctx: &TemplateContext,
) -> Result<BTreeMap<String, String>, WorkflowError> {
    let mut params = ctx.params.clone();
    for (key, value) in &step.params {
        let rendered = engine
            .render(&param_to_string(value), ctx)
            .map_err(|source| WorkflowError::Template {
                step: step.name.clone(),
                source,
            })?;
        params.insert(key.clone(), rendered);
    }
    Ok(params)
}

/// Turn a step into the command specs it runs
pub fn resolve_step(
    step: &StepConfig,
    registry: &ToolRegistry,
    engine: &TemplateEngine,
    ctx: &TemplateContext,
) -> Result<Vec<CommandSpec>, WorkflowError> {
    let mut step_ctx = ctx.clone();
    step_ctx.params = step_params(step, engine, ctx)?;

    match (&step.action, &step.command) {
        (Some(reference), None) => {
            let action = registry
                .lookup(reference)
                .map_err(|source| WorkflowError::Tool {
                    step: step.name.clone(),
                    source,
                })?;
            action
                .resolve_in(engine, step_ctx)
                .map_err(|source| WorkflowError::Tool {
                    step: step.name.clone(),
                    source,
                })
        }
        (None, Some(command)) => {
            let spec = engine
                .render_command(command, &step_ctx)
                .map_err(|source| WorkflowError::Template {
                    step: step.name.clone(),
                    source,
                })?;
            Ok(vec![spec])
        }
        _ => Err(WorkflowError::Invalid {
            name: step.name.clone(),
            errors: vec![format!(
                "step '{}' needs exactly one of 'action' or 'command'",
                step.name
            )],
        }),
    }
}

/// Outcome of one attempt
struct Attempt {
    results: Vec<CommandResult>,
    error: Option<String>,
    cancelled: bool,
    /// Running the step again might succeed
    retryable: bool,
}

async fn run_attempt(specs: &[CommandSpec], ctx: &ExecutionContext<'_>) -> Attempt {
    let mut attempt = Attempt {
        results: Vec::with_capacity(specs.len()),
        error: None,
        cancelled: false,
        retryable: true,
    };

    for spec in specs {
        if ctx.cancel.is_some_and(CancellationToken::is_cancelled) {
            attempt.cancelled = true;
            return attempt;
        }
        match ctx.runner.run(spec).await {
            Ok(result) => {
                debug!(command = %result.command, exit_code = result.exit_code, "step command finished");
                if !result.succeeded() && attempt.error.is_none() {
                    attempt.error = Some(format!(
                        "'{}' exited with code {}",
                        result.command, result.exit_code
                    ));
                }
                attempt.results.push(result);
            }
            Err(ExecError::Cancelled { .. }) => {
                attempt.cancelled = true;
                return attempt;
            }
            Err(e) => {
                attempt.retryable = e.is_retryable();
                attempt.error = Some(e.to_string());
                return attempt;
            }
        }
    }
    attempt
}

/// Wait out a retry delay; false when cancelled meanwhile
async fn sleep_or_cancel(delay: std::time::Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = token.cancelled() => false,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}

/// Run a step, retrying failed attempts per its policy
pub async fn execute_step(
    step: &StepConfig,
    template_ctx: &TemplateContext,
    continue_on_error: bool,
    ctx: &ExecutionContext<'_>,
) -> StepRun {
    let start = Instant::now();
    let tolerated = step.on_fail == OnFail::Continue;
    let mut run = StepRun {
        name: step.name.clone(),
        action: step.action.clone(),
        status: StepStatus::Failed,
        attempts: 0,
        results: Vec::new(),
        error: None,
        duration_ms: 0,
        tolerated,
    };

    let specs = match resolve_step(step, ctx.registry, ctx.engine, template_ctx) {
        Ok(specs) => specs,
        Err(e) => {
            warn!(step = %step.name, error = %e, "step could not be resolved");
            run.error = Some(e.to_string());
            run.duration_ms = start.elapsed().as_millis() as u64;
            return run;
        }
    };

    let policy = RetryPolicy::for_step(step);
    loop {
        run.attempts += 1;
        let attempt = run_attempt(&specs, ctx).await;
        run.results = attempt.results;
        run.error = attempt.error;

        if attempt.cancelled {
            run.status = StepStatus::Cancelled;
            run.error.get_or_insert_with(|| "cancelled".into());
            break;
        }
        if run.error.is_none() {
            run.status = StepStatus::Succeeded;
            break;
        }

        let retry_index = run.attempts - 1;
        if !attempt.retryable || retry_index >= policy.max_retries {
            break;
        }

        let delay = policy.delay_for_attempt(retry_index);
        let error = run.error.clone().unwrap_or_default();
        info!(step = %step.name, attempt = run.attempts, delay_ms = delay.as_millis() as u64, error = %error, "retrying step");
        ctx.events.emit(OutputEvent::StepRetry {
            name: step.name.clone(),
            attempt: run.attempts + 1,
            delay_ms: delay.as_millis() as u64,
            error,
        });
        if !sleep_or_cancel(delay, ctx.cancel).await {
            run.status = StepStatus::Cancelled;
            break;
        }
    }

    if run.status == StepStatus::Failed && continue_on_error {
        run.tolerated = true;
    }
    run.duration_ms = start.elapsed().as_millis() as u64;
    run
}

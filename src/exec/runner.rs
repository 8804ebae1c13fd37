//! Running command specifications

use super::error::ExecError;
use super::result::CommandResult;
use super::spec::{CommandSpec, build_argv, is_valid_timeout};
use crate::cli::signals::CancellationToken;
use crate::process::{exit_status_code, hide_console_window, wait_for_child_output};
use async_trait::async_trait;
use chrono::Local;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Run a command to completion, capturing its output
pub async fn run_command(spec: &CommandSpec, is_admin: bool) -> Result<CommandResult, ExecError> {
    run_command_with_cancel(spec, is_admin, None).await
}

/// Run a command, aborting it when `cancel` fires
pub async fn run_command_with_cancel(
    spec: &CommandSpec,
    is_admin: bool,
    cancel: Option<&CancellationToken>,
) -> Result<CommandResult, ExecError> {
    let command_text = spec.format_for_logging();

    if spec.elevate && !is_admin {
        return Err(ExecError::ElevationRequired { command: command_text });
    }

    let timeout = spec.timeout_duration()?;
    let argv = build_argv(spec)?;
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = spec.resolved_cwd() {
        cmd.current_dir(cwd);
    }
    hide_console_window(&mut cmd);

    debug!(command = %command_text, executor = %spec.executor, timeout = spec.timeout_secs(), "spawning");

    let started_at = Local::now();
    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        command: command_text.clone(),
        source,
    })?;

    let outcome = tokio::select! {
        result = tokio::time::timeout(timeout, wait_for_child_output(&mut child)) => Some(result),
        _ = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        } => None,
    };

    let (stdout, stderr, status) = match outcome {
        Some(Ok(Ok(output))) => output,
        Some(Ok(Err(e))) => {
            let _ = child.kill().await;
            return Err(ExecError::Output {
                command: command_text,
                message: e.to_string(),
            });
        }
        Some(Err(_)) => {
            let _ = child.kill().await;
            warn!(command = %command_text, timeout = spec.timeout_secs(), "command timed out");
            return Err(ExecError::TimedOut {
                command: command_text,
                timeout: spec.timeout_secs(),
            });
        }
        None => {
            let _ = child.kill().await;
            return Err(ExecError::Cancelled { command: command_text });
        }
    };

    let result = CommandResult {
        command: command_text,
        stdout,
        stderr,
        exit_code: exit_status_code(&status),
        duration_ms: start.elapsed().as_millis() as u64,
        started_at,
    };
    debug!(
        command = %result.command,
        exit_code = result.exit_code,
        duration_ms = result.duration_ms,
        "command finished"
    );
    Ok(result)
}

/// Seam between diagnostics and the operating system
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a single command specification
    async fn run(&self, spec: &CommandSpec) -> Result<CommandResult, ExecError>;

    /// Whether commands run with administrator rights
    fn is_admin(&self) -> bool {
        false
    }
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandResult, ExecError> {
        (**self).run(spec).await
    }

    fn is_admin(&self) -> bool {
        (**self).is_admin()
    }
}

/// Runs commands as real child processes
#[derive(Clone, Default)]
pub struct SystemRunner {
    is_admin: bool,
    cancel: Option<CancellationToken>,
    default_timeout: Option<f64>,
}

impl SystemRunner {
    pub fn new(is_admin: bool) -> Self {
        Self {
            is_admin,
            cancel: None,
            default_timeout: None,
        }
    }

    /// Detect elevation of the current process
    pub fn detect() -> Self {
        Self::new(crate::admin::is_elevated())
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Timeout for specs that do not set their own; out-of-range values are ignored
    pub fn with_default_timeout(mut self, secs: f64) -> Self {
        self.default_timeout = Some(secs).filter(|t| is_valid_timeout(*t));
        if self.default_timeout.is_none() {
            warn!(timeout = secs, "ignoring invalid default timeout");
        }
        self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandResult, ExecError> {
        match (spec.explicit_timeout(), self.default_timeout) {
            (None, Some(secs)) => {
                let spec = spec.clone().with_timeout(secs);
                run_command_with_cancel(&spec, self.is_admin, self.cancel.as_ref()).await
            }
            _ => run_command_with_cancel(spec, self.is_admin, self.cancel.as_ref()).await,
        }
    }

    fn is_admin(&self) -> bool {
        self.is_admin
    }
}

/// Run `specs` in order, stopping at the first execution error.
/// Non-zero exit codes do not stop the sequence.
pub async fn run_sequence(
    runner: &dyn CommandRunner,
    specs: &[CommandSpec],
) -> Result<Vec<CommandResult>, ExecError> {
    let mut results = Vec::with_capacity(specs.len());
    for spec in specs {
        results.push(runner.run(spec).await?);
    }
    Ok(results)
}

/// Runs command sequences in the background, at most `max_workers` at a time
#[derive(Clone)]
pub struct SequenceRunner {
    runner: Arc<dyn CommandRunner>,
    permits: Arc<Semaphore>,
}

impl SequenceRunner {
    /// `max_workers` of zero is treated as one
    pub fn new(runner: Arc<dyn CommandRunner>, max_workers: usize) -> Self {
        Self {
            runner,
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Start a sequence on the runtime
    pub fn submit(
        &self,
        specs: Vec<CommandSpec>,
    ) -> tokio::task::JoinHandle<Result<Vec<CommandResult>, ExecError>> {
        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| ExecError::Output {
                    command: "<sequence>".into(),
                    message: e.to_string(),
                })?;
            run_sequence(runner.as_ref(), &specs).await
        })
    }

    /// Run several sequences concurrently, returning results in input order
    pub async fn run_all(
        &self,
        batches: Vec<Vec<CommandSpec>>,
    ) -> Vec<Result<Vec<CommandResult>, ExecError>> {
        let handles: Vec<_> = batches.into_iter().map(|b| self.submit(b)).collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(ExecError::Output {
                    command: "<sequence>".into(),
                    message: e.to_string(),
                }),
            });
        }
        results
    }
}

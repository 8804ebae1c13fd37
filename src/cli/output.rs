//! How command progress and results reach the terminal
//!
//! `--json` switches to [`JsonHandler`], `--quiet` to [`QuietHandler`];
//! otherwise [`ConsoleHandler`] is used.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

impl OutputMode {
    /// Mode selected by the global flags; `--json` wins over `--quiet`
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if json {
            Self::Json
        } else if quiet {
            Self::Quiet
        } else {
            Self::Console
        }
    }
}

/// Events emitted while actions and workflows run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum OutputEvent {
    WorkflowStart {
        name: String,
        steps: usize,
    },
    StepStart {
        name: String,
        index: usize,
        total: usize,
    },
    StepRetry {
        name: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepSkipped {
        name: String,
        reason: String,
    },
    StepComplete {
        name: String,
        duration_ms: u64,
        success: bool,
        exit_code: i32,
        output: String,
    },
    StepError {
        name: String,
        error: String,
    },
    WorkflowComplete {
        success: bool,
        cancelled: bool,
        duration_ms: u64,
        steps_completed: usize,
    },
    ActionStart {
        action: String,
        commands: usize,
    },
    CommandComplete {
        command: String,
        exit_code: i32,
        duration_ms: u64,
        output: String,
    },
    Info {
        message: String,
    },
    Debug {
        message: String,
    },
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    /// Emit an event
    fn emit(&self, event: OutputEvent);

    /// Write final result
    fn result(&self, success: bool, output: Option<&str>);

    /// Write a structured final result; `human` is the text rendering
    fn data(&self, success: bool, human: &str, data: &serde_json::Value) {
        let _ = data;
        self.result(success, Some(human));
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|l| format!("    {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `850ms` below a second, `2.5s` above
fn human_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

fn workflow_summary(success: bool, cancelled: bool, steps: usize, duration_ms: u64) -> String {
    let took = human_duration(duration_ms);
    if cancelled {
        format!("Workflow cancelled after {steps} steps ({took})")
    } else if success {
        format!("✓ Workflow completed successfully ({steps} steps in {took})")
    } else {
        format!("✗ Workflow failed after {steps} steps ({took})")
    }
}

/// Human-oriented progress on stderr, results on stdout
pub struct ConsoleHandler {
    debug: bool,
}

impl ConsoleHandler {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::WorkflowStart { name, steps } => {
                eprintln!("Running workflow '{name}' ({steps} steps)");
            }
            OutputEvent::StepStart { name, index, total } => {
                eprint!("[{index}/{total}] {name}... ");
                let _ = io::stderr().flush();
            }
            OutputEvent::StepRetry {
                attempt,
                delay_ms,
                error,
                ..
            } => {
                eprintln!(
                    "\n    {error} - retrying (attempt {attempt}) in {}",
                    human_duration(delay_ms)
                );
            }
            OutputEvent::StepSkipped { name, reason } => {
                eprintln!("[skip] {name} ({reason})");
            }
            OutputEvent::StepComplete {
                duration_ms,
                success,
                exit_code,
                output,
                ..
            } => {
                let took = human_duration(duration_ms);
                if success {
                    eprintln!("✓ ({took})");
                } else {
                    eprintln!("✗ exit {exit_code} ({took})");
                }
                if !output.is_empty() {
                    eprintln!("{}", indent(&output));
                }
            }
            OutputEvent::StepError { name, error } => {
                eprintln!("\nError in step '{name}': {error}");
            }
            OutputEvent::WorkflowComplete {
                success,
                cancelled,
                duration_ms,
                steps_completed,
            } => {
                eprintln!();
                eprintln!(
                    "{}",
                    workflow_summary(success, cancelled, steps_completed, duration_ms)
                );
            }
            OutputEvent::ActionStart { action, commands } => {
                eprintln!("Running {action} ({commands} commands)");
            }
            OutputEvent::CommandComplete {
                command,
                exit_code,
                duration_ms,
                output,
            } => {
                let mark = if exit_code == 0 { "✓" } else { "✗" };
                eprintln!(
                    "{mark} {command} [exit {exit_code}, {}]",
                    human_duration(duration_ms)
                );
                if !output.is_empty() {
                    eprintln!("{}", indent(&output));
                }
            }
            OutputEvent::Info { message } => eprintln!("{message}"),
            OutputEvent::Debug { message } => {
                if self.debug {
                    eprintln!("[debug] {message}");
                }
            }
        }
    }

    fn result(&self, _success: bool, output: Option<&str>) {
        print_text(output);
    }
}

fn print_text(output: Option<&str>) {
    if let Some(out) = output.filter(|o| !o.is_empty()) {
        println!("{out}");
    }
}

/// Machine-readable output: every event and the final result as one JSON line
pub struct JsonHandler;

impl JsonHandler {
    fn print_line<T: Serialize>(value: &T) {
        if let Ok(line) = serde_json::to_string(value) {
            println!("{line}");
        }
    }
}

#[derive(Serialize)]
struct FinalResult<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a serde_json::Value>,
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        Self::print_line(&event);
    }

    fn result(&self, success: bool, output: Option<&str>) {
        Self::print_line(&FinalResult {
            success,
            output,
            data: None,
        });
    }

    fn data(&self, success: bool, _human: &str, data: &serde_json::Value) {
        Self::print_line(&FinalResult {
            success,
            output: None,
            data: Some(data),
        });
    }
}

/// Drops progress events; only the final result reaches stdout
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, _event: OutputEvent) {}

    fn result(&self, _success: bool, output: Option<&str>) {
        print_text(output);
    }
}

pub fn create_handler(mode: OutputMode, debug: bool) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler::new(debug)),
        OutputMode::Json => Box::new(JsonHandler),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}

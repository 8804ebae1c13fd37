//! CLI command implementations
//!
//! Each command returns the process exit code. Human text and structured
//! data both go through the [`OutputHandler`], so `--json` and `--quiet`
//! work the same everywhere.

use super::output::{OutputEvent, OutputHandler};
use super::signals::{CancellationToken, with_cancellation};
use crate::admin;
use crate::config::{AppConfig, ConfigError, SETTABLE_KEYS, paths};
use crate::diagnostics::hosts::{self, HostsError, HostsFile};
use crate::diagnostics::network::{self, PING_COUNT_FLAG};
use crate::diagnostics::ports::{self, PortScanResult};
use crate::diagnostics::processes::{self, SortKey};
use crate::diagnostics::services::{self, ServiceVerb};
use crate::exec::{
    CommandResult, CommandRunner, CommandSpec, SequenceRunner, find_executable,
    powershell_program,
};
use crate::history::History;
use crate::template::TemplateEngine;
use crate::tools::{ActionOutcome, ToolRegistry, builtin_registry, execute_action};
use crate::workflow::{WorkflowCatalog, WorkflowEngine, WorkflowError, topological_sort, validate_with};
use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_SPAWN_FAILED: i32 = 127;
pub const EXIT_CANCELLED: i32 = 130;

fn exit_code(success: bool) -> i32 {
    if success { EXIT_OK } else { EXIT_FAILURE }
}

fn cancelled(handler: &dyn OutputHandler) -> i32 {
    handler.result(false, Some("Cancelled"));
    EXIT_CANCELLED
}

/// Shared state for every command
pub struct App {
    pub config: AppConfig,
    /// File given with `--config`
    pub config_path: Option<PathBuf>,
    pub working_dir: PathBuf,
    pub runner: Arc<dyn CommandRunner>,
    pub registry: Arc<ToolRegistry>,
    pub cancel: CancellationToken,
    /// History database; `None` disables recording
    pub history_path: Option<PathBuf>,
}

impl App {
    pub fn new(
        config: AppConfig,
        config_path: Option<PathBuf>,
        working_dir: PathBuf,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        let history_path = match paths::history_db_path() {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "history location unavailable");
                None
            }
        };
        Self {
            registry: Arc::new(builtin_registry(&config)),
            config,
            config_path,
            working_dir,
            runner,
            cancel,
            history_path,
        }
    }

    fn catalog(&self) -> WorkflowCatalog {
        WorkflowCatalog::discover(&self.working_dir)
    }

    async fn cancellable<F: Future>(&self, future: F) -> Option<F::Output> {
        with_cancellation(&self.cancel, future).await
    }

    /// Store a run; history problems never fail the command
    fn record(&self, store: impl FnOnce(&mut History) -> Result<i64>) {
        let Some(path) = &self.history_path else {
            return;
        };
        match History::open(path).and_then(|mut history| store(&mut history)) {
            Ok(id) => debug!(id, "run recorded"),
            Err(e) => warn!(error = %format!("{e:#}"), "failed to record run history"),
        }
    }
}

/// Parse `key=value` arguments; bare values become `arg0`, `arg1`, ...
pub fn parse_workflow_args(args: &[String]) -> BTreeMap<String, String> {
    let mut parsed = BTreeMap::new();
    let mut positional = 0;

    for arg in args {
        if let Some((key, value)) = arg.split_once('=') {
            parsed.insert(key.trim().to_string(), value.to_string());
        } else {
            parsed.insert(format!("arg{positional}"), arg.clone());
            positional += 1;
        }
    }

    parsed
}

fn scan_summary(result: &PortScanResult) -> String {
    let mut out = result.status_line();
    for b in &result.bindings {
        out.push_str(&format!(
            "\n  PID {:<6} {:<24} {:<22} {:<12} {} ({})",
            b.pid,
            b.process_name,
            b.address(),
            b.state,
            b.scope_description(),
            b.process_status()
        ));
    }
    out
}

pub async fn ports_scan(
    app: &App,
    port: Option<u16>,
    report: bool,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let port = port.unwrap_or(app.config.ui.default_port);
    let Some(result) = app.cancellable(ports::scan_port(app.runner.as_ref(), port)).await else {
        return Ok(cancelled(handler));
    };
    let result = result.with_context(|| format!("Failed to scan port {port}"))?;

    let human = if report {
        result.report()
    } else {
        scan_summary(&result)
    };
    handler.data(true, &human, &serde_json::to_value(&result)?);
    Ok(EXIT_OK)
}

pub async fn ports_suggest(
    app: &App,
    start: Option<u16>,
    end: Option<u16>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let start = start.unwrap_or(app.config.ports.suggest_start);
    let end = end.unwrap_or(app.config.ports.suggest_end);
    let Some(found) = app
        .cancellable(ports::suggest_free_port(app.runner.as_ref(), start, end))
        .await
    else {
        return Ok(cancelled(handler));
    };

    match found.context("Failed to list used ports")? {
        Some(port) => {
            handler.data(true, &port.to_string(), &json!({ "port": port }));
            Ok(EXIT_OK)
        }
        None => {
            handler.data(
                false,
                &format!("No free port in {start}-{end}"),
                &json!({ "port": null, "start": start, "end": end }),
            );
            Ok(EXIT_FAILURE)
        }
    }
}

/// Kill a process by PID (shared by `ports kill` and `processes kill`)
pub async fn kill_process(app: &App, pid: u32, handler: &dyn OutputHandler) -> Result<i32> {
    let Some(result) = app.cancellable(ports::kill_process(app.runner.as_ref(), pid)).await else {
        return Ok(cancelled(handler));
    };
    let result = result.with_context(|| format!("Failed to kill PID {pid}"))?;

    let outcome = ActionOutcome {
        action: "processes.kill".into(),
        results: vec![result],
    };
    app.record(|h| h.record_action(&outcome));
    handler.data(
        true,
        &format!("Killed PID {pid}"),
        &json!({ "pid": pid, "result": outcome.results.first() }),
    );
    Ok(EXIT_OK)
}

pub async fn ports_diagnose(app: &App, port: u16, handler: &dyn OutputHandler) -> Result<i32> {
    let Some(diag) = app
        .cancellable(ports::socket_diagnostics(app.runner.as_ref(), port))
        .await
    else {
        return Ok(cancelled(handler));
    };
    let diag = diag.with_context(|| format!("Failed to inspect http.sys for port {port}"))?;

    let mut human = format!("http.sys diagnostics for port {port}");
    for (title, urls) in [
        ("URL reservations", &diag.reservations),
        ("Request queues", &diag.queue_urls),
    ] {
        human.push_str(&format!("\n{title}:"));
        if urls.is_empty() {
            human.push_str("\n  (none)");
        }
        for url in urls {
            human.push_str(&format!("\n  {url}"));
        }
    }
    human.push_str("\nGuidance:");
    for line in &diag.guidance {
        human.push_str(&format!("\n  - {line}"));
    }

    handler.data(true, &human, &serde_json::to_value(&diag)?);
    Ok(EXIT_OK)
}

pub async fn processes_list(
    app: &App,
    sort: SortKey,
    limit: usize,
    report: bool,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let Some(found) = app
        .cancellable(processes::top_processes(app.runner.as_ref(), sort, limit))
        .await
    else {
        return Ok(cancelled(handler));
    };
    let found = found.context("Failed to list processes")?;

    let human = if report {
        processes::report(&found)
    } else {
        let mut out = format!(
            "{:<28} {:>7} {:>8} {:>10} {:>9}",
            "Process", "PID", "Handles", "Memory MB", "CPU s"
        );
        for p in &found {
            out.push_str(&format!(
                "\n{:<28} {:>7} {:>8} {:>10.1} {:>9.1}",
                p.name, p.pid, p.handle_count, p.memory_mb, p.cpu_seconds
            ));
        }
        out
    };
    handler.data(true, &human, &serde_json::to_value(&found)?);
    Ok(EXIT_OK)
}

pub async fn processes_overview(app: &App, handler: &dyn OutputHandler) -> Result<i32> {
    let Some(overview) = app
        .cancellable(processes::system_overview(app.runner.as_ref()))
        .await
    else {
        return Ok(cancelled(handler));
    };
    let overview = overview.context("Failed to read system overview")?;

    let human = format!(
        "Memory:    {:.1} / {:.1} GB used\nCPUs:      {}\nProcesses: {}",
        overview.used_memory_gb, overview.total_memory_gb, overview.cpu_count, overview.process_count
    );
    handler.data(true, &human, &serde_json::to_value(&overview)?);
    Ok(EXIT_OK)
}

/// Repairs exposed by `network fix`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum NetworkFix {
    FlushDns,
    RenewIp,
    WinsockReset,
    RestartHttp,
}

impl NetworkFix {
    pub fn reference(self) -> &'static str {
        match self {
            Self::FlushDns => "network.flush_dns",
            Self::RenewIp => "network.renew_ip",
            Self::WinsockReset => "network.winsock_reset",
            Self::RestartHttp => "network.restart_http",
        }
    }
}

pub async fn network_adapters(app: &App, handler: &dyn OutputHandler) -> Result<i32> {
    let Some(adapters) = app.cancellable(network::list_adapters(app.runner.as_ref())).await else {
        return Ok(cancelled(handler));
    };
    let adapters = adapters.context("Failed to read adapter configuration")?;

    let mut lines = Vec::new();
    for adapter in &adapters {
        let state = if adapter.is_up { "up" } else { "down" };
        lines.push(format!("{} [{}]", adapter.name, state));
        if !adapter.description.is_empty() {
            lines.push(format!("  {}", adapter.description));
        }
        for address in &adapter.addresses {
            lines.push(format!("  {address}"));
        }
    }
    handler.data(true, &lines.join("\n"), &serde_json::to_value(&adapters)?);
    Ok(EXIT_OK)
}

pub async fn network_ping(
    app: &App,
    host: Option<String>,
    count: Option<u32>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let host = host.unwrap_or_else(|| app.config.network.ping_target.clone());
    let count = count.unwrap_or(app.config.network.ping_count);
    let Some(pinged) = app
        .cancellable(network::ping_host(app.runner.as_ref(), &host, count))
        .await
    else {
        return Ok(cancelled(handler));
    };
    let (result, summary) = pinged.with_context(|| format!("Failed to ping {host}"))?;

    let success = summary
        .as_ref()
        .map(|s| s.reachable())
        .unwrap_or_else(|| result.succeeded());
    let mut human = result.display_output();
    if let Some(s) = &summary {
        let average = s
            .average_ms
            .map(|ms| format!(", average {ms} ms"))
            .unwrap_or_default();
        human.push_str(&format!(
            "\n\n{host}: {}/{} replies, {}% loss{average}",
            s.received, s.sent, s.loss_percent
        ));
    }

    let outcome = ActionOutcome {
        action: "network.ping_host".into(),
        results: vec![result],
    };
    app.record(|h| h.record_action(&outcome));
    handler.data(
        success,
        human.trim(),
        &json!({ "host": host, "count": count, "summary": summary, "exit_code": outcome.results.first().map(|r| r.exit_code) }),
    );
    Ok(exit_code(success))
}

pub async fn network_head(
    app: &App,
    url: Option<String>,
    timeout: Duration,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let url = url.unwrap_or_else(|| app.config.network.probe_host.clone());
    let Some(head) = app.cancellable(network::http_head(&url, timeout)).await else {
        return Ok(cancelled(handler));
    };
    let head = head?;

    let mut human = format!("HTTP {} {} ({} ms)", head.status, head.url, head.elapsed_ms);
    for (name, value) in &head.headers {
        human.push_str(&format!("\n  {name}: {value}"));
    }
    handler.data(head.is_success(), &human, &serde_json::to_value(&head)?);
    Ok(exit_code(head.is_success()))
}

pub async fn services_list(
    app: &App,
    filter: Option<&str>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let Some(found) = app
        .cancellable(services::list_services(app.runner.as_ref(), filter))
        .await
    else {
        return Ok(cancelled(handler));
    };
    let found = found.context("Failed to list services")?;

    let mut human = format!("{:<32} {:<10} {:<10} {}", "Name", "Status", "Start", "Display name");
    for s in &found {
        human.push_str(&format!(
            "\n{:<32} {:<10} {:<10} {}",
            s.name, s.status, s.start_type, s.display_name
        ));
    }
    let running = found.iter().filter(|s| s.is_running()).count();
    human.push_str(&format!("\n\n{running} of {} running", found.len()));
    handler.data(true, &human, &serde_json::to_value(&found)?);
    Ok(EXIT_OK)
}

pub async fn services_control(
    app: &App,
    verb: ServiceVerb,
    name: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let runner = app.runner.as_ref();
    let future = async {
        match verb {
            ServiceVerb::Start => services::start_service(runner, name).await,
            ServiceVerb::Stop => services::stop_service(runner, name).await,
            ServiceVerb::Restart => services::restart_service(runner, name).await,
        }
    };
    let Some(result) = app.cancellable(future).await else {
        return Ok(cancelled(handler));
    };
    let result = result.with_context(|| format!("Failed to {} service '{name}'", verb.id()))?;

    let outcome = ActionOutcome {
        action: format!("services.{}", verb.id()),
        results: vec![result],
    };
    app.record(|h| h.record_action(&outcome));
    handler.data(
        true,
        &format!("{}: {name} done", verb.label()),
        &serde_json::to_value(&outcome)?,
    );
    Ok(EXIT_OK)
}

pub async fn services_show(app: &App, name: &str, handler: &dyn OutputHandler) -> Result<i32> {
    let Some(info) = app
        .cancellable(services::service_details(app.runner.as_ref(), name))
        .await
    else {
        return Ok(cancelled(handler));
    };
    let info = info.with_context(|| format!("Failed to query service '{name}'"))?;

    let human = format!(
        "Name:         {}\nDisplay name: {}\nStatus:       {}\nStart type:   {}",
        info.name, info.display_name, info.status, info.start_type
    );
    handler.data(true, &human, &serde_json::to_value(&info)?);
    Ok(EXIT_OK)
}

pub fn hosts_list(app: &App, handler: &dyn OutputHandler) -> Result<i32> {
    let file = HostsFile::from_config(&app.config);
    let entries = file.entries()?;

    let mut human = format!(
        "{} ({})",
        file.path.display(),
        if file.is_writable() { "writable" } else { "read-only" }
    );
    for entry in &entries {
        let mark = if entry.enabled { " " } else { "#" };
        human.push_str(&format!(
            "\n{mark} {:<16} {}",
            entry.ip,
            entry.hostnames.join(" ")
        ));
        if let Some(comment) = entry.comment.as_deref().filter(|c| !c.is_empty()) {
            human.push_str(&format!("  # {comment}"));
        }
    }
    handler.data(
        true,
        &human,
        &json!({ "path": file.path, "entries": entries }),
    );
    Ok(EXIT_OK)
}

/// Apply a text edit to the hosts file, then flush the resolver cache
async fn edit_hosts(
    app: &App,
    handler: &dyn OutputHandler,
    edit: impl FnOnce(&str) -> Result<(String, String), HostsError>,
) -> Result<i32> {
    let file = HostsFile::from_config(&app.config);
    let current = file.read()?;
    let (updated, message) = edit(&current)?;

    let backup = file.write(&updated).map_err(|e| match e {
        HostsError::Write { .. } => anyhow!(e).context("Editing the hosts file needs administrator rights"),
        other => anyhow!(other),
    })?;

    let mut human = message;
    if let Some(path) = &backup {
        human.push_str(&format!("\nBackup: {}", path.display()));
    }

    let flushed = match app.registry.lookup("hosts.flush_after_edit") {
        Ok(action) => {
            let run = execute_action(
                app.runner.as_ref(),
                &TemplateEngine::new(),
                "hosts.flush_after_edit",
                action,
                &BTreeMap::new(),
            )
            .await;
            match run {
                Ok(outcome) => outcome.all_succeeded(),
                Err(e) => {
                    warn!(error = %e, "DNS flush after hosts edit failed");
                    false
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "DNS flush action unavailable");
            false
        }
    };
    if !flushed {
        human.push_str("\nDNS cache was not flushed; run 'sanity network fix flush-dns'");
    }

    handler.data(
        true,
        &human,
        &json!({ "path": file.path, "backup": backup, "dns_flushed": flushed }),
    );
    Ok(EXIT_OK)
}

pub async fn hosts_add(
    app: &App,
    ip: &str,
    hostname: &str,
    comment: Option<&str>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    edit_hosts(app, handler, |text| {
        let updated = hosts::add_entry(text, ip, hostname, comment)?;
        Ok((updated, format!("Added {ip} {hostname}")))
    })
    .await
}

pub async fn hosts_remove(app: &App, hostname: &str, handler: &dyn OutputHandler) -> Result<i32> {
    edit_hosts(app, handler, |text| {
        let updated = hosts::remove_entry(text, hostname)?;
        Ok((updated, format!("Removed {hostname}")))
    })
    .await
}

pub async fn hosts_toggle(app: &App, hostname: &str, handler: &dyn OutputHandler) -> Result<i32> {
    edit_hosts(app, handler, |text| {
        let (updated, enabled) = hosts::toggle_entry(text, hostname)?;
        let state = if enabled { "Enabled" } else { "Disabled" };
        Ok((updated, format!("{state} {hostname}")))
    })
    .await
}

pub fn list_tools(app: &App, handler: &dyn OutputHandler) -> Result<i32> {
    let mut lines = Vec::new();
    let mut data = Vec::new();

    for tool in app.registry.tools() {
        lines.push(format!("{} - {}", tool.name(), tool.description()));
        for action in tool.actions() {
            let admin = if action.requires_admin { " [admin]" } else { "" };
            lines.push(format!(
                "  {}.{:<18} {}{admin}",
                tool.name(),
                action.id,
                action.label
            ));
            for param in &action.params {
                let detail = match (&param.default, param.required) {
                    (Some(default), _) => format!("default {default}"),
                    (None, true) => "required".to_string(),
                    (None, false) => "optional".to_string(),
                };
                lines.push(format!("      {}: {} ({detail})", param.name, param.description));
            }
        }
        data.push(json!({
            "name": tool.name(),
            "description": tool.description(),
            "actions": tool.actions(),
        }));
    }

    handler.data(true, &lines.join("\n"), &json!(data));
    Ok(EXIT_OK)
}

/// Resolve and run one `tool.action`
pub async fn run_action(
    app: &App,
    reference: &str,
    params: BTreeMap<String, String>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let action = app.registry.lookup(reference)?;
    if action.requires_admin && !app.runner.is_admin() {
        bail!(
            "{reference} requires administrator rights; run it from an elevated prompt or with 'sanity elevate action {reference}'"
        );
    }

    handler.emit(OutputEvent::ActionStart {
        action: reference.to_string(),
        commands: action.steps.len(),
    });
    let engine = TemplateEngine::new();
    let Some(outcome) = app
        .cancellable(execute_action(app.runner.as_ref(), &engine, reference, action, &params))
        .await
    else {
        return Ok(cancelled(handler));
    };
    let outcome = outcome.with_context(|| format!("Action {reference} failed"))?;

    for result in &outcome.results {
        handler.emit(OutputEvent::CommandComplete {
            command: result.command.clone(),
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            output: result.display_output(),
        });
    }
    app.record(|h| h.record_action(&outcome));

    let success = outcome.all_succeeded();
    let human = if success {
        format!("✓ {reference} ({} commands)", outcome.results.len())
    } else {
        let codes: Vec<String> = outcome
            .failed_exit_codes()
            .iter()
            .map(i32::to_string)
            .collect();
        format!("✗ {reference} failed (exit codes {})", codes.join(", "))
    };
    handler.data(success, &human, &serde_json::to_value(&outcome)?);
    Ok(exit_code(success))
}

pub fn list_workflows(app: &App, handler: &dyn OutputHandler) -> Result<i32> {
    let entries = app.catalog().list();
    if entries.is_empty() {
        handler.data(true, "(no workflows found)", &json!([]));
        return Ok(EXIT_OK);
    }

    let mut lines = Vec::new();
    for entry in &entries {
        match &entry.error {
            Some(err) => lines.push(format!("✗ {:<24} [{}] {}", entry.name, entry.source, err)),
            None => lines.push(format!(
                "  {:<24} [{}] {} steps  {}",
                entry.name, entry.source, entry.steps, entry.description
            )),
        }
        if let Some(path) = &entry.path {
            lines.push(format!("      {}", path.display()));
        }
    }
    handler.data(true, &lines.join("\n"), &serde_json::to_value(&entries)?);
    Ok(EXIT_OK)
}

pub fn validate_workflow(app: &App, name: &str, handler: &dyn OutputHandler) -> Result<i32> {
    let (workflow, entry) = app.catalog().load(name)?;

    let errors = match validate_with(&workflow, &app.registry) {
        Ok(()) => {
            let order = topological_sort(&workflow)?;
            let human = format!(
                "✓ Workflow '{}' is valid ({} steps)\n  order: {}",
                workflow.name,
                workflow.steps.len(),
                order.join(" -> ")
            );
            handler.data(
                true,
                &human,
                &json!({ "name": workflow.name, "source": entry.source, "valid": true, "order": order }),
            );
            return Ok(EXIT_OK);
        }
        Err(WorkflowError::Invalid { errors, .. }) => errors,
        Err(e) => vec![e.to_string()],
    };

    let mut human = format!(
        "✗ Workflow '{}' has {} error(s):",
        workflow.name,
        errors.len()
    );
    for err in &errors {
        human.push_str(&format!("\n  - {err}"));
    }
    handler.data(
        false,
        &human,
        &json!({ "name": workflow.name, "source": entry.source, "valid": false, "errors": errors }),
    );
    Ok(EXIT_FAILURE)
}

pub async fn run_workflow(
    app: &App,
    name: &str,
    args: &[String],
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let (workflow, entry) = app.catalog().load(name)?;
    info!(workflow = %workflow.name, source = %entry.source, "loaded workflow");

    let engine = WorkflowEngine::new(Arc::clone(&app.registry), Arc::clone(&app.runner));
    let run = engine
        .execute(&workflow, parse_workflow_args(args), Some(&app.cancel), handler)
        .await?;
    app.record(|h| h.record_workflow(&run));

    let final_output = run
        .steps
        .iter()
        .rev()
        .map(|s| s.output())
        .find(|o| !o.is_empty())
        .unwrap_or_default();
    handler.data(run.success, &final_output, &serde_json::to_value(&run)?);

    Ok(if run.cancelled {
        EXIT_CANCELLED
    } else {
        exit_code(run.success)
    })
}

pub fn show_history(
    app: &App,
    limit: usize,
    clear: bool,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let path = app
        .history_path
        .as_deref()
        .context("History database location is unavailable")?;
    let mut history = History::open(path)?;

    if clear {
        let removed = history.clear()?;
        handler.data(true, &format!("Removed {removed} run(s)"), &json!({ "removed": removed }));
        return Ok(EXIT_OK);
    }

    let runs = history.recent(limit)?;
    if runs.is_empty() {
        handler.data(true, "(no runs recorded)", &json!([]));
        return Ok(EXIT_OK);
    }
    let lines: Vec<String> = runs
        .iter()
        .map(|run| {
            let status = if run.success { "ok" } else { "FAIL" };
            let duration = run
                .duration_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_default();
            let mut line = format!(
                "{}  {:<8} {:<28} {:<4} {:>8}",
                run.created_at, run.kind, run.name, status, duration
            );
            if let Some(detail) = &run.detail {
                line.push_str(&format!("  {detail}"));
            }
            line
        })
        .collect();
    handler.data(true, &lines.join("\n"), &serde_json::to_value(&runs)?);
    Ok(EXIT_OK)
}

pub fn settings_show(app: &App, handler: &dyn OutputHandler) -> Result<i32> {
    let text = app.config.to_toml()?;
    handler.data(true, text.trim_end(), &serde_json::to_value(&app.config)?);
    Ok(EXIT_OK)
}

pub fn settings_path(app: &App, handler: &dyn OutputHandler) -> Result<i32> {
    let config = match &app.config_path {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };
    let root = paths::app_root()?;
    let human = format!(
        "config:    {}\napp root:  {}\nlogs:      {}\nworkflows: {}\nhistory:   {}",
        config.display(),
        root.display(),
        paths::logs_dir()?.display(),
        paths::workflows_dir()?.display(),
        paths::history_db_path()?.display()
    );
    handler.data(
        true,
        &human,
        &json!({
            "config": config,
            "app_root": root,
            "logs": paths::logs_dir()?,
            "workflows": paths::workflows_dir()?,
            "history": paths::history_db_path()?,
        }),
    );
    Ok(EXIT_OK)
}

/// Update one setting in the file it came from (`--config`, or the user file)
pub fn settings_set(app: &App, key: &str, value: &str, handler: &dyn OutputHandler) -> Result<i32> {
    let existing = match &app.config_path {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };
    let mut config = if existing.exists() {
        AppConfig::load_file(&existing)?
    } else {
        AppConfig::default()
    };

    config.set(key, value).map_err(|e| match e {
        ConfigError::UnknownKey { .. } => {
            anyhow!("{e} (settable keys: {})", SETTABLE_KEYS.join(", "))
        }
        other => anyhow!(other),
    })?;
    let target = match &app.config_path {
        Some(path) => {
            config.save_to(path)?;
            path.clone()
        }
        None => config.save()?,
    };

    handler.data(
        true,
        &format!("{key} = {value} ({})", target.display()),
        &json!({ "key": key, "value": value, "path": target }),
    );
    Ok(EXIT_OK)
}

fn required_executables() -> Vec<String> {
    let mut names: Vec<String> = if cfg!(windows) {
        ["ipconfig", "netsh", "netstat", "tasklist", "taskkill", "ping", "net"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        ["netstat", "ping", "kill"].iter().map(|s| s.to_string()).collect()
    };
    names.push(powershell_program());
    names
}

fn doctor_probes() -> Vec<(&'static str, CommandSpec)> {
    vec![
        (
            "PowerShell",
            CommandSpec::powershell("$PSVersionTable.PSVersion.ToString()").with_timeout(20.0),
        ),
        (
            "Loopback ping",
            CommandSpec::process(["ping", PING_COUNT_FLAG, "1", "127.0.0.1"]).with_timeout(15.0),
        ),
    ]
}

/// Check elevation, paths and the OS tools the diagnostics depend on
pub async fn doctor(app: &App, handler: &dyn OutputHandler) -> Result<i32> {
    let mut all_ok = true;
    let mut lines = vec![
        format!("User:     {}", admin::current_user()),
        format!(
            "Elevated: {}",
            if app.runner.is_admin() { "yes" } else { "no" }
        ),
    ];

    let root = match paths::app_root() {
        Ok(root) => {
            let state = if root.is_dir() { "exists" } else { "missing" };
            lines.push(format!("App root: {} ({state})", root.display()));
            Some(root)
        }
        Err(e) => {
            all_ok = false;
            lines.push(format!("✗ App root: {e}"));
            None
        }
    };

    lines.push("\nExecutables:".into());
    let mut executables = Vec::new();
    for name in required_executables() {
        let found = find_executable(&name);
        match &found {
            Some(path) => lines.push(format!("  ✓ {name} ({})", path.display())),
            None => {
                all_ok = false;
                lines.push(format!("  ✗ {name} (not found on PATH)"));
            }
        }
        executables.push(json!({ "name": name, "path": found }));
    }

    lines.push("\nProbes:".into());
    let probes = doctor_probes();
    let pool = SequenceRunner::new(Arc::clone(&app.runner), app.config.exec.max_workers);
    let batches = probes.iter().map(|(_, spec)| vec![spec.clone()]).collect();
    let Some(results) = app.cancellable(pool.run_all(batches)).await else {
        return Ok(cancelled(handler));
    };

    let mut probe_data = Vec::new();
    for ((label, _), result) in probes.iter().zip(results) {
        let (ok, detail) = match result {
            Ok(results) if results.iter().all(CommandResult::succeeded) => (
                true,
                results
                    .first()
                    .map(|r| r.stdout.lines().next().unwrap_or("").trim().to_string())
                    .unwrap_or_default(),
            ),
            Ok(results) => (
                false,
                format!(
                    "exit code {}",
                    results.last().map(|r| r.exit_code).unwrap_or(-1)
                ),
            ),
            Err(e) => (false, e.to_string()),
        };
        all_ok &= ok;
        let mark = if ok { "✓" } else { "✗" };
        lines.push(format!("  {mark} {label} {detail}").trim_end().to_string());
        probe_data.push(json!({ "name": label, "success": ok, "detail": detail }));
    }

    handler.data(
        all_ok,
        &lines.join("\n"),
        &json!({
            "user": admin::current_user(),
            "elevated": app.runner.is_admin(),
            "app_root": root,
            "executables": executables,
            "probes": probe_data,
        }),
    );
    Ok(exit_code(all_ok))
}

pub async fn elevate(app: &App, args: &[String], handler: &dyn OutputHandler) -> Result<i32> {
    if app.runner.is_admin() {
        handler.result(true, Some("Already running with administrator rights"));
        return Ok(EXIT_OK);
    }
    admin::relaunch_elevated(args)
        .await
        .context("Failed to relaunch with administrator rights")?;
    handler.result(true, Some("Started an elevated instance"));
    Ok(EXIT_OK)
}

/// Run `program` with `args` passed through untouched; returns its exit code
pub async fn exec_passthrough(app: &App, program: &str, args: &[String]) -> i32 {
    debug!(program, ?args, "exec");
    let spawned = tokio::process::Command::new(program)
        .args(args)
        .current_dir(&app.working_dir)
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            error!(program, error = %e, "failed to start program");
            eprintln!("Error: failed to start '{program}': {e}");
            return EXIT_SPAWN_FAILED;
        }
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                let code = crate::process::exit_status_code(&status);
                if code < 0 { EXIT_FAILURE } else { code }
            }
            Err(e) => {
                error!(program, error = %e, "failed to wait for program");
                EXIT_FAILURE
            }
        },
        _ = app.cancel.cancelled() => {
            warn!(program, "interrupted, killing program");
            let _ = child.kill().await;
            EXIT_CANCELLED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::output::testing::RecordingHandler;
    use crate::exec::testing::FakeRunner;
    use std::path::Path;
    use tempfile::TempDir;

    const NETSTAT: &str = "
  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:3010           0.0.0.0:0              LISTENING       5120
  TCP    127.0.0.1:3010         0.0.0.0:0              LISTENING       5120
";
    const TASKLIST: &str = "\"node.exe\",\"5120\",\"Console\",\"1\",\"80,112 K\"\n";

    fn test_app(runner: Arc<FakeRunner>, dir: &Path) -> App {
        let mut config = AppConfig::default();
        config.hosts.path = Some(dir.join("hosts").to_string_lossy().to_string());
        config.hosts.backup = false;
        App {
            registry: Arc::new(builtin_registry(&config)),
            config,
            config_path: None,
            working_dir: dir.to_path_buf(),
            runner,
            cancel: CancellationToken::new(),
            history_path: Some(dir.join("history.db")),
        }
    }

    fn last_result(handler: &RecordingHandler) -> (bool, String) {
        let (success, output) = handler.results().pop().unwrap();
        (success, output.unwrap_or_default())
    }

    #[test]
    fn test_parse_workflow_args_key_value() {
        let args = vec!["name=test".to_string(), "count=5".to_string()];
        let parsed = parse_workflow_args(&args);

        assert_eq!(parsed.get("name"), Some(&"test".to_string()));
        assert_eq!(parsed.get("count"), Some(&"5".to_string()));
    }

    #[test]
    fn test_parse_workflow_args_positional() {
        let args = vec!["first".to_string(), "second".to_string()];
        let parsed = parse_workflow_args(&args);

        assert_eq!(parsed.get("arg0"), Some(&"first".to_string()));
        assert_eq!(parsed.get("arg1"), Some(&"second".to_string()));
    }

    #[test]
    fn test_parse_workflow_args_mixed() {
        let args = vec![
            "key=value".to_string(),
            "positional".to_string(),
            "url=http://a/?x=1".to_string(),
        ];
        let parsed = parse_workflow_args(&args);

        assert_eq!(parsed.get("arg0"), Some(&"positional".to_string()));
        assert_eq!(parsed.get("key"), Some(&"value".to_string()));
        // Only the first '=' separates key and value
        assert_eq!(parsed.get("url"), Some(&"http://a/?x=1".to_string()));
    }

    #[tokio::test]
    async fn test_ports_scan_reports_conflict() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            FakeRunner::new()
                .respond("netstat", 0, NETSTAT)
                .respond("tasklist", 0, TASKLIST),
        );
        let app = test_app(runner, dir.path());
        let handler = RecordingHandler::default();

        let code = ports_scan(&app, None, false, &handler).await.unwrap();
        assert_eq!(code, EXIT_OK);
        let (success, output) = last_result(&handler);
        assert!(success);
        assert!(output.starts_with("Port 3010 is in use by 2 binding(s)"));
        assert!(output.contains("conflict: PID 5120"));
        assert!(output.contains("node.exe"));
    }

    #[tokio::test]
    async fn test_ports_suggest_empty_range_fails() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new().respond("netstat", 0, NETSTAT));
        let app = test_app(runner, dir.path());
        let handler = RecordingHandler::default();

        let code = ports_suggest(&app, Some(4000), Some(3999), &handler)
            .await
            .unwrap();
        assert_eq!(code, EXIT_FAILURE);
        assert_eq!(last_result(&handler).1, "No free port in 4000-3999");
    }

    #[tokio::test]
    async fn test_services_list_counts_running() {
        let dir = TempDir::new().unwrap();
        let services = r#"[
            {"Name":"W3SVC","DisplayName":"World Wide Web Publishing Service","Status":"Running","StartType":"Automatic"},
            {"Name":"Spooler","DisplayName":"Print Spooler","Status":"Stopped","StartType":"Manual"}
        ]"#;
        let runner = Arc::new(FakeRunner::new().respond("Get-Service", 0, services));
        let app = test_app(runner, dir.path());
        let handler = RecordingHandler::default();

        let code = services_list(&app, None, &handler).await.unwrap();
        assert_eq!(code, EXIT_OK);
        let (success, output) = last_result(&handler);
        assert!(success);
        assert!(output.ends_with("1 of 2 running"), "{output}");
    }

    #[tokio::test]
    async fn test_processes_overview() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new().respond(
            "Win32_OperatingSystem",
            0,
            r#"{"TotalVisibleMemorySize":8388608,"FreePhysicalMemory":2097152,"NumberOfLogicalProcessors":4,"ProcessCount":97}"#,
        ));
        let app = test_app(runner, dir.path());
        let handler = RecordingHandler::default();

        let code = processes_overview(&app, &handler).await.unwrap();
        assert_eq!(code, EXIT_OK);
        let (success, output) = last_result(&handler);
        assert!(success);
        assert_eq!(
            output,
            "Memory:    6.0 / 8.0 GB used\nCPUs:      4\nProcesses: 97"
        );
    }

    #[tokio::test]
    async fn test_kill_pid_zero_is_rejected() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let app = test_app(Arc::clone(&runner), dir.path());
        let handler = RecordingHandler::default();

        let err = kill_process(&app, 0, &handler).await.unwrap_err();
        assert!(format!("{err:#}").contains("refusing to kill PID 0"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_action_emits_events_and_records_history() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new().respond("ipconfig", 0, "Successfully flushed"));
        let app = test_app(runner, dir.path());
        let handler = RecordingHandler::default();

        let code = run_action(&app, "network.flush_dns", BTreeMap::new(), &handler)
            .await
            .unwrap();
        assert_eq!(code, EXIT_OK);

        let events = handler.events();
        assert!(matches!(
            &events[0],
            OutputEvent::ActionStart { action, commands: 1 } if action == "network.flush_dns"
        ));
        assert!(matches!(
            &events[1],
            OutputEvent::CommandComplete { exit_code: 0, output, .. } if output == "Successfully flushed"
        ));

        let history = History::open(&dir.path().join("history.db")).unwrap();
        let runs = history.recent(5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name, "network.flush_dns");
        assert!(runs[0].success);
    }

    #[tokio::test]
    async fn test_run_action_failure_exit_code() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new().respond("ipconfig", 1, ""));
        let app = test_app(runner, dir.path());
        let handler = RecordingHandler::default();

        let code = run_action(&app, "network.renew_ip", BTreeMap::new(), &handler)
            .await
            .unwrap();
        assert_eq!(code, EXIT_FAILURE);
        let (success, output) = last_result(&handler);
        assert!(!success);
        assert_eq!(output, "✗ network.renew_ip failed (exit codes 1, 1)");
    }

    #[tokio::test]
    async fn test_run_action_admin_required() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let app = test_app(Arc::clone(&runner), dir.path());
        let handler = RecordingHandler::default();

        let err = run_action(&app, "network.winsock_reset", BTreeMap::new(), &handler)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires administrator rights"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_action_unknown_reference() {
        let dir = TempDir::new().unwrap();
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());
        let handler = RecordingHandler::default();

        let err = run_action(&app, "network.flush_dsn", BTreeMap::new(), &handler)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did you mean 'flush_dns'"));
    }

    #[tokio::test]
    async fn test_hosts_edit_cycle() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hosts"), "127.0.0.1\tlocalhost\n").unwrap();
        let runner = Arc::new(FakeRunner::new().respond("ipconfig", 0, ""));
        let app = test_app(Arc::clone(&runner), dir.path());
        let handler = RecordingHandler::default();

        hosts_add(&app, "10.0.0.5", "api.local", Some("dev"), &handler)
            .await
            .unwrap();
        hosts_toggle(&app, "api.local", &handler).await.unwrap();
        assert_eq!(last_result(&handler).1, "Disabled api.local");

        let text = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        let entries = hosts::parse_hosts(&text);
        let api = entries.iter().find(|e| e.has_hostname("api.local")).unwrap();
        assert!(!api.enabled);

        hosts_remove(&app, "api.local", &handler).await.unwrap();
        let text = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert_eq!(text, "127.0.0.1\tlocalhost\n");
        // One flush per edit
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_hosts_flush_failure_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hosts"), "").unwrap();
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());
        let handler = RecordingHandler::default();

        let code = hosts_add(&app, "10.0.0.5", "api.local", None, &handler)
            .await
            .unwrap();
        assert_eq!(code, EXIT_OK);
        assert!(last_result(&handler).1.contains("DNS cache was not flushed"));
    }

    #[tokio::test]
    async fn test_hosts_add_rejects_duplicate() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hosts"), "127.0.0.1 api.local\n").unwrap();
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());
        let handler = RecordingHandler::default();

        assert!(
            hosts_add(&app, "10.0.0.5", "api.local", None, &handler)
                .await
                .is_err()
        );
    }

    fn write_workflow(dir: &Path, name: &str, body: &str) {
        let workflows = dir.join("workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(workflows.join(format!("{name}.toml")), body).unwrap();
    }

    #[tokio::test]
    async fn test_run_workflow_success_and_history() {
        let dir = TempDir::new().unwrap();
        write_workflow(
            dir.path(),
            "flush",
            r#"
name = "flush"

[[steps]]
name = "flush"
action = "network.flush_dns"
"#,
        );
        let runner = Arc::new(FakeRunner::new().respond("ipconfig", 0, "flushed"));
        let app = test_app(runner, dir.path());
        let handler = RecordingHandler::default();

        let code = run_workflow(&app, "flush", &[], &handler).await.unwrap();
        assert_eq!(code, EXIT_OK);
        assert_eq!(last_result(&handler), (true, "flushed".to_string()));

        let history = History::open(&dir.path().join("history.db")).unwrap();
        assert_eq!(history.recent(1).unwrap()[0].name, "flush");
    }

    #[tokio::test]
    async fn test_run_workflow_cancelled_exit_code() {
        let dir = TempDir::new().unwrap();
        write_workflow(
            dir.path(),
            "flush",
            "name = \"flush\"\n\n[[steps]]\naction = \"network.flush_dns\"\n",
        );
        let runner = Arc::new(FakeRunner::new().respond("ipconfig", 0, ""));
        let app = test_app(Arc::clone(&runner), dir.path());
        app.cancel.cancel();
        let handler = RecordingHandler::default();

        let code = run_workflow(&app, "flush", &[], &handler).await.unwrap();
        assert_eq!(code, EXIT_CANCELLED);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_validate_workflow_reports_errors() {
        let dir = TempDir::new().unwrap();
        write_workflow(
            dir.path(),
            "broken",
            "name = \"broken\"\n\n[[steps]]\nname = \"a\"\naction = \"network.nope\"\n",
        );
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());
        let handler = RecordingHandler::default();

        let code = validate_workflow(&app, "broken", &handler).unwrap();
        assert_eq!(code, EXIT_FAILURE);
        let (success, output) = last_result(&handler);
        assert!(!success);
        assert!(output.starts_with("✗ Workflow 'broken' has"));
        assert!(output.contains("has no action 'nope'"));
    }

    #[test]
    fn test_validate_builtin_sample() {
        let dir = TempDir::new().unwrap();
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());
        let handler = RecordingHandler::default();

        let code = validate_workflow(&app, "network-reset", &handler).unwrap();
        assert_eq!(code, EXIT_OK);
        assert!(last_result(&handler).1.contains("order: flush-dns"));
    }

    #[test]
    fn test_settings_set_writes_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        let mut app = test_app(Arc::new(FakeRunner::new()), dir.path());
        app.config_path = Some(path.clone());
        let handler = RecordingHandler::default();

        settings_set(&app, "ui.default_port", "4000", &handler).unwrap();
        let saved = AppConfig::load_file(&path).unwrap();
        assert_eq!(saved.ui.default_port, 4000);

        let err = settings_set(&app, "ui.nope", "1", &handler).unwrap_err();
        assert!(err.to_string().contains("settable keys"));

        let err = settings_set(&app, "exec.default_timeout", "1e20", &handler).unwrap_err();
        assert!(err.to_string().contains("exec.default_timeout"));
        let saved = AppConfig::load_file(&path).unwrap();
        assert_eq!(saved.exec.default_timeout, crate::exec::DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_history_empty_and_clear() {
        let dir = TempDir::new().unwrap();
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());
        let handler = RecordingHandler::default();

        show_history(&app, 10, false, &handler).unwrap();
        assert_eq!(last_result(&handler).1, "(no runs recorded)");

        show_history(&app, 10, true, &handler).unwrap();
        assert_eq!(last_result(&handler).1, "Removed 0 run(s)");
    }

    #[test]
    fn test_list_tools_includes_admin_marker() {
        let dir = TempDir::new().unwrap();
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());
        let handler = RecordingHandler::default();

        list_tools(&app, &handler).unwrap();
        let output = last_result(&handler).1;
        assert!(output.contains("network - "));
        assert!(output.contains("network.winsock_reset"));
        assert!(output.contains("[admin]"));
    }

    #[test]
    fn test_network_fix_references_exist() {
        let registry = builtin_registry(&AppConfig::default());
        for fix in [
            NetworkFix::FlushDns,
            NetworkFix::RenewIp,
            NetworkFix::WinsockReset,
            NetworkFix::RestartHttp,
        ] {
            assert!(registry.lookup(fix.reference()).is_ok());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_passthrough_exit_codes() {
        let dir = TempDir::new().unwrap();
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());

        let args = vec!["-c".to_string(), "exit 3".to_string()];
        assert_eq!(exec_passthrough(&app, "sh", &args).await, 3);
        assert_eq!(
            exec_passthrough(&app, "definitely_not_a_real_command_12345", &[]).await,
            EXIT_SPAWN_FAILED
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_passthrough_killed_on_cancel() {
        let dir = TempDir::new().unwrap();
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());
        let trigger = app.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let code = exec_passthrough(&app, "sleep", &["10".to_string()]).await;
        assert_eq!(code, EXIT_CANCELLED);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_passthrough_preserves_arguments() {
        let dir = TempDir::new().unwrap();
        let app = test_app(Arc::new(FakeRunner::new()), dir.path());
        let out = dir.path().join("out.txt");

        let args = vec![
            "-c".to_string(),
            "printf '%s|' \"$@\" > out.txt".to_string(),
            "sh".to_string(),
            "a b".to_string(),
            "\"quoted\"".to_string(),
            "".to_string(),
        ];
        assert_eq!(exec_passthrough(&app, "sh", &args).await, 0);
        assert_eq!(
            std::fs::read_to_string(out).unwrap(),
            "a b|\"quoted\"||"
        );
    }
}

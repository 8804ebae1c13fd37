//! Process listing sorted by resource usage, plus a machine overview

use super::{DiagnosticError, parse_ps_json, run_checked};
use crate::exec::{CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub const ACCESS_DENIED: &str = "<access denied>";

const PROCESS_SCRIPT: &str = "Get-Process | Select-Object Id, ProcessName, HandleCount, \
WorkingSet64, CPU, Path | ConvertTo-Json -Compress";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub handle_count: u64,
    pub memory_mb: f64,
    pub cpu_seconds: f64,
    pub path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawProcess {
    id: u32,
    process_name: String,
    #[serde(default)]
    handle_count: Option<u64>,
    #[serde(default)]
    working_set64: Option<u64>,
    #[serde(default, rename = "CPU")]
    cpu: Option<f64>,
    #[serde(default)]
    path: Option<String>,
}

impl From<RawProcess> for ProcessInfo {
    fn from(raw: RawProcess) -> Self {
        let memory_mb = raw.working_set64.unwrap_or(0) as f64 / (1024.0 * 1024.0);
        Self {
            pid: raw.id,
            name: raw.process_name,
            handle_count: raw.handle_count.unwrap_or(0),
            memory_mb: (memory_mb * 10.0).round() / 10.0,
            cpu_seconds: raw.cpu.unwrap_or(0.0),
            path: raw
                .path
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| ACCESS_DENIED.to_string()),
        }
    }
}

/// Column used to rank processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Handles,
    Memory,
    Cpu,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "handles" => Ok(Self::Handles),
            "memory" | "mem" => Ok(Self::Memory),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown sort key '{other}' (handles, memory, cpu)")),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Handles => "handles",
            Self::Memory => "memory",
            Self::Cpu => "cpu",
        })
    }
}

/// Parse `Get-Process | ConvertTo-Json` output (one object or an array)
pub fn parse_process_json(text: &str) -> Result<Vec<ProcessInfo>, DiagnosticError> {
    Ok(parse_ps_json::<RawProcess>(text, "process list")?
        .into_iter()
        .map(ProcessInfo::from)
        .collect())
}

/// Sort descending by `key`, ties broken by PID, and keep the first `limit`
pub fn rank_processes(mut processes: Vec<ProcessInfo>, key: SortKey, limit: usize) -> Vec<ProcessInfo> {
    processes.sort_by(|a, b| {
        let ordering = match key {
            SortKey::Handles => b.handle_count.cmp(&a.handle_count),
            SortKey::Memory => b.memory_mb.partial_cmp(&a.memory_mb).unwrap_or(Ordering::Equal),
            SortKey::Cpu => b
                .cpu_seconds
                .partial_cmp(&a.cpu_seconds)
                .unwrap_or(Ordering::Equal),
        };
        ordering.then(a.pid.cmp(&b.pid))
    });
    processes.truncate(limit);
    processes
}

/// Processes using the most of `key`
pub async fn top_processes(
    runner: &dyn CommandRunner,
    key: SortKey,
    limit: usize,
) -> Result<Vec<ProcessInfo>, DiagnosticError> {
    let output = run_checked(runner, &CommandSpec::powershell(PROCESS_SCRIPT).with_timeout(30.0)).await?;
    Ok(rank_processes(parse_process_json(&output.stdout)?, key, limit))
}

const OVERVIEW_SCRIPT: &str = "$os = Get-CimInstance Win32_OperatingSystem; \
$cs = Get-CimInstance Win32_ComputerSystem; \
[pscustomobject]@{ TotalVisibleMemorySize = $os.TotalVisibleMemorySize; \
FreePhysicalMemory = $os.FreePhysicalMemory; \
NumberOfLogicalProcessors = $cs.NumberOfLogicalProcessors; \
ProcessCount = @(Get-Process).Count } | ConvertTo-Json -Compress";

const KB_PER_GB: f64 = 1024.0 * 1024.0;

/// Memory, CPU and process totals for the machine
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SystemOverview {
    pub total_memory_gb: f64,
    pub used_memory_gb: f64,
    pub cpu_count: usize,
    pub process_count: usize,
}

/// CIM reports memory in kilobytes
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawOverview {
    #[serde(default)]
    total_visible_memory_size: u64,
    #[serde(default)]
    free_physical_memory: u64,
    #[serde(default)]
    number_of_logical_processors: usize,
    #[serde(default)]
    process_count: usize,
}

pub fn parse_overview(text: &str) -> Result<SystemOverview, DiagnosticError> {
    let raw = parse_ps_json::<RawOverview>(text, "system overview")?
        .into_iter()
        .next()
        .ok_or_else(|| DiagnosticError::parse("system overview", "no output"))?;
    let used_kb = raw
        .total_visible_memory_size
        .saturating_sub(raw.free_physical_memory);
    Ok(SystemOverview {
        total_memory_gb: raw.total_visible_memory_size as f64 / KB_PER_GB,
        used_memory_gb: used_kb as f64 / KB_PER_GB,
        cpu_count: raw.number_of_logical_processors,
        process_count: raw.process_count,
    })
}

pub async fn system_overview(runner: &dyn CommandRunner) -> Result<SystemOverview, DiagnosticError> {
    let output = run_checked(runner, &CommandSpec::powershell(OVERVIEW_SCRIPT).with_timeout(30.0)).await?;
    parse_overview(&output.stdout)
}

/// Tab-separated report
pub fn report(processes: &[ProcessInfo]) -> String {
    let mut out = String::from("Process Name\tPID\tHandles\tPath\n");
    for p in processes {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            p.name, p.pid, p.handle_count, p.path
        ));
    }
    out
}

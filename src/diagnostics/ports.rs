//! Port scanning, conflicts and free-port suggestions

use super::{DiagnosticError, run_checked};
use crate::exec::{CommandResult, CommandRunner, CommandSpec};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, TcpListener};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info};

/// PIDs owned by the kernel rather than a user process
pub const SYSTEM_PIDS: [u32; 2] = [0, 4];

#[derive(Debug, Error)]
pub enum PortsError {
    #[error(transparent)]
    Diagnostic(#[from] DiagnosticError),

    #[error("refusing to kill PID {0}")]
    ProtectedPid(u32),
}

impl From<crate::exec::ExecError> for PortsError {
    fn from(err: crate::exec::ExecError) -> Self {
        Self::Diagnostic(err.into())
    }
}

/// One row of `netstat -ano`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetstatRow {
    pub protocol: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote: String,
    pub state: String,
    pub pid: u32,
}

/// A local socket bound to a port, with its owning process
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PortBinding {
    pub pid: u32,
    pub process_name: String,
    pub local_ip: String,
    pub local_port: u16,
    pub state: String,
    pub is_loopback: bool,
    pub is_all_interfaces: bool,
    pub is_orphan: bool,
    pub is_system: bool,
}

impl PortBinding {
    fn from_row(row: &NetstatRow, processes: &HashMap<u32, String>) -> Self {
        let is_system = SYSTEM_PIDS.contains(&row.pid);
        let known = processes.get(&row.pid);
        let is_orphan = !is_system && known.is_none();
        let process_name = match (row.pid, known) {
            (0, _) => "[System Idle]".to_string(),
            (4, _) => "[System]".to_string(),
            (_, Some(name)) => name.clone(),
            (_, None) => "<orphaned>".to_string(),
        };
        let ip = row.local_ip.parse::<IpAddr>().ok();

        Self {
            pid: row.pid,
            process_name,
            local_ip: row.local_ip.clone(),
            local_port: row.local_port,
            state: row.state.clone(),
            is_loopback: ip.is_some_and(|ip| ip.is_loopback()),
            is_all_interfaces: ip.is_some_and(|ip| ip.is_unspecified()),
            is_orphan,
            is_system,
        }
    }

    pub fn scope_description(&self) -> &'static str {
        if self.is_loopback {
            "Loopback"
        } else if self.is_all_interfaces {
            "All Interfaces"
        } else {
            "Specific IP"
        }
    }

    pub fn address(&self) -> String {
        if self.local_ip.contains(':') {
            format!("[{}]:{}", self.local_ip, self.local_port)
        } else {
            format!("{}:{}", self.local_ip, self.local_port)
        }
    }

    pub fn process_status(&self) -> &'static str {
        if self.is_system {
            "System/Kernel"
        } else if self.is_orphan {
            "Orphaned"
        } else {
            "Active"
        }
    }
}

/// Everything bound to one port
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PortScanResult {
    pub port: u16,
    pub bindings: Vec<PortBinding>,
    /// PIDs bound to both loopback and all interfaces
    pub conflict_pids: Vec<u32>,
    pub orphan_pids: Vec<u32>,
}

impl PortScanResult {
    pub fn is_free(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn status_line(&self) -> String {
        if self.is_free() {
            return format!("Port {} is free", self.port);
        }
        let mut line = format!(
            "Port {} is in use by {} binding(s)",
            self.port,
            self.bindings.len()
        );
        if !self.conflict_pids.is_empty() {
            line.push_str(&format!(
                "; loopback/all-interfaces conflict: PID {}",
                join_pids(&self.conflict_pids)
            ));
        }
        if !self.orphan_pids.is_empty() {
            line.push_str(&format!(
                "; orphaned PID {}",
                join_pids(&self.orphan_pids)
            ));
        }
        line
    }

    /// Tab-separated table of the bindings
    pub fn report(&self) -> String {
        let mut out = String::from("PID\tProcess\tLocal Address\tState\tScope\n");
        for b in &self.bindings {
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                b.pid,
                b.process_name,
                b.address(),
                b.state,
                b.scope_description()
            ));
        }
        out
    }
}

fn join_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

static NETSTAT_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(TCP|UDP)\s+(\S+)\s+(\S+)\s+(?:([A-Z][A-Z0-9_]*)\s+)?(\d+)\s*$")
        .expect("netstat row regex")
});

static TASKLIST_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^"([^"]*)","(\d+)""#).expect("tasklist row regex"));

/// Split `ip:port`, `[v6]:port` or `*:port`
fn split_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let (ip, port) = endpoint.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    let ip = ip.split('%').next().unwrap_or(ip);
    let ip = if ip == "*" { "0.0.0.0" } else { ip };
    Some((ip.to_string(), port))
}

/// Parse `netstat -ano` output
pub fn parse_netstat(text: &str) -> Vec<NetstatRow> {
    text.lines()
        .filter_map(|line| {
            let caps = NETSTAT_ROW.captures(line)?;
            let (local_ip, local_port) = split_endpoint(&caps[2])?;
            Some(NetstatRow {
                protocol: caps[1].to_string(),
                local_ip,
                local_port,
                remote: caps[3].to_string(),
                state: caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
                pid: caps[5].parse().ok()?,
            })
        })
        .collect()
}

/// Parse `tasklist /FO CSV /NH` into a PID to image name map
pub fn parse_tasklist(text: &str) -> HashMap<u32, String> {
    text.lines()
        .filter_map(|line| {
            let caps = TASKLIST_ROW.captures(line.trim())?;
            Some((caps[2].parse().ok()?, caps[1].to_string()))
        })
        .collect()
}

fn netstat_command() -> CommandSpec {
    CommandSpec::process(["netstat", "-ano"]).with_timeout(20.0)
}

fn tasklist_command() -> CommandSpec {
    CommandSpec::process(["tasklist", "/FO", "CSV", "/NH"]).with_timeout(20.0)
}

/// Command that forcefully terminates `pid` (may be a template expression)
pub fn kill_command(pid: &str) -> CommandSpec {
    if cfg!(windows) {
        CommandSpec::process(["taskkill", "/PID", pid, "/F"]).with_timeout(15.0)
    } else {
        CommandSpec::process(["kill", "-9", pid]).with_timeout(15.0)
    }
}

async fn netstat_rows(runner: &dyn CommandRunner) -> Result<Vec<NetstatRow>, PortsError> {
    let output = run_checked(runner, &netstat_command()).await?;
    Ok(parse_netstat(&output.stdout))
}

/// Bindings on `port` with owning processes, conflicts and orphans
pub async fn scan_port(runner: &dyn CommandRunner, port: u16) -> Result<PortScanResult, PortsError> {
    let tasklist = tasklist_command();
    let (rows, processes) = tokio::join!(netstat_rows(runner), run_checked(runner, &tasklist));
    let rows = rows?;
    let processes = parse_tasklist(&processes?.stdout);

    let mut bindings: Vec<PortBinding> = Vec::new();
    for row in rows.iter().filter(|r| r.protocol == "TCP" && r.local_port == port) {
        let binding = PortBinding::from_row(row, &processes);
        let duplicate = bindings.iter().any(|b| {
            b.pid == binding.pid && b.local_ip == binding.local_ip && b.state == binding.state
        });
        if !duplicate {
            bindings.push(binding);
        }
    }

    let conflict_pids: BTreeSet<u32> = bindings
        .iter()
        .filter(|b| b.is_loopback)
        .map(|b| b.pid)
        .filter(|pid| {
            bindings
                .iter()
                .any(|other| other.pid == *pid && other.is_all_interfaces)
        })
        .collect();
    let orphan_pids: BTreeSet<u32> = bindings
        .iter()
        .filter(|b| b.is_orphan)
        .map(|b| b.pid)
        .collect();

    let result = PortScanResult {
        port,
        bindings,
        conflict_pids: conflict_pids.into_iter().collect(),
        orphan_pids: orphan_pids.into_iter().collect(),
    };
    debug!(port, bindings = result.bindings.len(), "port scanned");
    Ok(result)
}

/// Every local TCP port with a socket in any state
pub async fn used_ports(runner: &dyn CommandRunner) -> Result<BTreeSet<u16>, PortsError> {
    Ok(netstat_rows(runner)
        .await?
        .into_iter()
        .filter(|r| r.protocol == "TCP")
        .map(|r| r.local_port)
        .collect())
}

fn can_bind_loopback(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// First port in `start..=end` not in `used` that `probe` accepts
pub fn first_free_port(
    start: u16,
    end: u16,
    used: &BTreeSet<u16>,
    probe: impl Fn(u16) -> bool,
) -> Option<u16> {
    if start > end {
        return None;
    }
    (start..=end).find(|port| *port != 0 && !used.contains(port) && probe(*port))
}

/// First free port in the inclusive range, or `None` when exhausted
pub async fn suggest_free_port(
    runner: &dyn CommandRunner,
    start: u16,
    end: u16,
) -> Result<Option<u16>, PortsError> {
    let used = used_ports(runner).await?;
    Ok(first_free_port(start, end, &used, can_bind_loopback))
}

/// Forcefully terminate a process
pub async fn kill_process(runner: &dyn CommandRunner, pid: u32) -> Result<CommandResult, PortsError> {
    if pid == 0 {
        return Err(PortsError::ProtectedPid(pid));
    }
    info!(pid, "killing process");
    Ok(run_checked(runner, &kill_command(&pid.to_string())).await?)
}

/// http.sys state relevant to one port
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SocketDiagnostics {
    pub port: u16,
    /// Reserved URLs mentioning the port
    pub reservations: Vec<String>,
    /// Registered URLs in http.sys request queues
    pub queue_urls: Vec<String>,
    pub guidance: Vec<String>,
}

/// Lines of `text` that mention `:<port>` not followed by another digit
pub fn lines_mentioning_port(text: &str, port: u16) -> Vec<String> {
    let needle = format!(":{port}");
    text.lines()
        .filter(|line| {
            line.match_indices(&needle).any(|(idx, _)| {
                !line[idx + needle.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit())
            })
        })
        .map(|line| line.trim().to_string())
        .collect()
}

/// Extract the URL from a `Reserved URL : http://+:80/` style line
fn url_of(line: &str) -> String {
    line.find("http")
        .map(|idx| line[idx..].trim().to_string())
        .unwrap_or_else(|| line.to_string())
}

/// Check http.sys URL reservations and request queues for `port`
pub async fn socket_diagnostics(
    runner: &dyn CommandRunner,
    port: u16,
) -> Result<SocketDiagnostics, PortsError> {
    let urlacl = CommandSpec::process(["netsh", "http", "show", "urlacl"]);
    let servicestate = CommandSpec::process(["netsh", "http", "show", "servicestate"]);
    let (urlacl, servicestate) = tokio::join!(runner.run(&urlacl), runner.run(&servicestate));
    let (urlacl, servicestate) = (urlacl?, servicestate?);

    let mut guidance = Vec::new();
    let reservations: Vec<String> = lines_mentioning_port(&urlacl.stdout, port)
        .iter()
        .map(|l| url_of(l))
        .collect();
    let queue_urls: Vec<String> = lines_mentioning_port(&servicestate.stdout, port)
        .iter()
        .map(|l| url_of(l))
        .collect();

    if !urlacl.succeeded() || !servicestate.succeeded() {
        guidance.push("netsh did not complete; run elevated for full http.sys details".into());
    }
    for url in &reservations {
        guidance.push(format!(
            "URL reservation {url} exists; remove it if stale: netsh http delete urlacl url={url}"
        ));
    }
    if !queue_urls.is_empty() {
        guidance.push(format!(
            "http.sys has a request queue registered for port {port}; the owner is likely a service (IIS, WinRM, SSRS). Stop that service or restart http.sys (network.restart_http)"
        ));
    }
    if reservations.is_empty() && queue_urls.is_empty() {
        guidance.push(format!(
            "No http.sys reservations reference port {port}; check ordinary socket owners with 'ports scan {port}'"
        ));
    }

    Ok(SocketDiagnostics {
        port,
        reservations,
        queue_urls,
        guidance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;

    const NETSTAT: &str = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1100
  TCP    0.0.0.0:445            0.0.0.0:0              LISTENING       4
  TCP    0.0.0.0:3010           0.0.0.0:0              LISTENING       5120
  TCP    127.0.0.1:3010         0.0.0.0:0              LISTENING       5120
  TCP    127.0.0.1:3010         127.0.0.1:52100        ESTABLISHED     5120
  TCP    192.168.1.20:3011      0.0.0.0:0              LISTENING       7777
  TCP    [::]:3010              [::]:0                 LISTENING       5120
  TCP    [::1]:3002             [::]:0                 LISTENING       0
  TCP    [fe80::1%12]:3003      [::]:0                 LISTENING       6000
  UDP    0.0.0.0:5353           *:*                                    2200
";

    const TASKLIST: &str = r#""System Idle Process","0","Services","0","8 K"
"System","4","Services","0","144 K"
"svchost.exe","1100","Services","0","12,000 K"
"node.exe","5120","Console","1","80,112 K"
"#;

    fn runner() -> FakeRunner {
        FakeRunner::new()
            .respond("netstat", 0, NETSTAT)
            .respond("tasklist", 0, TASKLIST)
    }

    #[test]
    fn test_parse_netstat() {
        let rows = parse_netstat(NETSTAT);
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].local_ip, "0.0.0.0");
        assert_eq!(rows[0].local_port, 135);
        assert_eq!(rows[0].state, "LISTENING");
        assert_eq!(rows[6].local_ip, "::");
        assert_eq!(rows[7].local_ip, "::1");
        assert_eq!(rows[8].local_ip, "fe80::1");
        assert_eq!(rows[9].protocol, "UDP");
        assert_eq!(rows[9].state, "");
        assert_eq!(rows[9].pid, 2200);
    }

    #[test]
    fn test_parse_netstat_states_with_digits() {
        let rows = parse_netstat("  TCP    10.0.0.5:50112    10.0.0.9:443    FIN_WAIT_2    812\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "FIN_WAIT_2");
        assert_eq!(rows[0].remote, "10.0.0.9:443");
    }

    #[test]
    fn test_parse_tasklist() {
        let map = parse_tasklist(TASKLIST);
        assert_eq!(map.len(), 4);
        assert_eq!(map[&5120], "node.exe");
        assert_eq!(map[&0], "System Idle Process");
    }

    #[tokio::test]
    async fn test_scan_port_conflict() {
        let result = scan_port(&runner(), 3010).await.unwrap();
        assert_eq!(result.bindings.len(), 4);
        assert_eq!(result.conflict_pids, vec![5120]);
        assert!(result.orphan_pids.is_empty());

        let loopback = result
            .bindings
            .iter()
            .find(|b| b.local_ip == "127.0.0.1" && b.state == "LISTENING")
            .unwrap();
        assert_eq!(loopback.scope_description(), "Loopback");
        assert_eq!(loopback.process_name, "node.exe");
        assert_eq!(loopback.process_status(), "Active");

        let v6 = result.bindings.iter().find(|b| b.local_ip == "::").unwrap();
        assert!(v6.is_all_interfaces);
        assert_eq!(v6.address(), "[::]:3010");
        assert!(result.status_line().contains("conflict: PID 5120"));
    }

    #[tokio::test]
    async fn test_scan_port_orphan_and_system() {
        let result = scan_port(&runner(), 3011).await.unwrap();
        assert_eq!(result.orphan_pids, vec![7777]);
        assert_eq!(result.bindings[0].process_name, "<orphaned>");
        assert_eq!(result.bindings[0].scope_description(), "Specific IP");

        let result = scan_port(&runner(), 3002).await.unwrap();
        assert!(result.bindings[0].is_system);
        assert_eq!(result.bindings[0].process_name, "[System Idle]");
        assert_eq!(result.bindings[0].process_status(), "System/Kernel");

        let result = scan_port(&runner(), 445).await.unwrap();
        assert_eq!(result.bindings[0].process_name, "[System]");
    }

    #[tokio::test]
    async fn test_scan_free_port_report() {
        let result = scan_port(&runner(), 9999).await.unwrap();
        assert!(result.is_free());
        assert_eq!(result.status_line(), "Port 9999 is free");
        assert_eq!(result.report(), "PID\tProcess\tLocal Address\tState\tScope\n");
    }

    #[tokio::test]
    async fn test_report_rows() {
        let result = scan_port(&runner(), 3011).await.unwrap();
        assert_eq!(
            result.report().lines().nth(1).unwrap(),
            "7777\t<orphaned>\t192.168.1.20:3011\tLISTENING\tSpecific IP"
        );
    }

    #[test]
    fn test_first_free_port() {
        let used: BTreeSet<u16> = [3000, 3001].into_iter().collect();
        assert_eq!(first_free_port(3000, 3100, &used, |_| true), Some(3002));
        assert_eq!(first_free_port(3000, 3100, &used, |p| p > 3005), Some(3006));
        assert_eq!(first_free_port(3000, 3001, &used, |_| true), None);
        assert_eq!(first_free_port(3100, 3000, &used, |_| true), None);
        assert_eq!(first_free_port(0, 0, &BTreeSet::new(), |_| true), None);
    }

    #[tokio::test]
    async fn test_used_ports() {
        let used = used_ports(&runner()).await.unwrap();
        assert!(used.contains(&3010));
        assert!(used.contains(&3003));
        assert!(!used.contains(&5353));
    }

    #[tokio::test]
    async fn test_kill_process_rejects_pid_zero() {
        let err = kill_process(&runner(), 0).await.unwrap_err();
        assert!(matches!(err, PortsError::ProtectedPid(0)));
    }

    #[tokio::test]
    async fn test_kill_process_runs_kill_command() {
        let needle = if cfg!(windows) { "taskkill" } else { "kill" };
        let runner = FakeRunner::new().respond(needle, 0, "SUCCESS");
        kill_process(&runner, 4242).await.unwrap();
        assert!(runner.calls()[0].contains("4242"));
    }

    #[test]
    fn test_lines_mentioning_port() {
        let text = "    Reserved URL            : http://+:80/\n    Reserved URL            : http://+:8080/\n";
        assert_eq!(lines_mentioning_port(text, 80).len(), 1);
        assert_eq!(lines_mentioning_port(text, 8080).len(), 1);
        assert!(lines_mentioning_port(text, 808).is_empty());
    }

    #[tokio::test]
    async fn test_socket_diagnostics() {
        let urlacl = "URL Reservations:\n-----------------\n\n    Reserved URL            : http://+:3010/app/\n        User: NT AUTHORITY\\NETWORK SERVICE\n";
        let runner = FakeRunner::new()
            .respond("urlacl", 0, urlacl)
            .respond("servicestate", 0, "Snapshot of HTTP service state\n");

        let diag = socket_diagnostics(&runner, 3010).await.unwrap();
        assert_eq!(diag.reservations, vec!["http://+:3010/app/"]);
        assert!(diag.queue_urls.is_empty());
        assert!(diag.guidance[0].contains("netsh http delete urlacl url=http://+:3010/app/"));

        let diag = socket_diagnostics(&runner, 4000).await.unwrap();
        assert!(diag.reservations.is_empty());
        assert!(diag.guidance[0].contains("No http.sys reservations"));
    }
}

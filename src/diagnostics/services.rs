//! Windows service listing and control

use super::{DiagnosticError, parse_ps_json, run_checked};
use crate::exec::{CommandResult, CommandRunner, CommandSpec};
use crate::template::filters::ps_quote;
use serde::{Deserialize, Serialize};
use tracing::info;

const SERVICE_PROJECTION: &str = "Select-Object Name, DisplayName, \
@{Name='Status';Expression={$_.Status.ToString()}}, \
@{Name='StartType';Expression={$_.StartType.ToString()}} | ConvertTo-Json -Compress";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub start_type: String,
}

impl ServiceInfo {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    fn matches(&self, filter: &str) -> bool {
        let filter = filter.to_lowercase();
        self.name.to_lowercase().contains(&filter)
            || self.display_name.to_lowercase().contains(&filter)
    }
}

/// Mutating service operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVerb {
    Start,
    Stop,
    Restart,
}

impl ServiceVerb {
    pub fn id(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Start => "Start service",
            Self::Stop => "Stop service",
            Self::Restart => "Restart service",
        }
    }
}

/// PowerShell listing every service as JSON
pub fn list_script() -> String {
    format!("Get-Service | {SERVICE_PROJECTION}")
}

/// PowerShell for `verb`; `name_literal` must already be a quoted literal or
/// a template that renders to one
pub fn control_script(verb: ServiceVerb, name_literal: &str) -> String {
    match verb {
        ServiceVerb::Start => format!("Start-Service -Name {name_literal} -ErrorAction Stop"),
        ServiceVerb::Stop => format!("Stop-Service -Name {name_literal} -Force -ErrorAction Stop"),
        ServiceVerb::Restart => {
            format!("Restart-Service -Name {name_literal} -Force -ErrorAction Stop")
        }
    }
}

pub fn parse_services_json(text: &str) -> Result<Vec<ServiceInfo>, DiagnosticError> {
    parse_ps_json(text, "service list")
}

/// All services, optionally filtered by a case-insensitive substring of the
/// name or display name
pub async fn list_services(
    runner: &dyn CommandRunner,
    filter: Option<&str>,
) -> Result<Vec<ServiceInfo>, DiagnosticError> {
    let output = run_checked(runner, &CommandSpec::powershell(list_script()).with_timeout(30.0)).await?;
    let mut services = parse_services_json(&output.stdout)?;
    if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
        services.retain(|s| s.matches(filter.trim()));
    }
    services.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(services)
}

fn check_name(name: &str) -> Result<(), DiagnosticError> {
    if name.trim().is_empty() {
        return Err(DiagnosticError::InvalidInput(
            "service name must not be empty".into(),
        ));
    }
    Ok(())
}

async fn control(
    runner: &dyn CommandRunner,
    verb: ServiceVerb,
    name: &str,
) -> Result<CommandResult, DiagnosticError> {
    check_name(name)?;
    info!(service = name, action = verb.id(), "service control");
    let spec = CommandSpec::powershell(control_script(verb, &ps_quote(name)))
        .with_timeout(60.0)
        .elevated();
    run_checked(runner, &spec).await
}

pub async fn start_service(
    runner: &dyn CommandRunner,
    name: &str,
) -> Result<CommandResult, DiagnosticError> {
    control(runner, ServiceVerb::Start, name).await
}

pub async fn stop_service(
    runner: &dyn CommandRunner,
    name: &str,
) -> Result<CommandResult, DiagnosticError> {
    control(runner, ServiceVerb::Stop, name).await
}

pub async fn restart_service(
    runner: &dyn CommandRunner,
    name: &str,
) -> Result<CommandResult, DiagnosticError> {
    control(runner, ServiceVerb::Restart, name).await
}

/// Status of a single service
pub async fn service_details(
    runner: &dyn CommandRunner,
    name: &str,
) -> Result<ServiceInfo, DiagnosticError> {
    check_name(name)?;
    let script = format!(
        "Get-Service -Name {} -ErrorAction Stop | {SERVICE_PROJECTION}",
        ps_quote(name)
    );
    let output = run_checked(runner, &CommandSpec::powershell(script).with_timeout(30.0)).await?;
    parse_services_json(&output.stdout)?
        .into_iter()
        .next()
        .ok_or_else(|| DiagnosticError::InvalidInput(format!("service '{name}' not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecError;
    use crate::exec::testing::FakeRunner;

    const SERVICES: &str = r#"[
        {"Name":"W3SVC","DisplayName":"World Wide Web Publishing Service","Status":"Running","StartType":"Automatic"},
        {"Name":"Spooler","DisplayName":"Print Spooler","Status":"Stopped","StartType":"Manual"},
        {"Name":"http","DisplayName":"HTTP Service","Status":"Running","StartType":"Manual"}
    ]"#;

    #[tokio::test]
    async fn test_list_services_filter_and_sort() {
        let runner = FakeRunner::new().respond("Get-Service", 0, SERVICES);

        let all = list_services(&runner, None).await.unwrap();
        let names: Vec<&str> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["http", "Spooler", "W3SVC"]);

        let web = list_services(&runner, Some("web")).await.unwrap();
        assert_eq!(web.len(), 1);
        assert!(web[0].is_running());

        let none = list_services(&runner, Some("zzz")).await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_control_scripts() {
        assert_eq!(
            control_script(ServiceVerb::Restart, &ps_quote("W3SVC")),
            "Restart-Service -Name 'W3SVC' -Force -ErrorAction Stop"
        );
        assert!(control_script(ServiceVerb::Start, "'x'").starts_with("Start-Service"));
        assert!(list_script().contains("ConvertTo-Json"));
    }

    #[tokio::test]
    async fn test_control_requires_elevation() {
        let runner = FakeRunner::new().respond("Stop-Service", 0, "");
        let err = stop_service(&runner, "Spooler").await.unwrap_err();
        assert!(matches!(
            err,
            DiagnosticError::Exec(ExecError::ElevationRequired { .. })
        ));

        let runner = FakeRunner::new().respond("Stop-Service", 0, "").admin();
        stop_service(&runner, "Spooler").await.unwrap();
        assert!(runner.calls()[0].contains("Stop-Service -Name 'Spooler'"));
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let runner = FakeRunner::new().admin();
        assert!(matches!(
            start_service(&runner, " ").await,
            Err(DiagnosticError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_service_details() {
        let runner = FakeRunner::new().respond(
            "Get-Service -Name 'Spooler'",
            0,
            r#"{"Name":"Spooler","DisplayName":"Print Spooler","Status":"Stopped","StartType":"Manual"}"#,
        );
        let info = service_details(&runner, "Spooler").await.unwrap();
        assert_eq!(info.display_name, "Print Spooler");
        assert!(!info.is_running());
    }
}

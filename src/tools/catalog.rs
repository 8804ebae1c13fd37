//! Built-in tool catalog

use super::action::{Action, ParamDef};
use super::registry::{StaticTool, ToolRegistry};
use crate::config::AppConfig;
use crate::diagnostics::network::PING_COUNT_FLAG;
use crate::diagnostics::services::{ServiceVerb, control_script, list_script};
use crate::exec::CommandSpec;

/// Registry with every built-in tool; defaults come from `config`
pub fn builtin_registry(config: &AppConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(network_tool(config)));
    registry.register(Box::new(services_tool()));
    registry.register(Box::new(ports_tool()));
    registry.register(Box::new(processes_tool()));
    registry.register(Box::new(hosts_tool()));
    registry
}

fn flush_dns_step() -> CommandSpec {
    CommandSpec::process(["ipconfig", "/flushdns"]).with_timeout(15.0)
}

fn network_tool(config: &AppConfig) -> StaticTool {
    StaticTool::new("network", "DNS, IP and Winsock repairs")
        .with_action(
            Action::new("flush_dns", "Flush DNS cache")
                .description("Clear the resolver cache")
                .step(flush_dns_step()),
        )
        .with_action(
            Action::new("winsock_reset", "Reset Winsock")
                .description("Reset the Winsock catalog; a reboot is usually needed afterwards")
                .admin()
                .step(CommandSpec::process(["netsh", "winsock", "reset"]).with_timeout(15.0)),
        )
        .with_action(
            Action::new("renew_ip", "Renew IP address")
                .description("Release and renew DHCP leases on all adapters")
                .step(CommandSpec::process(["ipconfig", "/release"]).with_timeout(30.0))
                .step(CommandSpec::process(["ipconfig", "/renew"]).with_timeout(30.0)),
        )
        .with_action(
            Action::new("ping_host", "Ping host")
                .description("Send ICMP echo requests")
                .param(ParamDef::optional(
                    "host",
                    "Host name or address",
                    config.network.ping_target.clone(),
                ))
                .param(
                    ParamDef::optional(
                        "count",
                        "Number of echo requests",
                        config.network.ping_count.to_string(),
                    )
                    .numeric(),
                )
                .step(
                    CommandSpec::process([
                        "ping",
                        PING_COUNT_FLAG,
                        "{{ params.count }}",
                        "{{ params.host }}",
                    ])
                    .with_timeout(20.0),
                ),
        )
        .with_action(
            Action::new("restart_http", "Restart HTTP service")
                .description("Restart http.sys, dropping stale URL bindings")
                .admin()
                .step(CommandSpec::process(["net", "stop", "http", "/y"]).with_timeout(30.0))
                .step(CommandSpec::process(["net", "start", "http"]).with_timeout(30.0)),
        )
        .with_action(
            Action::new("adapters", "Show adapters")
                .description("Full adapter configuration")
                .step(CommandSpec::process(["ipconfig", "/all"])),
        )
}

fn service_control(verb: ServiceVerb) -> Action {
    Action::new(verb.id(), verb.label())
        .admin()
        .param(ParamDef::required("name", "Service name"))
        .step(CommandSpec::powershell(control_script(
            verb,
            "{{ params.name | ps_quote }}",
        )))
}

fn services_tool() -> StaticTool {
    StaticTool::new("services", "Windows service control")
        .with_action(
            Action::new("list", "List services")
                .description("All services with status and start type")
                .step(CommandSpec::powershell(list_script())),
        )
        .with_action(service_control(ServiceVerb::Start))
        .with_action(service_control(ServiceVerb::Stop))
        .with_action(service_control(ServiceVerb::Restart))
}

fn ports_tool() -> StaticTool {
    StaticTool::new("ports", "HTTP.sys reservations and port bindings")
        .with_action(
            Action::new("urlacl", "URL reservations")
                .description("List http.sys URL ACL reservations")
                .step(CommandSpec::process(["netsh", "http", "show", "urlacl"])),
        )
        .with_action(
            Action::new("servicestate", "HTTP service state")
                .description("Show http.sys request queues and registered URLs")
                .step(CommandSpec::process(["netsh", "http", "show", "servicestate"])),
        )
}

fn processes_tool() -> StaticTool {
    StaticTool::new("processes", "Process control").with_action(
        Action::new("kill", "Kill process")
            .description("Forcefully terminate a process by PID")
            .param(ParamDef::required("pid", "Process id").numeric())
            .step(crate::diagnostics::ports::kill_command("{{ params.pid }}")),
    )
}

fn hosts_tool() -> StaticTool {
    StaticTool::new("hosts", "Hosts file helpers").with_action(
        Action::new("flush_after_edit", "Flush DNS after hosts edit")
            .description("Make hosts file changes visible immediately")
            .step(flush_dns_step()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateEngine;
    use std::collections::BTreeMap;

    #[test]
    fn test_builtin_references() {
        let registry = builtin_registry(&AppConfig::default());
        let refs = registry.references();
        for expected in [
            "network.flush_dns",
            "network.winsock_reset",
            "network.renew_ip",
            "network.ping_host",
            "network.restart_http",
            "network.adapters",
            "services.list",
            "services.start",
            "services.stop",
            "services.restart",
            "ports.urlacl",
            "ports.servicestate",
            "processes.kill",
            "hosts.flush_after_edit",
        ] {
            assert!(refs.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_ping_defaults_from_config() {
        let mut config = AppConfig::default();
        config.network.ping_target = "1.1.1.1".into();
        config.network.ping_count = 2;
        let registry = builtin_registry(&config);

        let specs = registry
            .lookup("network.ping_host")
            .unwrap()
            .resolve(&TemplateEngine::new(), &BTreeMap::new())
            .unwrap();
        assert_eq!(
            specs[0].command.to_argv(),
            vec!["ping", PING_COUNT_FLAG, "2", "1.1.1.1"]
        );
        assert_eq!(specs[0].timeout, Some(20.0));
    }

    #[test]
    fn test_service_actions_quote_name() {
        let registry = builtin_registry(&AppConfig::default());
        let mut params = BTreeMap::new();
        params.insert("name".into(), "W3SVC'; Remove-Item C:\\".into());

        let specs = registry
            .lookup("services.restart")
            .unwrap()
            .resolve(&TemplateEngine::new(), &params)
            .unwrap();
        let script = specs[0].command.as_text();
        assert!(script.contains("'W3SVC''; Remove-Item C:\\'"));
        assert!(specs[0].elevate);
    }

    #[test]
    fn test_admin_flags() {
        let registry = builtin_registry(&AppConfig::default());
        assert!(registry.lookup("network.winsock_reset").unwrap().requires_admin);
        assert!(registry.lookup("network.restart_http").unwrap().requires_admin);
        assert!(!registry.lookup("network.flush_dns").unwrap().requires_admin);
        assert!(!registry.lookup("services.list").unwrap().requires_admin);
    }
}

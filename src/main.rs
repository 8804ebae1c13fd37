mod admin;
mod cli;
mod config;
mod diagnostics;
mod exec;
mod history;
mod logging;
mod process;
mod template;
mod tools;
mod workflow;

use clap::{Parser, Subcommand};
use cli::commands;
use cli::signals::is_shutdown_requested;
use cli::{
    App, CancellationToken, EXIT_CANCELLED, EXIT_FAILURE, NetworkFix, OutputHandler, OutputMode,
    create_handler, setup_signal_handlers,
};
use config::{AppConfig, paths};
use diagnostics::processes::SortKey;
use diagnostics::services::ServiceVerb;
use exec::SystemRunner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(name = "sanity")]
#[command(about = "Windows diagnostics and repair toolkit", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Working directory (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Extra config file layered over the user config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Print events and results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and free TCP ports
    Ports {
        #[command(subcommand)]
        command: PortsCommand,
    },

    /// List processes by resource usage
    #[command(args_conflicts_with_subcommands = true)]
    Processes {
        #[command(subcommand)]
        command: Option<ProcessesCommand>,

        /// Sort by handles, memory or cpu
        #[arg(long, default_value = "handles")]
        sort: SortKey,

        /// Number of processes to show
        #[arg(long, default_value_t = 25)]
        limit: usize,

        /// Tab-separated report
        #[arg(long, conflicts_with = "overview")]
        report: bool,

        /// Show memory, CPU and process totals instead of the list
        #[arg(long)]
        overview: bool,
    },

    /// Adapters, reachability and network repairs
    Network {
        #[command(subcommand)]
        command: NetworkCommand,
    },

    /// Windows services
    Services {
        #[command(subcommand)]
        command: ServicesCommand,
    },

    /// Edit the hosts file
    Hosts {
        #[command(subcommand)]
        command: HostsCommand,
    },

    /// List tools and their actions
    Tools,

    /// Run a single tool action
    Action {
        /// Action reference (tool.action)
        reference: String,

        /// Parameters as key=value
        #[arg(trailing_var_arg = true)]
        params: Vec<String>,
    },

    /// List available workflows
    Workflows,

    /// Validate a workflow without running
    Validate {
        /// Workflow name or file
        workflow: String,
    },

    /// Run a workflow
    Run {
        /// Workflow name or file
        workflow: String,

        /// Workflow arguments
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Show recorded runs
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Delete all recorded runs
        #[arg(long)]
        clear: bool,
    },

    /// Show or change settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },

    /// Check elevation, paths and required tools
    Doctor,

    /// Start an elevated instance with the given arguments
    Elevate {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run a program with arguments passed through unchanged
    Exec {
        program: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PortsCommand {
    /// Show what is bound to a port
    Scan {
        /// Port (defaults to ui.default_port)
        port: Option<u16>,

        /// Tab-separated report
        #[arg(long)]
        report: bool,
    },

    /// Find a free port
    Suggest {
        #[arg(long)]
        start: Option<u16>,

        #[arg(long)]
        end: Option<u16>,
    },

    /// Forcefully terminate a process
    Kill { pid: u32 },

    /// Check http.sys reservations for a port
    Diagnose { port: u16 },
}

#[derive(Subcommand)]
enum ProcessesCommand {
    /// Forcefully terminate a process
    Kill { pid: u32 },
}

#[derive(Subcommand)]
enum NetworkCommand {
    /// Show adapter configuration
    Adapters,

    /// Ping a host (defaults to network.ping_target)
    Ping {
        host: Option<String>,

        #[arg(long)]
        count: Option<u32>,
    },

    /// Send an HTTP HEAD request (defaults to network.probe_host)
    Head {
        url: Option<String>,

        /// Timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Run a network repair
    Fix {
        #[arg(value_enum)]
        kind: NetworkFix,
    },
}

#[derive(Subcommand)]
enum ServicesCommand {
    /// List services
    List {
        /// Case-insensitive name filter
        #[arg(long)]
        filter: Option<String>,
    },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Show { name: String },
}

#[derive(Subcommand)]
enum HostsCommand {
    List,
    Add {
        ip: String,
        host: String,

        #[arg(long)]
        comment: Option<String>,
    },
    Remove { host: String },
    /// Enable or disable an entry
    Toggle { host: String },
}

#[derive(Subcommand)]
enum SettingsCommand {
    Show,
    /// Show config and data locations
    Path,
    Set { key: String, value: String },
}

async fn dispatch(app: &App, command: Commands, handler: &dyn OutputHandler) -> anyhow::Result<i32> {
    match command {
        Commands::Ports { command } => match command {
            PortsCommand::Scan { port, report } => commands::ports_scan(app, port, report, handler).await,
            PortsCommand::Suggest { start, end } => {
                commands::ports_suggest(app, start, end, handler).await
            }
            PortsCommand::Kill { pid } => commands::kill_process(app, pid, handler).await,
            PortsCommand::Diagnose { port } => commands::ports_diagnose(app, port, handler).await,
        },

        Commands::Processes {
            command,
            sort,
            limit,
            report,
            overview,
        } => match command {
            Some(ProcessesCommand::Kill { pid }) => commands::kill_process(app, pid, handler).await,
            None if overview => commands::processes_overview(app, handler).await,
            None => commands::processes_list(app, sort, limit, report, handler).await,
        },

        Commands::Network { command } => match command {
            NetworkCommand::Adapters => commands::network_adapters(app, handler).await,
            NetworkCommand::Ping { host, count } => {
                commands::network_ping(app, host, count, handler).await
            }
            NetworkCommand::Head { url, timeout } => {
                commands::network_head(app, url, Duration::from_secs(timeout.max(1)), handler).await
            }
            NetworkCommand::Fix { kind } => {
                commands::run_action(app, kind.reference(), Default::default(), handler).await
            }
        },

        Commands::Services { command } => match command {
            ServicesCommand::List { filter } => {
                commands::services_list(app, filter.as_deref(), handler).await
            }
            ServicesCommand::Start { name } => {
                commands::services_control(app, ServiceVerb::Start, &name, handler).await
            }
            ServicesCommand::Stop { name } => {
                commands::services_control(app, ServiceVerb::Stop, &name, handler).await
            }
            ServicesCommand::Restart { name } => {
                commands::services_control(app, ServiceVerb::Restart, &name, handler).await
            }
            ServicesCommand::Show { name } => commands::services_show(app, &name, handler).await,
        },

        Commands::Hosts { command } => match command {
            HostsCommand::List => commands::hosts_list(app, handler),
            HostsCommand::Add { ip, host, comment } => {
                commands::hosts_add(app, &ip, &host, comment.as_deref(), handler).await
            }
            HostsCommand::Remove { host } => commands::hosts_remove(app, &host, handler).await,
            HostsCommand::Toggle { host } => commands::hosts_toggle(app, &host, handler).await,
        },

        Commands::Tools => commands::list_tools(app, handler),

        Commands::Action { reference, params } => {
            let params = commands::parse_workflow_args(&params);
            commands::run_action(app, &reference, params, handler).await
        }

        Commands::Workflows => commands::list_workflows(app, handler),

        Commands::Validate { workflow } => commands::validate_workflow(app, &workflow, handler),

        Commands::Run { workflow, args } => {
            commands::run_workflow(app, &workflow, &args, handler).await
        }

        Commands::History { limit, clear } => commands::show_history(app, limit, clear, handler),

        Commands::Settings { command } => match command {
            SettingsCommand::Show => commands::settings_show(app, handler),
            SettingsCommand::Path => commands::settings_path(app, handler),
            SettingsCommand::Set { key, value } => {
                commands::settings_set(app, &key, &value, handler)
            }
        },

        Commands::Doctor => commands::doctor(app, handler).await,

        Commands::Elevate { args } => commands::elevate(app, &args, handler).await,

        Commands::Exec { program, args } => Ok(commands::exec_passthrough(app, &program, &args).await),
    }
}

fn report_error(mode: OutputMode, handler: &dyn OutputHandler, err: &anyhow::Error) {
    let message = format!("{err:#}");
    match mode {
        OutputMode::Json => handler.result(false, Some(&message)),
        _ => eprintln!("Error: {message}"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mode = OutputMode::from_flags(cli.json, cli.quiet);
    let handler = create_handler(mode, cli.debug);

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let err = anyhow::Error::from(e).context("Failed to load configuration");
            report_error(mode, &*handler, &err);
            std::process::exit(EXIT_FAILURE);
        }
    };

    let log_dir = match paths::ensure_app_dirs() {
        Ok(root) => Some(root.join(paths::LOGS_DIR_NAME)),
        Err(e) => {
            eprintln!("warning: {e}; file logging disabled");
            None
        }
    };
    let console_level = logging::console_level(cli.debug, cli.quiet, &config.logging.level);
    let file_level = if cli.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let guard = match logging::init_logging(
        console_level,
        file_level,
        log_dir.as_deref(),
        config.logging.retention_days,
    ) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("warning: failed to initialize logging: {e:#}");
            None
        }
    };

    let working_dir = match cli.dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    let cancel = CancellationToken::new();
    tokio::spawn(setup_signal_handlers(cancel.clone()));

    let runner = SystemRunner::detect()
        .with_cancel(cancel.clone())
        .with_default_timeout(config.exec.default_timeout);
    let app = App::new(config, cli.config.clone(), working_dir, Arc::new(runner), cancel);

    let code = match dispatch(&app, cli.command, &*handler).await {
        Ok(code) => code,
        Err(e) => {
            debug!(error = %format!("{e:#}"), "command failed");
            report_error(mode, &*handler, &e);
            if is_shutdown_requested() {
                EXIT_CANCELLED
            } else {
                EXIT_FAILURE
            }
        }
    };

    // process::exit skips destructors; flush the file log first
    drop(guard);
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exec_forwards_hyphenated_args() {
        let cli = Cli::try_parse_from(["sanity", "exec", "--", "git", "log", "--oneline", "-n", "3"])
            .unwrap();
        match cli.command {
            Commands::Exec { program, args } => {
                assert_eq!(program, "git");
                assert_eq!(args, vec!["log", "--oneline", "-n", "3"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_processes_defaults_and_kill() {
        let cli = Cli::try_parse_from(["sanity", "processes", "--sort", "memory"]).unwrap();
        match cli.command {
            Commands::Processes {
                command: None,
                sort,
                limit,
                ..
            } => {
                assert_eq!(sort, SortKey::Memory);
                assert_eq!(limit, 25);
            }
            _ => panic!("expected processes"),
        }

        let cli = Cli::try_parse_from(["sanity", "processes", "--overview", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Processes {
                command: None,
                overview: true,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["sanity", "processes", "--overview", "--report"]).is_err());

        let cli = Cli::try_parse_from(["sanity", "processes", "kill", "42"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Processes {
                command: Some(ProcessesCommand::Kill { pid: 42 }),
                ..
            }
        ));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sanity", "ports", "scan", "3010", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Ports {
                command: PortsCommand::Scan {
                    port: Some(3010),
                    report: false
                }
            }
        ));
    }

    #[test]
    fn test_network_fix_value_names() {
        let cli = Cli::try_parse_from(["sanity", "network", "fix", "flush-dns"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Network {
                command: NetworkCommand::Fix {
                    kind: NetworkFix::FlushDns
                }
            }
        ));
    }

    #[test]
    fn test_run_collects_workflow_args() {
        let cli = Cli::try_parse_from(["sanity", "run", "web-restart", "service=W3SVC", "url=http://localhost"])
            .unwrap();
        match cli.command {
            Commands::Run { workflow, args } => {
                assert_eq!(workflow, "web-restart");
                assert_eq!(args, vec!["service=W3SVC", "url=http://localhost"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_launcher_forwards_args_and_exit_code() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let launcher = dir.path().join("sanity.sh");
        let fake = dir.path().join("sanity");
        std::fs::write(&launcher, include_str!("../scripts/sanity.sh")).unwrap();
        std::fs::write(
            &fake,
            "#!/bin/sh\npwd > cwd.txt\nprintf '%s|' \"$@\" > args.txt\nexit 7\n",
        )
        .unwrap();
        for path in [&launcher, &fake] {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let caller = tempfile::TempDir::new().unwrap();
        // ETXTBSY when another test thread forks while the script is being written
        let status = (0..10)
            .find_map(|_| {
                match std::process::Command::new(&launcher)
                    .args(["run", "a b", "--json", ""])
                    .current_dir(caller.path())
                    .status()
                {
                    Err(e) if e.raw_os_error() == Some(26) => {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        None
                    }
                    other => Some(other.unwrap()),
                }
            })
            .unwrap();

        assert_eq!(status.code(), Some(7));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("args.txt")).unwrap(),
            "run|a b|--json||"
        );
        let cwd = std::fs::read_to_string(dir.path().join("cwd.txt")).unwrap();
        assert_eq!(
            std::fs::canonicalize(cwd.trim()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }
}

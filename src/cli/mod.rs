//! CLI module for sanity-suite
//!
//! This module provides:
//! - Command implementations (ports, services, hosts, workflows, ...)
//! - Output handlers (console, JSON, quiet)
//! - Signal handling for graceful shutdown
//!
//! # Example
//!
//! ```ignore
//! use crate::cli::{App, commands, create_handler, OutputMode};
//!
//! let handler = create_handler(OutputMode::Console, false);
//! let exit_code = commands::run_workflow(&app, "network-reset", &args, &*handler).await?;
//! ```

pub mod commands;
pub mod output;
pub mod signals;

pub use commands::{App, EXIT_CANCELLED, EXIT_FAILURE, NetworkFix};
pub use output::{OutputHandler, OutputMode, create_handler};
pub use signals::{CancellationToken, setup_signal_handlers};

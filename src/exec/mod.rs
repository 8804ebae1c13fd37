//! Command execution
//!
//! Tools and workflow steps describe what to run as [`CommandSpec`]s. The
//! [`CommandRunner`] trait is the single place where specs turn into child
//! processes, so diagnostics can be driven by canned output in tests.

mod error;
mod result;
mod runner;
mod spec;

pub use error::ExecError;
pub use result::CommandResult;
#[cfg(test)]
pub(crate) use runner::testing;
pub use runner::{CommandRunner, SequenceRunner, SystemRunner, run_command, run_sequence};
#[cfg(test)]
pub use spec::Executor;
pub use spec::{
    CommandLine, CommandSpec, DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT_SECS, find_executable,
    is_valid_timeout, powershell_program,
};

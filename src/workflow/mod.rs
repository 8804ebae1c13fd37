//! Workflow execution engine
//!
//! This module handles:
//! - Discovering workflow files (project, user, built-in samples)
//! - Dependency ordering of steps
//! - Running steps through tool actions or inline commands
//! - Retries with exponential backoff and cancellation
//!
//! # Example
//!
//! ```ignore
//! use sanity_suite::workflow::{WorkflowCatalog, WorkflowEngine};
//!
//! let (workflow, _) = WorkflowCatalog::discover(Path::new(".")).load("network-reset")?;
//! let engine = WorkflowEngine::new(registry, runner);
//! let run = engine.execute(&workflow, args, Some(&token), &*handler).await?;
//!
//! if run.success {
//!     println!("Workflow completed successfully!");
//! }
//! ```

mod catalog;
mod executor;
mod retry;
mod runner;
mod state;

pub use catalog::WorkflowCatalog;
pub use runner::{WorkflowEngine, WorkflowError, topological_sort, validate_with};
#[cfg(test)]
pub use state::{StepRun, StepStatus};
pub use state::WorkflowRun;

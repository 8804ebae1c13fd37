//! Configuration types and loading for sanity-suite

mod error;
pub mod paths;
mod settings;
mod workflow;

pub use error::ConfigError;
pub use settings::{AppConfig, SETTABLE_KEYS};
pub use workflow::{
    OnFail, StepConfig, WorkflowConfig, WorkflowFormat, load_workflow_file, param_to_string,
    split_action_ref,
};

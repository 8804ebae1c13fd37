//! Tool descriptors and actions
//!
//! A tool groups related actions (`network`, `services`, `ports`, ...). An
//! action is a list of command templates plus the parameters they accept.
//! Workflows and the `action` command address actions as `tool.action`.

mod action;
mod catalog;
mod registry;

pub use action::{Action, ActionOutcome, execute_action};
#[cfg(test)]
pub use action::ParamDef;
pub use catalog::builtin_registry;
#[cfg(test)]
pub use registry::StaticTool;
pub use registry::{Tool, ToolRegistry};

use crate::exec::ExecError;
use crate::template::TemplateError;
use thiserror::Error;

fn did_you_mean(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{name}'{}", did_you_mean(.suggestion))]
    UnknownTool {
        name: String,
        suggestion: Option<String>,
    },

    #[error("tool '{tool}' has no action '{action}'{}", did_you_mean(.suggestion))]
    UnknownAction {
        tool: String,
        action: String,
        suggestion: Option<String>,
    },

    #[error("invalid action reference '{reference}' (expected tool.action)")]
    InvalidReference { reference: String },

    #[error("action '{action}' requires parameter '{param}'")]
    MissingParam { action: String, param: String },

    #[error("invalid value '{value}' for parameter '{param}': {reason}")]
    InvalidParam {
        param: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_with_suggestion() {
        let err = ToolError::UnknownAction {
            tool: "network".into(),
            action: "flush_dsn".into(),
            suggestion: Some("flush_dns".into()),
        };
        assert_eq!(
            err.to_string(),
            "tool 'network' has no action 'flush_dsn' (did you mean 'flush_dns'?)"
        );

        let err = ToolError::UnknownTool {
            name: "zzz".into(),
            suggestion: None,
        };
        assert_eq!(err.to_string(), "unknown tool 'zzz'");
    }
}

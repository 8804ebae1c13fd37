//! Template engine for action commands and workflow steps
//!
//! Command text may reference parameters with Jinja2 syntax.
//!
//! # Features
//!
//! - Variable substitution: `{{ params.host }}`, `{{ args.port }}`, `{{ steps.scan.output }}`
//! - Filters: `ps_quote`, `shell_escape`, `json`, `default`, `lines`
//! - Conditionals and loops from minijinja
//!
//! # Example
//!
//! ```ignore
//! use sanity_suite::template::{TemplateEngine, TemplateContext};
//!
//! let engine = TemplateEngine::new();
//! let mut ctx = TemplateContext::new();
//! ctx.params.insert("name".into(), "W3SVC".into());
//!
//! let script = engine.render("Restart-Service -Name {{ params.name | ps_quote }}", &ctx)?;
//! ```

mod context;
mod engine;
mod errors;
pub mod filters;

pub use context::{StepVars, TemplateContext};
pub use engine::TemplateEngine;
pub use errors::{TemplateError, suggest_correction};

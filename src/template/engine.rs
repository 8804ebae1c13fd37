//! Template engine for rendering command text

use super::context::TemplateContext;
use super::errors::TemplateError;
use super::filters;
use crate::exec::{CommandLine, CommandSpec};
use minijinja::Environment;

/// Template rendering engine
///
/// Wraps minijinja with custom filters and strict undefined handling.
#[derive(Clone)]
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        filters::register_filters(&mut env);
        Self { env }
    }

    /// Render a template string with the given context
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
        // Plain text is by far the common case for catalog commands
        if !has_template_syntax(template) {
            return Ok(template.to_string());
        }

        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| TemplateError::syntax(e.to_string(), e.line().unwrap_or(0), 0))?;

        tmpl.render(ctx.to_value())
            .map_err(|e| convert_minijinja_error(e, ctx))
    }

    /// Check if a template is syntactically valid
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        self.env
            .template_from_str(template)
            .map_err(|e| TemplateError::syntax(e.to_string(), e.line().unwrap_or(0), 0))?;
        Ok(())
    }

    /// Render every templated field of a command specification
    pub fn render_command(
        &self,
        spec: &CommandSpec,
        ctx: &TemplateContext,
    ) -> Result<CommandSpec, TemplateError> {
        let command = match &spec.command {
            CommandLine::Text(text) => CommandLine::Text(self.render(text, ctx)?),
            CommandLine::Argv(argv) => CommandLine::Argv(
                argv.iter()
                    .map(|arg| self.render(arg, ctx))
                    .collect::<Result<_, _>>()?,
            ),
        };

        let env = spec
            .env
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.render(v, ctx)?)))
            .collect::<Result<_, TemplateError>>()?;

        let cwd = spec
            .cwd
            .as_deref()
            .map(|c| self.render(c, ctx))
            .transpose()?;

        Ok(CommandSpec {
            command,
            env,
            cwd,
            ..spec.clone()
        })
    }
}

fn has_template_syntax(text: &str) -> bool {
    text.contains("{{") || text.contains("{%") || text.contains("{#")
}

/// Convert a minijinja error to our TemplateError type
fn convert_minijinja_error(err: minijinja::Error, ctx: &TemplateContext) -> TemplateError {
    let msg = err.to_string();
    let line = err.line().unwrap_or(0);

    if matches!(err.kind(), minijinja::ErrorKind::UndefinedError) || msg.contains("undefined") {
        let var_name = undefined_path(&err).unwrap_or_else(|| "unknown".to_string());
        let known = ctx.known_variables();
        let known: Vec<&str> = known.iter().map(String::as_str).collect();
        return TemplateError::undefined_variable_at(var_name, line, 0, &known);
    }

    if msg.contains("filter") {
        return TemplateError::filter("unknown", msg);
    }

    TemplateError::syntax(msg, line, 0)
}

/// Best-effort recovery of the dotted variable path that was undefined
fn undefined_path(err: &minijinja::Error) -> Option<String> {
    let source = err.template_source()?;
    let range = err.range()?;
    let snippet = source.get(range)?.trim();
    if snippet.is_empty() {
        None
    } else {
        Some(snippet.to_string())
    }
}

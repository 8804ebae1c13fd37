//! Template context for variable resolution

use minijinja::value::{Object, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// What later steps can see of a finished step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepVars {
    /// Combined output of the step's commands
    pub output: String,
    /// Exit code of the last command (-1 when it never ran)
    pub exit_code: i32,
    pub success: bool,
}

/// Context available to templates during rendering
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Action or step parameters
    pub params: BTreeMap<String, String>,

    /// Arguments passed on the command line
    pub args: BTreeMap<String, String>,

    /// Finished workflow steps, keyed by step name
    pub steps: BTreeMap<String, StepVars>,

    /// Workflow name
    pub workflow: Option<String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with action parameters
    pub fn with_params(params: BTreeMap<String, String>) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    pub fn add_step(&mut self, name: impl Into<String>, vars: StepVars) {
        self.steps.insert(name.into(), vars);
    }

    pub fn set_workflow(&mut self, name: impl Into<String>) {
        self.workflow = Some(name.into());
    }

    /// Convert to a minijinja Value for template rendering
    pub fn to_value(&self) -> Value {
        Value::from_object(ContextObject(self.clone()))
    }

    /// Known variable paths for error suggestions
    pub fn known_variables(&self) -> Vec<String> {
        let mut vars: Vec<String> = ["params", "args", "steps", "env", "workflow"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        vars.extend(self.params.keys().map(|k| format!("params.{k}")));
        vars.extend(self.args.keys().map(|k| format!("args.{k}")));
        vars.extend(self.steps.keys().map(|k| format!("steps.{k}")));
        vars
    }
}

#[derive(Debug, Clone)]
struct ContextObject(TemplateContext);

impl fmt::Display for ContextObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TemplateContext")
    }
}

impl Object for ContextObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "params" => Some(Value::from_object(MapObject {
                label: "params",
                values: self.0.params.clone(),
            })),
            "args" => Some(Value::from_object(MapObject {
                label: "args",
                values: self.0.args.clone(),
            })),
            "steps" => Some(Value::from_object(StepsObject(self.0.steps.clone()))),
            "workflow" => self.0.workflow.as_ref().map(|w| Value::from(w.clone())),
            "env" => Some(Value::from_object(EnvObject)),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        minijinja::value::Enumerator::Str(&["params", "args", "steps", "workflow", "env"])
    }
}

/// String map exposed as an object (`params`, `args`)
#[derive(Debug, Clone)]
struct MapObject {
    label: &'static str,
    values: BTreeMap<String, String>,
}

impl fmt::Display for MapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

impl Object for MapObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        self.values.get(key.as_str()?).map(|v| Value::from(v.clone()))
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        minijinja::value::Enumerator::Values(
            self.values.keys().map(|k| Value::from(k.clone())).collect(),
        )
    }
}

#[derive(Debug, Clone)]
struct StepsObject(BTreeMap<String, StepVars>);

impl fmt::Display for StepsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "steps")
    }
}

impl Object for StepsObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let vars = self.0.get(key.as_str()?)?;
        Some(Value::from_object(StepVarsObject(vars.clone())))
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        minijinja::value::Enumerator::Values(
            self.0.keys().map(|k| Value::from(k.clone())).collect(),
        )
    }
}

#[derive(Debug, Clone)]
struct StepVarsObject(StepVars);

impl fmt::Display for StepVarsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.output)
    }
}

impl Object for StepVarsObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "output" => Some(Value::from(self.0.output.clone())),
            "exit_code" => Some(Value::from(self.0.exit_code)),
            "success" => Some(Value::from(self.0.success)),
            "failed" => Some(Value::from(!self.0.success)),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        minijinja::value::Enumerator::Str(&["output", "exit_code", "success", "failed"])
    }
}

/// Object for lazy environment variable access
#[derive(Debug, Clone, Copy)]
struct EnvObject;

impl fmt::Display for EnvObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env")
    }
}

impl Object for EnvObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        std::env::var(key.as_str()?).ok().map(Value::from)
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        // Don't enumerate env vars - too many and potentially sensitive
        minijinja::value::Enumerator::Empty
    }
}

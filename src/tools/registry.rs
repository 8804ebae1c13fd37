//! Tool trait and registry

use super::ToolError;
use super::action::Action;
use crate::config::split_action_ref;
use crate::template::suggest_correction;

/// A named group of related actions
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn actions(&self) -> &[Action];

    fn action(&self, id: &str) -> Option<&Action> {
        self.actions().iter().find(|a| a.id == id)
    }
}

/// Tool defined by a fixed list of actions
#[derive(Debug, Clone)]
pub struct StaticTool {
    name: String,
    description: String,
    actions: Vec<Action>,
}

impl StaticTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn actions(&self) -> &[Action] {
        &self.actions
    }
}

/// Registered tools, looked up by `tool.action` references
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool; a tool with the same name is replaced
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn tools(&self) -> impl Iterator<Item = &dyn Tool> {
        self.tools.iter().map(|t| t.as_ref())
    }

    pub fn tool(&self, name: &str) -> Result<&dyn Tool, ToolError> {
        self.tools().find(|t| t.name() == name).ok_or_else(|| {
            let names: Vec<&str> = self.tools().map(|t| t.name()).collect();
            ToolError::UnknownTool {
                name: name.to_string(),
                suggestion: suggest_correction(name, &names),
            }
        })
    }

    /// Find the action for a `tool.action` reference
    pub fn lookup(&self, reference: &str) -> Result<&Action, ToolError> {
        let (tool_name, action_id) =
            split_action_ref(reference).ok_or_else(|| ToolError::InvalidReference {
                reference: reference.to_string(),
            })?;
        let tool = self.tool(tool_name)?;
        tool.action(action_id).ok_or_else(|| {
            let ids: Vec<&str> = tool.actions().iter().map(|a| a.id.as_str()).collect();
            ToolError::UnknownAction {
                tool: tool_name.to_string(),
                action: action_id.to_string(),
                suggestion: suggest_correction(action_id, &ids),
            }
        })
    }
}

#[cfg(test)]
impl ToolRegistry {
    /// Every `tool.action` reference, in registration order
    pub fn references(&self) -> Vec<String> {
        self.tools()
            .flat_map(|t| t.actions().iter().map(move |a| format!("{}.{}", t.name(), a.id)))
            .collect()
    }
}

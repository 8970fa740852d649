use std::{collections::BTreeMap, sync::Arc};

use {
    async_trait::async_trait,
    serde::{Serialize, de::DeserializeOwned},
};

use crate::error::{self, Error};

/// Longest tool name accepted by OpenAI-compatible function calling.
const MAX_TOOL_NAME_LEN: usize = 64;

/// Why a tool invocation did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The arguments do not fit the tool's parameters (missing, unexpected or
    /// mistyped fields).
    #[error("{0}")]
    InvalidArguments(String),
    /// The tool ran and failed.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Agent-callable tool.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;
    async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

/// Tool with a typed parameter struct and a serializable output.
///
/// Register it with [`ToolRegistry::register_typed`]. Argument objects are
/// deserialized into `Params`; a failure there is reported as
/// [`ToolError::InvalidArguments`] and `call` is never reached.
#[async_trait]
pub trait TypedTool: Send + Sync + 'static {
    type Params: DeserializeOwned + Send;
    type Output: Serialize + Send;

    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;
    async fn call(&self, params: Self::Params) -> anyhow::Result<Self::Output>;
}

struct Typed<T>(T);

#[async_trait]
impl<T: TypedTool> AgentTool for Typed<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn description(&self) -> &str {
        self.0.description()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.0.parameters_schema()
    }

    async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let params: T::Params = serde_json::from_value(params)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let output = self.0.call(params).await?;
        serde_json::to_value(output).map_err(|e| ToolError::Failed(e.into()))
    }
}

/// Registry of available tools for a conversation.
///
/// Tools are stored as `Arc<dyn AgentTool>` so the registry can be cheaply
/// shared between sessions. Iteration order is by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, rejecting bad names, non-object schemas and
    /// duplicates.
    pub fn register(&mut self, tool: Box<dyn AgentTool>) -> error::Result<()> {
        let name = tool.name().to_string();
        validate_tool_name(&name)?;
        if !tool.parameters_schema().is_object() {
            return Err(Error::InvalidToolSchema {
                name,
                reason: "parameters must be a JSON object schema",
            });
        }
        if self.tools.contains_key(&name) {
            return Err(Error::DuplicateTool(name));
        }
        self.tools.insert(name, Arc::from(tool));
        Ok(())
    }

    pub fn register_typed<T: TypedTool>(&mut self, tool: T) -> error::Result<()> {
        self.register(Box::new(Typed(tool)))
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declared tool schemas, `{name, description, parameters}` each.
    pub fn list_schemas(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect()
    }

    /// Get the list of tool names.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

fn validate_tool_name(name: &str) -> error::Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.len() > MAX_TOOL_NAME_LEN {
        "name is longer than 64 characters"
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        "only ASCII letters, digits, '_' and '-' are allowed"
    } else {
        return Ok(());
    };
    Err(Error::InvalidToolName {
        name: name.to_string(),
        reason,
    })
}

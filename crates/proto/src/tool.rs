use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-tool execution settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Handler deadline in milliseconds. `None` means no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Declares that the tool prefers not to run alongside others.
    /// Carried for callers; the executor does not enforce it.
    #[serde(default)]
    pub serial: bool,
}

/// Tool schema exposed to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description for tool selection.
    pub description: String,
    /// JSON schema for accepted arguments.
    pub parameters: Value,
    /// Execution settings.
    #[serde(default)]
    pub config: ToolConfig,
}

impl ToolDefinition {
    /// Creates a definition with default execution settings.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            config: ToolConfig::default(),
        }
    }

    /// Sets the handler deadline.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = Some(timeout_ms);
        self
    }

    /// Marks the tool as preferring serial execution.
    pub fn serial(mut self) -> Self {
        self.config.serial = true;
        self
    }
}

/// A tool invocation requested by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    /// Provider-assigned id, echoed by the matching result.
    pub id: String,
    /// Requested tool name.
    pub name: String,
    /// Parsed JSON arguments.
    pub input: Value,
}

/// Output of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    /// Id of the tool-use block this answers.
    pub tool_use_id: String,
    /// Handler output, always a string.
    pub content: String,
}

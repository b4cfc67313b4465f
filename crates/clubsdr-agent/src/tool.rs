//! Tool trait and execution

use async_trait::async_trait;
use clubsdr_ai::{Content, Message, ToolStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::transport::validate_with_validator;

/// Result of a tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Text returned to the model
    pub text: String,
    pub status: ToolStatus,
}

impl ToolOutput {
    /// Material was found
    pub fn found(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: ToolStatus::Found,
        }
    }

    /// The tool ran but had nothing to return
    pub fn nothing_found(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: ToolStatus::NothingFound,
        }
    }

    /// The tool could not run
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            status: ToolStatus::Failed,
        }
    }

    /// Convert into a tool-result message answering `tool_call_id`
    pub fn into_message(self, tool_call_id: &str, tool_name: &str) -> Message {
        Message::tool_result(
            tool_call_id,
            tool_name,
            vec![Content::text(self.text)],
            self.status,
        )
    }
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with already-validated arguments
    async fn execute(&self, arguments: serde_json::Value) -> ToolOutput;
}

/// Type alias for a boxed tool
pub type BoxedTool = Arc<dyn Tool>;

/// Convert a Tool to a clubsdr_ai::Tool for API calls
pub fn to_api_tool(tool: &dyn Tool) -> clubsdr_ai::Tool {
    clubsdr_ai::Tool {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    }
}

/// The set of tools offered to the model, with cached argument validators
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    /// Cached compiled JSON schema validators keyed by tool name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<BoxedTool>) -> Self {
        let mut registry = Self::default();
        for tool in tools {
            registry.register(tool);
        }
        registry
    }

    /// Add a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: BoxedTool) {
        self.tools.retain(|t| t.name() != tool.name());
        self.cache_tool_schema(&tool);
        self.tools.push(tool);
    }

    /// Compile and cache the JSON schema validator for a tool.
    fn cache_tool_schema(&mut self, tool: &BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache
                    .insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                self.schema_cache.remove(tool.name());
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions advertised to the model
    pub fn api_tools(&self) -> Vec<clubsdr_ai::Tool> {
        self.tools.iter().map(|t| to_api_tool(t.as_ref())).collect()
    }

    /// Run one tool call.
    ///
    /// Unknown tools and arguments that fail schema validation produce a
    /// `Failed` output rather than an error.
    pub async fn execute(&self, name: &str, arguments: &serde_json::Value) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            return ToolOutput::failed(format!("Tool '{}' not found", name));
        };

        if let Some(errors) = self
            .schema_cache
            .get(name)
            .and_then(|validator| validate_with_validator(arguments, validator))
        {
            return ToolOutput::failed(format!("Tool argument validation failed:\n{}", errors));
        }

        tool.execute(arguments.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple test tool that echoes its arguments.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, arguments: serde_json::Value) -> ToolOutput {
            match arguments.get("text").and_then(|v| v.as_str()) {
                Some("") => ToolOutput::nothing_found("(empty)"),
                Some(text) => ToolOutput::found(text),
                None => ToolOutput::failed("missing text"),
            }
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(vec![Arc::new(EchoTool)])
    }

    #[tokio::test]
    async fn test_execute_valid_arguments() {
        let output = registry()
            .execute("echo", &serde_json::json!({"text": "hello"}))
            .await;
        assert_eq!(output, ToolOutput::found("hello"));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool_fails() {
        let output = registry().execute("bash", &serde_json::json!({})).await;
        assert_eq!(output.status, ToolStatus::Failed);
        assert!(output.text.contains("not found"));
    }

    #[tokio::test]
    async fn test_execute_invalid_arguments_fails() {
        let output = registry()
            .execute("echo", &serde_json::json!({"text": 42}))
            .await;
        assert_eq!(output.status, ToolStatus::Failed);
        assert!(output.text.contains("validation failed"));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = registry();
        registry.register(Arc::new(EchoTool));
        let tools = registry.api_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[test]
    fn test_to_api_tool() {
        let tool = EchoTool;
        let api_tool = to_api_tool(&tool);
        assert_eq!(api_tool.name, "echo");
        assert_eq!(api_tool.description, "Echoes input");
    }

    #[test]
    fn test_into_message_carries_status() {
        let message = ToolOutput::nothing_found("none").into_message("call_1", "echo");
        match message {
            Message::ToolResult {
                tool_call_id,
                status,
                ..
            } => {
                assert_eq!(tool_call_id, "call_1");
                assert_eq!(status, ToolStatus::NothingFound);
            }
            other => panic!("expected ToolResult, got {:?}", other),
        }
    }
}

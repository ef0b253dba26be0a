//! Tools an agent can call, and the registry that holds them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ClientError;

/// A function the agent may invoke mid-conversation.
///
/// `parameters` is a JSON Schema object describing the arguments; the
/// model's arguments are passed to [`Tool::call`] unvalidated.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> serde_json::Value;

    async fn call(&self, arguments: serde_json::Value) -> Result<String, ClientError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Tool) {}
};

/// A collection of registered [`Tool`]s, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under [`Tool::name`], replacing and returning any
    /// tool previously registered under that name.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool))
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Function definitions in chat-completions `tools` format, sorted by
    /// name.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.list()
            .into_iter()
            .filter_map(|name| self.get(name))
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    /// `name: description` for each tool, sorted by name.
    pub fn summaries(&self) -> Vec<String> {
        self.list()
            .into_iter()
            .filter_map(|name| self.get(name))
            .map(|tool| format!("{}: {}", tool.name(), tool.description()))
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        name: String,
    }

    impl EchoTool {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "Echo the input back"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }

        async fn call(&self, arguments: serde_json::Value) -> Result<String, ClientError> {
            Ok(arguments["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[test]
    fn new_registry_is_empty() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.definitions().is_empty());
    }

    #[test]
    fn register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(EchoTool::new("echo")).is_none());
        assert!(registry.register(EchoTool::new("echo")).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_and_summaries_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new("weather"));
        registry.register(EchoTool::new("route"));
        assert_eq!(registry.list(), vec!["route", "weather"]);
        assert_eq!(
            registry.summaries(),
            vec![
                "route: Echo the input back".to_string(),
                "weather: Echo the input back".to_string()
            ]
        );
    }

    #[test]
    fn definitions_use_function_format() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new("echo"));
        let defs = registry.definitions();
        assert_eq!(defs[0]["type"], "function");
        assert_eq!(defs[0]["function"]["name"], "echo");
        assert_eq!(defs[0]["function"]["parameters"]["required"][0], "text");
    }

    #[tokio::test]
    async fn get_and_call() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new("echo"));
        let tool = registry.get("echo").unwrap();
        let out = tool.call(serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn debug_lists_names() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new("echo"));
        assert!(format!("{registry:?}").contains("echo"));
    }
}

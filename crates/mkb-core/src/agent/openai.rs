//! Agent backed by an OpenAI-compatible chat-completions endpoint with
//! function calling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Agent, AgentFactory, AgentMessage, ToolRegistry};
use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct OpenAiAgentConfig {
    /// API root, e.g. `https://ark.cn-beijing.volces.com/api/v3`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Upper bound on model round-trips per `generate` call.
    pub max_iterations: u32,
    pub timeout: Duration,
}

impl OpenAiAgentConfig {
    pub const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";
    pub const DEFAULT_MODEL: &str = "doubao-1-5-pro-32k-250115";
    pub const DEFAULT_MAX_ITERATIONS: u32 = 8;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
}

impl Default for OpenAiAgentConfig {
    fn default() -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            model: Self::DEFAULT_MODEL.to_string(),
            api_key: None,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Builds a new [`ToolCallingAgent`] per call, sharing the tool registry.
#[derive(Debug, Clone)]
pub struct OpenAiAgentFactory {
    config: OpenAiAgentConfig,
    tools: Arc<ToolRegistry>,
}

impl OpenAiAgentFactory {
    pub fn new(config: OpenAiAgentConfig, tools: ToolRegistry) -> Self {
        Self {
            config,
            tools: Arc::new(tools),
        }
    }
}

#[async_trait]
impl AgentFactory for OpenAiAgentFactory {
    async fn create(&self) -> Result<Box<dyn Agent>, ClientError> {
        let api_key = self
            .config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ClientError::Config("agent api_key is not set".to_string()))?;
        if self.config.base_url.is_empty() {
            return Err(ClientError::Config("agent base_url is not set".to_string()));
        }
        let http = Client::builder().timeout(self.config.timeout).build()?;

        Ok(Box::new(ToolCallingAgent {
            http,
            url: format!(
                "{}/chat/completions",
                self.config.base_url.trim_end_matches('/')
            ),
            model: self.config.model.clone(),
            api_key,
            max_iterations: self.config.max_iterations.max(1),
            tools: Arc::clone(&self.tools),
        }))
    }

    fn tool_summaries(&self) -> Vec<String> {
        self.tools.summaries()
    }
}

pub struct ToolCallingAgent {
    http: Client,
    url: String,
    model: String,
    api_key: String,
    max_iterations: u32,
    tools: Arc<ToolRegistry>,
}

impl ToolCallingAgent {
    fn build_request_body(&self, messages: &[serde_json::Value]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if !self.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(self.tools.definitions());
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// Run each requested tool and return one `tool` message per call.
///
/// Tool failures are reported back to the model as text rather than
/// aborting the conversation.
async fn run_tool_calls(tools: &ToolRegistry, calls: &[WireToolCall]) -> Vec<serde_json::Value> {
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        let output = match tools.get(&call.function.name) {
            None => format!("error: unknown tool '{}'", call.function.name),
            Some(tool) => {
                let args = if call.function.arguments.trim().is_empty() {
                    Ok(serde_json::json!({}))
                } else {
                    serde_json::from_str(&call.function.arguments)
                };
                match args {
                    Err(e) => format!("error: invalid arguments: {e}"),
                    Ok(args) => match tool.call(args).await {
                        Ok(out) => out,
                        Err(e) => {
                            warn!(tool = %call.function.name, error = %e, "tool call failed");
                            format!("error: {e}")
                        }
                    },
                }
            }
        };
        results.push(serde_json::json!({
            "role": "tool",
            "tool_call_id": call.id,
            "content": output,
        }));
    }
    results
}

#[async_trait]
impl Agent for ToolCallingAgent {
    async fn generate(&self, messages: &[AgentMessage]) -> Result<AgentMessage, ClientError> {
        let mut conversation: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();

        for iteration in 0..self.max_iterations {
            debug!(iteration, model = %self.model, "agent round-trip");
            let response = self
                .http
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(&self.build_request_body(&conversation))
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(ClientError::Status { status, body });
            }

            let parsed: CompletionResponse = response
                .json()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()))?;
            let message = parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message)
                .ok_or_else(|| ClientError::Agent("response has no choices".to_string()))?;

            let tool_calls = message.tool_calls.unwrap_or_default();
            if tool_calls.is_empty() {
                return Ok(AgentMessage::assistant(message.content.unwrap_or_default()));
            }

            conversation.push(serde_json::json!({
                "role": "assistant",
                "content": message.content.unwrap_or_default(),
                "tool_calls": tool_calls,
            }));
            conversation.extend(run_tool_calls(&self.tools, &tool_calls).await);
        }

        Err(ClientError::Agent(format!(
            "no final answer after {} iterations",
            self.max_iterations
        )))
    }
}

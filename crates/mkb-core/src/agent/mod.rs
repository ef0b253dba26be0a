//! The tool-using agent that executes individual plan steps.
//!
//! [`AgentFactory`] hands out a fresh [`Agent`] for every step execution;
//! agents never carry state from one step to the next. Cross-step memory
//! comes only from the context block the step executor builds.

pub mod openai;
pub mod tools;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

pub use openai::{OpenAiAgentConfig, OpenAiAgentFactory};
pub use tools::{Tool, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: AgentRole,
    pub content: String,
}

impl AgentMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: AgentRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: AgentRole::Assistant,
            content: content.into(),
        }
    }
}

/// A reasoning component that may call tools before answering.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run the conversation to completion and return the final assistant
    /// message. Its content may be empty.
    async fn generate(&self, messages: &[AgentMessage]) -> Result<AgentMessage, ClientError>;
}

/// Creates agents. Each call yields an independent instance.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Agent>, ClientError>;

    /// One line per tool the created agents can use, for planning prompts.
    fn tool_summaries(&self) -> Vec<String> {
        Vec::new()
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn Agent, _: &dyn AgentFactory) {}
};

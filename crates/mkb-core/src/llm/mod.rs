//! Chat-completion model interface.
//!
//! The gateway talks to one hosted model through the knowledge-base
//! service; [`ChatModel`] abstracts that endpoint so the planner and the
//! chat relay can be exercised against fakes.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single image reference inside a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message body: plain text, or a list of text and image parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// A user message carrying `text` followed by one part per image URL.
    pub fn user_with_images(text: impl Into<String>, image_urls: &[String]) -> Self {
        let mut parts = Vec::with_capacity(image_urls.len() + 1);
        parts.push(ContentPart::Text { text: text.into() });
        parts.extend(image_urls.iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.clone() },
        }));
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    /// The text portion of the message, joined across parts.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Token accounting reported by the model service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Parse the JSON-encoded usage string the service returns. Blank or
    /// unparseable input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        serde_json::from_str(raw).ok()
    }
}

/// Result of a non-streaming completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub reasoning: Option<String>,
}

/// One item of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    /// Terminal item; nothing follows it.
    Done { usage: Option<TokenUsage> },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ClientError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier, used to decide whether images can be attached.
    fn model_name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, ClientError>;

    async fn complete_stream(&self, messages: &[ChatMessage]) -> Result<ChunkStream, ClientError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ChatModel) {}
};

/// Whether `model` accepts image inputs.
pub fn is_vision_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("vision")
}

//! Retrieval-augmented chat relayed as a stream of progress and text
//! events.

use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{ServiceError, require};
use crate::knowledge::{self, KnowledgeBase, SearchRequest};
use crate::knowledge::prompt::build_answer_prompt;
use crate::llm::{ChatMessage, ChatModel, StreamChunk, TokenUsage, is_vision_model};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default, alias = "user_id")]
    pub tenant_id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// One server-sent event payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatEvent {
    Status { status: String, progress: u8 },
    Chunk { chunk: String, done: bool },
    Done { done: bool, usage: Option<TokenUsage> },
    Error { error: String },
}

impl ChatEvent {
    fn status(status: impl Into<String>, progress: u8) -> Self {
        Self::Status {
            status: status.into(),
            progress,
        }
    }

    fn chunk(text: String) -> Self {
        Self::Chunk {
            chunk: text,
            done: false,
        }
    }

    fn done(usage: Option<TokenUsage>) -> Self {
        Self::Done { done: true, usage }
    }

    fn error(err: impl std::fmt::Display) -> Self {
        Self::Error {
            error: err.to_string(),
        }
    }

    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Answer `request.query` from the tenant's knowledge base.
///
/// The stream reports progress while it checks the knowledge base,
/// retrieves, and builds the prompt, then relays model output chunk by
/// chunk. It always ends with exactly one `Done` or `Error` event.
pub fn stream_chat(
    kb: Arc<dyn KnowledgeBase>,
    llm: Arc<dyn ChatModel>,
    project: String,
    request: ChatRequest,
) -> impl Stream<Item = ChatEvent> + Send + 'static {
    async_stream::stream! {
        let started = Instant::now();
        if let Err(e) = require(&request.tenant_id, "tenant_id")
            .and_then(|()| require(&request.query, "query"))
        {
            yield ChatEvent::error(e);
            return;
        }
        info!(
            tenant_id = %request.tenant_id,
            messages = request.messages.len(),
            "streaming chat request"
        );
        yield ChatEvent::status("Request validated, processing", 20);

        let name = knowledge::collection_name(&request.tenant_id);
        yield ChatEvent::status(format!("Checking knowledge base: {name}"), 30);
        let collection =
            match knowledge::require_collection(kb.as_ref(), &request.tenant_id, &project).await {
                Ok(collection) => collection,
                Err(e) => {
                    error!(tenant_id = %request.tenant_id, error = %e, "knowledge base check failed");
                    yield ChatEvent::error(e);
                    return;
                }
            };
        yield ChatEvent::status(
            format!("Knowledge base found, resource ID: {}", collection.resource_id),
            40,
        );

        yield ChatEvent::status("Searching the knowledge base", 50);
        let search = SearchRequest::new(&collection, request.query.as_str())
            .with_messages(request.messages);
        let results = match kb.search(&search).await {
            Ok(results) => results,
            Err(e) => {
                let e = ServiceError::upstream("knowledge base search failed", e);
                error!(error = %e, "knowledge base search failed");
                yield ChatEvent::error(e);
                return;
            }
        };
        yield ChatEvent::status("Search completed, building prompt", 60);

        let rendered = build_answer_prompt(&results.hits, is_vision_model(llm.model_name()));
        let user = if rendered.image_urls.is_empty() {
            yield ChatEvent::status("Prompt ready, starting text chat", 70);
            ChatMessage::user(request.query.as_str())
        } else {
            yield ChatEvent::status(
                format!(
                    "Prompt ready with {} images, starting multimodal chat",
                    rendered.image_urls.len()
                ),
                70,
            );
            ChatMessage::user_with_images(request.query.as_str(), &rendered.image_urls)
        };
        let messages = [ChatMessage::system(rendered.prompt), user];

        yield ChatEvent::status("Generating the answer", 80);
        let mut chunks = match llm.complete_stream(&messages).await {
            Ok(chunks) => chunks,
            Err(e) => {
                let e = ServiceError::upstream("failed to generate response", e);
                error!(error = %e, "model stream failed to start");
                yield ChatEvent::error(e);
                return;
            }
        };

        let mut count = 0usize;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(StreamChunk::Text(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    count += 1;
                    yield ChatEvent::chunk(text);
                }
                Ok(StreamChunk::Done { usage }) => {
                    info!(
                        tenant_id = %request.tenant_id,
                        chunks = count,
                        duration = ?started.elapsed(),
                        "streaming chat completed"
                    );
                    yield ChatEvent::done(usage);
                    return;
                }
                Err(e) => {
                    error!(error = %e, "model stream failed");
                    yield ChatEvent::error(ServiceError::upstream("failed to generate response", e));
                    return;
                }
            }
        }

        // Stream closed without a terminal frame.
        yield ChatEvent::done(None);
    }
}

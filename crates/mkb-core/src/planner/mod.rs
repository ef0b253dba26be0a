//! Plan orchestration: retrieve reference material for a goal, ask the
//! model for a stepwise plan, and open a [`PlanSession`] for it.
//!
//! [`PlanSession`]: crate::session::PlanSession

pub mod prompt;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::info;

use crate::error::{ServiceError, require};
use crate::knowledge::{self, KnowledgeBase, SearchRequest};
use crate::llm::{ChatMessage, ChatModel, TokenUsage, is_vision_model};
use crate::session::SessionStore;

pub use prompt::{RAW_PLAN_KEY, build_plan_prompt, parse_plan};

/// A request to plan toward a goal.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanRequest {
    #[serde(default, alias = "user_id")]
    pub tenant_id: String,
    #[serde(default)]
    pub query: String,
    /// Earlier conversation turns, passed to retrieval.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// A generated plan and the session tracking its execution.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// The model's answer, verbatim.
    pub plan_text: String,
    /// Parsed plan as stored on the session.
    pub plan: serde_json::Value,
    pub usage: Option<TokenUsage>,
    pub session_id: String,
    pub duration: Duration,
}

pub struct PlanOrchestrator {
    kb: Arc<dyn KnowledgeBase>,
    llm: Arc<dyn ChatModel>,
    store: Arc<SessionStore>,
    project: String,
    tool_summaries: Vec<String>,
}

impl PlanOrchestrator {
    pub fn new(
        kb: Arc<dyn KnowledgeBase>,
        llm: Arc<dyn ChatModel>,
        store: Arc<SessionStore>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            kb,
            llm,
            store,
            project: project.into(),
            tool_summaries: Vec::new(),
        }
    }

    /// Tools to advertise in the planning prompt, one `name: description`
    /// line each.
    pub fn with_tool_summaries(mut self, summaries: Vec<String>) -> Self {
        self.tool_summaries = summaries;
        self
    }

    /// Produce a plan for `request.query` and open a session for it.
    ///
    /// Nothing is stored unless every external call succeeds.
    pub async fn plan(&self, request: PlanRequest) -> Result<PlanOutcome, ServiceError> {
        let started = Instant::now();
        require(&request.tenant_id, "tenant_id")?;
        require(&request.query, "query")?;

        info!(
            tenant_id = %request.tenant_id,
            messages = request.messages.len(),
            "planning request"
        );

        let collection =
            knowledge::require_collection(self.kb.as_ref(), &request.tenant_id, &self.project)
                .await?;

        let search = SearchRequest::new(&collection, request.query.as_str())
            .with_messages(request.messages);
        let results = self
            .kb
            .search(&search)
            .await
            .map_err(|e| ServiceError::upstream("knowledge base search failed", e))?;
        info!(hits = results.hits.len(), "knowledge base search completed");

        let vision = is_vision_model(self.llm.model_name());
        let rendered = build_plan_prompt(&results.hits, &self.tool_summaries, vision);
        let user = if rendered.image_urls.is_empty() {
            ChatMessage::user(request.query.as_str())
        } else {
            ChatMessage::user_with_images(request.query.as_str(), &rendered.image_urls)
        };
        let messages = [ChatMessage::system(rendered.prompt), user];

        let completion = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| ServiceError::upstream("plan generation failed", e))?;

        let plan = parse_plan(&completion.text);
        let session = self
            .store
            .create(&request.tenant_id, &request.query, plan.clone())
            .await;

        let duration = started.elapsed();
        info!(
            tenant_id = %request.tenant_id,
            session_id = %session.id(),
            ?duration,
            "plan created"
        );

        Ok(PlanOutcome {
            plan_text: completion.text,
            plan,
            usage: completion.usage,
            session_id: session.id().to_string(),
            duration,
        })
    }
}

impl std::fmt::Debug for PlanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanOrchestrator")
            .field("model", &self.llm.model_name())
            .field("project", &self.project)
            .field("tools", &self.tool_summaries.len())
            .finish()
    }
}

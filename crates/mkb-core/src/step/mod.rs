//! Executes one plan step with a fresh agent and records the outcome on
//! the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::agent::{AgentFactory, AgentMessage};
use crate::error::{ServiceError, require};
use crate::session::{SessionStore, StepResult, render_context};

/// Message returned when a step references an unknown or expired session.
pub const SESSION_NOT_FOUND: &str = "Session not found. Please regenerate the plan.";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepRequest {
    #[serde(default, alias = "user_id")]
    pub tenant_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub step_number: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_outcome: String,
}

/// The step's own metadata, echoed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepInfo {
    pub step_number: i64,
    pub title: String,
    pub description: String,
    pub expected_outcome: String,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub execution_result: String,
    /// Number of earlier successful steps offered to the agent as context.
    pub previous_steps_used: usize,
    pub step_info: StepInfo,
    pub tenant_id: String,
    pub session_id: String,
    pub duration: Duration,
}

pub struct StepExecutor {
    store: Arc<SessionStore>,
    agents: Arc<dyn AgentFactory>,
}

impl StepExecutor {
    pub fn new(store: Arc<SessionStore>, agents: Arc<dyn AgentFactory>) -> Self {
        Self { store, agents }
    }

    /// Run one step.
    ///
    /// Whatever happens after the session is found, the step's result is
    /// written back to it: `success` with the agent's output, or `failed`
    /// with the error text. A failure is also returned to the caller.
    pub async fn execute(&self, request: StepRequest) -> Result<StepOutcome, ServiceError> {
        let started = Instant::now();
        require(&request.tenant_id, "tenant_id")?;
        require(&request.session_id, "session_id")?;

        let session = self
            .store
            .get(&request.session_id)
            .await
            .ok_or_else(|| ServiceError::not_found(SESSION_NOT_FOUND))?;

        info!(
            tenant_id = %request.tenant_id,
            session_id = %request.session_id,
            step_number = request.step_number,
            title = %request.title,
            "executing plan step"
        );

        let mut result = StepResult::pending(
            request.step_number,
            request.title.as_str(),
            request.description.as_str(),
            request.expected_outcome.as_str(),
        );

        let agent = match self.agents.create().await {
            Ok(agent) => agent,
            Err(e) => {
                error!(session_id = %request.session_id, error = %e, "agent initialization failed");
                result.fail(format!("Failed to initialize agent: {e}"));
                session.upsert_step_result(result).await;
                return Err(ServiceError::upstream("failed to initialize agent", e));
            }
        };

        let previous = session.previous_successful_steps(request.step_number).await;
        let previous_steps_used = previous.len();
        let context = render_context(&previous);
        info!(previous_steps_used, "built context from previous steps");

        let prompt = task_prompt(&request, &context);
        let reply = match agent.generate(&[AgentMessage::user(prompt)]).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(session_id = %request.session_id, error = %e, "agent execution failed");
                result.fail(format!("Agent execution failed: {e}"));
                session.upsert_step_result(result).await;
                return Err(ServiceError::upstream("failed to execute step", e));
            }
        };

        if reply.content.is_empty() {
            warn!(
                session_id = %request.session_id,
                step_number = request.step_number,
                "agent returned empty content"
            );
        }
        result.succeed(reply.content.as_str());
        session.upsert_step_result(result).await;

        let duration = started.elapsed();
        info!(
            session_id = %request.session_id,
            step_number = request.step_number,
            ?duration,
            "plan step completed"
        );

        Ok(StepOutcome {
            execution_result: reply.content,
            previous_steps_used,
            step_info: StepInfo {
                step_number: request.step_number,
                title: request.title,
                description: request.description,
                expected_outcome: request.expected_outcome,
            },
            tenant_id: request.tenant_id,
            session_id: request.session_id,
            duration,
        })
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor").finish_non_exhaustive()
    }
}

/// Compose the single user message handed to the agent.
pub fn task_prompt(request: &StepRequest, context: &str) -> String {
    format!(
        "You are executing one step of a multi-step plan. Carry out the following step:

## Current step
Step {number}: {title}

**Description**: {description}
**Expected outcome**: {expected}

{context}

## Guidelines
Perform the work described above and report the result in detail. Note:
1. If a tool is needed to complete the task, call it.
2. If results from earlier steps help with this step, make full use of them.
3. Do not repeat work that earlier steps have already completed.
4. Make sure your result gives later steps useful information.",
        number = request.step_number,
        title = request.title,
        description = request.description,
        expected = request.expected_outcome,
    )
}

//! The plan session aggregate and its step results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::context::render_context;

/// Outcome of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Record of one plan step's execution.
///
/// Step numbers are caller-supplied and are not checked against the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_number: i64,
    pub title: String,
    pub description: String,
    pub expected_outcome: String,
    pub execution_result: String,
    pub status: StepStatus,
    pub executed_at: DateTime<Utc>,
}

impl StepResult {
    /// A new pending result stamped with the current time.
    pub fn pending(
        step_number: i64,
        title: impl Into<String>,
        description: impl Into<String>,
        expected_outcome: impl Into<String>,
    ) -> Self {
        Self {
            step_number,
            title: title.into(),
            description: description.into(),
            expected_outcome: expected_outcome.into(),
            execution_result: String::new(),
            status: StepStatus::Pending,
            executed_at: Utc::now(),
        }
    }

    pub fn succeed(&mut self, output: impl Into<String>) {
        self.status = StepStatus::Success;
        self.execution_result = output.into();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.execution_result = reason.into();
    }
}

#[derive(Debug)]
struct SessionState {
    step_results: Vec<StepResult>,
    updated_at: DateTime<Utc>,
}

/// One planning conversation: the original goal, the generated plan, and
/// the results of every step executed so far.
///
/// Identity and creation data are immutable; the step results and the
/// last-update timestamp sit behind a lock owned by this session alone.
#[derive(Debug)]
pub struct PlanSession {
    id: String,
    tenant_id: String,
    original_query: String,
    plan: serde_json::Value,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
}

/// Point-in-time copy of a session, as returned by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub tenant_id: String,
    pub original_query: String,
    pub plan_data: serde_json::Value,
    pub step_results: Vec<StepResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanSession {
    pub(crate) fn new(
        id: String,
        tenant_id: String,
        original_query: String,
        plan: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            original_query,
            plan,
            created_at: now,
            state: RwLock::new(SessionState {
                step_results: Vec::new(),
                updated_at: now,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn original_query(&self) -> &str {
        &self.original_query
    }

    pub fn plan(&self) -> &serde_json::Value {
        &self.plan
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn updated_at(&self) -> DateTime<Utc> {
        self.state.read().await.updated_at
    }

    /// Insert a step result, replacing any existing entry with the same
    /// step number in place. Bumps the last-update timestamp.
    pub async fn upsert_step_result(&self, result: StepResult) {
        let mut state = self.state.write().await;
        match state
            .step_results
            .iter_mut()
            .find(|r| r.step_number == result.step_number)
        {
            Some(existing) => *existing = result,
            None => state.step_results.push(result),
        }
        state.updated_at = Utc::now();
    }

    /// All recorded step results in storage order.
    pub async fn step_results(&self) -> Vec<StepResult> {
        self.state.read().await.step_results.clone()
    }

    /// Successful results for steps numbered below `step_number`, in
    /// storage order. Pending and failed entries are skipped.
    pub async fn previous_successful_steps(&self, step_number: i64) -> Vec<StepResult> {
        self.state
            .read()
            .await
            .step_results
            .iter()
            .filter(|r| r.step_number < step_number && r.status == StepStatus::Success)
            .cloned()
            .collect()
    }

    /// Context block for `step_number`, built from the previous successful
    /// steps. Empty when there are none.
    pub async fn render_context(&self, step_number: i64) -> String {
        let previous = self.previous_successful_steps(step_number).await;
        render_context(&previous)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read().await;
        SessionSnapshot {
            session_id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            original_query: self.original_query.clone(),
            plan_data: self.plan.clone(),
            step_results: state.step_results.clone(),
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }
}

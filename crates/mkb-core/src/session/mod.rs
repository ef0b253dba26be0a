//! In-memory plan sessions.
//!
//! The [`SessionStore`] maps session IDs to shared [`PlanSession`] handles.
//! The store lock only guards the map itself; each session carries its own
//! lock for its step results, so sessions never contend with each other.
//! Nothing here is persisted: a restart loses every session.

mod context;
mod plan;
pub mod sweeper;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

pub use context::render_context;
pub use plan::{PlanSession, SessionSnapshot, StepResult, StepStatus};

/// Process-wide registry of live plan sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<PlanSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for `tenant_id` and return a shared handle.
    ///
    /// The ID is `<tenant_id>_<random token>`, so two sessions created in
    /// the same instant for the same tenant never collide.
    pub async fn create(
        &self,
        tenant_id: &str,
        query: &str,
        plan: serde_json::Value,
    ) -> Arc<PlanSession> {
        let id = format!("{tenant_id}_{}", Uuid::new_v4().simple());
        let session = Arc::new(PlanSession::new(
            id.clone(),
            tenant_id.to_string(),
            query.to_string(),
            plan,
            Utc::now(),
        ));
        self.sessions.write().await.insert(id, Arc::clone(&session));
        tracing::debug!(session_id = %session.id(), tenant_id, "plan session created");
        session
    }

    /// Look up a session. An unknown ID yields `None`.
    pub async fn get(&self, session_id: &str) -> Option<Arc<PlanSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Remove every session whose last update is strictly older than
    /// `now - threshold`. Returns how many were removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>, threshold: Duration) -> usize {
        let cutoff = now - threshold;
        let mut sessions = self.sessions.write().await;

        let mut expired = Vec::new();
        for (id, session) in sessions.iter() {
            if session.updated_at().await < cutoff {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            sessions.remove(id);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

//! Shared helpers for unit tests.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use tower::ServiceExt;

use mkb_core::files::DEFAULT_MAX_UPLOAD_BYTES;
use mkb_test_utils::{FakeAgentFactory, FakeChatModel, FakeKnowledgeBase, FakeObjectStore};

use crate::serve_cmd::{AppState, build_router};

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests that read or write process environment variables.
pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// -----------------------------------------------------------------------
// HTTP helpers
// -----------------------------------------------------------------------

/// The fakes behind a test router, kept so tests can inspect them.
pub struct Fakes {
    pub kb: Arc<FakeKnowledgeBase>,
    pub llm: Arc<FakeChatModel>,
    pub objects: Arc<FakeObjectStore>,
    pub agents: Arc<FakeAgentFactory>,
    pub max_upload_bytes: u64,
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new(
            FakeKnowledgeBase::new(),
            FakeChatModel::new(""),
            FakeObjectStore::new(),
            FakeAgentFactory::new(),
        )
    }
}

impl Fakes {
    pub fn new(
        kb: FakeKnowledgeBase,
        llm: FakeChatModel,
        objects: FakeObjectStore,
        agents: FakeAgentFactory,
    ) -> Self {
        Self {
            kb: Arc::new(kb),
            llm: Arc::new(llm),
            objects: Arc::new(objects),
            agents: Arc::new(agents),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    /// Router over these fakes, serving static files from a fresh temp dir.
    pub fn app(&self) -> (Router, tempfile::TempDir) {
        let static_dir = tempfile::TempDir::new().unwrap();
        let state = AppState::new(
            self.kb.clone(),
            self.llm.clone(),
            self.objects.clone(),
            self.agents.clone(),
            "default",
            self.max_upload_bytes,
        );
        (build_router(state, static_dir.path()), static_dir)
    }
}

pub fn test_app() -> (Router, tempfile::TempDir) {
    Fakes::default().app()
}

pub async fn send(app: &Router, request: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(request).await.unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

//! HTTP gateway: shared state, router, and server entry point.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};

use mkb_core::agent::{AgentFactory, OpenAiAgentFactory, ToolRegistry};
use mkb_core::error::ServiceError;
use mkb_core::files::FileService;
use mkb_core::knowledge::KnowledgeBase;
use mkb_core::knowledge::viking::VikingClient;
use mkb_core::llm::ChatModel;
use mkb_core::planner::PlanOrchestrator;
use mkb_core::session::SessionStore;
use mkb_core::session::sweeper::spawn_sweeper;
use mkb_core::step::StepExecutor;
use mkb_core::storage::ObjectStore;
use mkb_core::storage::tos::TosClient;

use crate::config::MkbConfig;
use crate::handlers;

/// Room for multipart boundaries and form fields on top of the file itself.
const MULTIPART_OVERHEAD: usize = 1 << 20;

// -----------------------------------------------------------------------
// Error type
// -----------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(msg) => Self::bad_request(msg),
            ServiceError::NotFound(msg) => Self::not_found(msg),
            upstream @ ServiceError::Upstream { .. } => {
                tracing::error!(error = %upstream, "upstream failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, upstream.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// -----------------------------------------------------------------------
// Shared state
// -----------------------------------------------------------------------

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub planner: Arc<PlanOrchestrator>,
    pub executor: Arc<StepExecutor>,
    pub files: Arc<FileService>,
    pub kb: Arc<dyn KnowledgeBase>,
    pub llm: Arc<dyn ChatModel>,
    pub project: String,
}

impl AppState {
    pub fn new(
        kb: Arc<dyn KnowledgeBase>,
        llm: Arc<dyn ChatModel>,
        objects: Arc<dyn ObjectStore>,
        agents: Arc<dyn AgentFactory>,
        project: &str,
        max_upload_bytes: u64,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let planner = PlanOrchestrator::new(kb.clone(), llm.clone(), sessions.clone(), project)
            .with_tool_summaries(agents.tool_summaries());
        let executor = StepExecutor::new(sessions.clone(), agents);
        let files =
            FileService::new(objects, kb.clone(), project).with_max_upload_bytes(max_upload_bytes);
        Self {
            sessions,
            planner: Arc::new(planner),
            executor: Arc::new(executor),
            files: Arc::new(files),
            kb,
            llm,
            project: project.to_string(),
        }
    }
}

// -----------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------

/// Build the gateway router.
///
/// Every API route is served both at the root and under `/api`.
pub fn build_router(state: AppState, static_dir: &Path) -> Router {
    let upload_limit = usize::try_from(state.files.max_upload_bytes())
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    let api = Router::new()
        .route("/plan", post(handlers::plan::create_plan))
        .route("/plan/step", post(handlers::plan::execute_step))
        .route(
            "/plan/session/{session_id}",
            get(handlers::plan::session_status),
        )
        .route(
            "/plan/session/{session_id}/context/{step_number}",
            get(handlers::plan::step_context),
        )
        .route(
            "/upload",
            post(handlers::files::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files", get(handlers::files::list))
        .route(
            "/files/{filename}",
            get(handlers::files::download).delete(handlers::files::delete),
        )
        .route("/documents/status", get(handlers::files::document_status))
        .route("/chat/stream", post(handlers::chat::chat_stream));

    Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .route("/health", get(handlers::health))
        .route_service("/mkb", ServeFile::new(static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// -----------------------------------------------------------------------
// Entry point
// -----------------------------------------------------------------------

/// Build the real service clients and run the gateway until Ctrl+C.
pub async fn run_serve(config: MkbConfig) -> Result<()> {
    let viking =
        Arc::new(VikingClient::new(config.viking).context("failed to build knowledge base client")?);
    let objects =
        Arc::new(TosClient::new(config.tos).context("failed to build object storage client")?);
    let agents = Arc::new(OpenAiAgentFactory::new(config.agent, ToolRegistry::new()));

    let state = AppState::new(
        viking.clone(),
        viking,
        objects,
        agents,
        &config.project,
        config.max_upload_bytes,
    );

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(state.sessions.clone(), config.sweeper, cancel.clone());

    let app = build_router(state, &config.static_dir);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid bind address: {}:{}", config.bind, config.port))?;

    tracing::info!(project = %config.project, "mkb gateway listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "session sweeper did not stop cleanly");
    }
    tracing::info!("mkb gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::test_util::{body_json, test_app};

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert!(json["time"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn routes_are_mirrored_under_api_prefix() {
        let (app, _) = test_app();
        for uri in ["/plan/session/nope", "/api/plan/session/nope"] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn mkb_serves_index_page() {
        let (app, static_dir) = test_app();
        std::fs::write(static_dir.path().join("index.html"), "<h1>mkb</h1>").unwrap();
        std::fs::write(static_dir.path().join("app.js"), "console.log(1)").unwrap();

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/mkb").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"<h1>mkb</h1>");

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/static/app.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_preflight_is_allowed() {
        let (app, _) = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/plan")
                    .header("origin", "http://localhost:3000")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(
            resp.headers()
                .contains_key("access-control-allow-origin")
        );
    }
}

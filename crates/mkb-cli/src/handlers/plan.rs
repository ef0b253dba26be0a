//! Plan creation, step execution, and session inspection.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde_json::json;

use mkb_core::planner::PlanRequest;
use mkb_core::step::{SESSION_NOT_FOUND, StepRequest};

use super::parse_json;
use crate::serve_cmd::{AppError, AppState};

pub async fn create_plan(
    State(state): State<AppState>,
    payload: Result<Json<PlanRequest>, JsonRejection>,
) -> Result<axum::response::Response, AppError> {
    let request = parse_json(payload)?;
    let tenant_id = request.tenant_id.clone();
    tracing::info!(tenant_id = %tenant_id, "plan request");

    let outcome = state.planner.plan(request).await?;

    Ok(Json(json!({
        "plan": outcome.plan_text,
        "usage": outcome.usage,
        "tenant_id": tenant_id,
        "session_id": outcome.session_id,
        "duration": format!("{:?}", outcome.duration),
    }))
    .into_response())
}

pub async fn execute_step(
    State(state): State<AppState>,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> Result<axum::response::Response, AppError> {
    let request = parse_json(payload)?;
    tracing::info!(
        tenant_id = %request.tenant_id,
        session_id = %request.session_id,
        step_number = request.step_number,
        "plan step request"
    );

    let outcome = state.executor.execute(request).await?;

    Ok(Json(json!({
        "message": "Step executed successfully",
        "step_info": outcome.step_info,
        "execution_result": outcome.execution_result,
        "previous_steps_used": outcome.previous_steps_used,
        "tenant_id": outcome.tenant_id,
        "session_id": outcome.session_id,
        "duration": format!("{:?}", outcome.duration),
    }))
    .into_response())
}

pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let session = state
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| AppError::not_found(SESSION_NOT_FOUND))?;
    Ok(Json(session.snapshot().await).into_response())
}

/// Context block a given step would receive, without running it.
pub async fn step_context(
    State(state): State<AppState>,
    Path((session_id, step_number)): Path<(String, String)>,
) -> Result<axum::response::Response, AppError> {
    let session = state
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| AppError::not_found(SESSION_NOT_FOUND))?;
    let step_number: i64 = step_number
        .trim()
        .parse()
        .map_err(|_| AppError::bad_request("Invalid step number"))?;

    let context = session.render_context(step_number).await;
    tracing::debug!(session_id = %session_id, step_number, empty = context.is_empty(), "step context");
    Ok(Json(json!({ "context": context })).into_response())
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::{Value, json};

    use mkb_core::knowledge::SearchHit;
    use mkb_test_utils::{FakeAgentFactory, FakeChatModel, FakeKnowledgeBase, FakeObjectStore};

    use crate::test_util::{Fakes, body_json, get, post_json, send};

    const PLAN_JSON: &str = r#"{"goal_analysis": "trip", "steps": [
        {"step_number": 1, "title": "Find flights", "description": "d1", "expected_outcome": "o1"},
        {"step_number": 2, "title": "Book hotel", "description": "d2", "expected_outcome": "o2"}
    ]}"#;

    fn fakes(agents: FakeAgentFactory) -> Fakes {
        Fakes::new(
            FakeKnowledgeBase::new().with_tenant("u1").with_hits(vec![SearchHit {
                content: "Flights leave at 09:00.".to_string(),
                ..Default::default()
            }]),
            FakeChatModel::new(PLAN_JSON),
            FakeObjectStore::new(),
            agents,
        )
    }

    fn step_body(session_id: &str, step_number: i64, title: &str) -> Value {
        json!({
            "user_id": "u1",
            "session_id": session_id,
            "step_number": step_number,
            "title": title,
            "description": format!("{title} description"),
            "expected_outcome": format!("{title} outcome"),
        })
    }

    async fn create_session(app: &axum::Router) -> String {
        let resp = send(
            app,
            post_json("/plan", json!({"tenant_id": "u1", "query": "plan a trip"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        json["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn plan_returns_parsed_plan_and_session() {
        let (app, _dir) = fakes(FakeAgentFactory::new()).app();

        let resp = send(
            &app,
            post_json("/api/plan", json!({"user_id": "u1", "query": "plan a trip"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["tenant_id"], "u1");
        assert_eq!(json["plan"], PLAN_JSON);
        let session_id = json["session_id"].as_str().unwrap();
        assert!(session_id.starts_with("u1_"));
        assert!(json["duration"].is_string());

        let resp = send(&app, get(&format!("/plan/session/{session_id}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let snapshot = body_json(resp).await;
        assert_eq!(snapshot["original_query"], "plan a trip");
        assert_eq!(snapshot["tenant_id"], "u1");
        assert_eq!(snapshot["step_results"], json!([]));
        assert_eq!(snapshot["plan_data"]["steps"][1]["title"], "Book hotel");
    }

    #[tokio::test]
    async fn plan_field_is_model_text_verbatim() {
        let answer = "1. book flights\n2. book hotel";
        let (app, _dir) = Fakes::new(
            FakeKnowledgeBase::new().with_tenant("u1"),
            FakeChatModel::new(answer),
            FakeObjectStore::new(),
            FakeAgentFactory::new(),
        )
        .app();

        let resp = send(
            &app,
            post_json("/plan", json!({"tenant_id": "u1", "query": "plan a trip"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["plan"], answer);

        let session_id = json["session_id"].as_str().unwrap();
        let resp = send(&app, get(&format!("/plan/session/{session_id}"))).await;
        let snapshot = body_json(resp).await;
        assert_eq!(snapshot["plan_data"]["raw_plan"], answer);
    }

    #[tokio::test]
    async fn plan_validation_and_missing_knowledge_base() {
        let (app, _dir) = fakes(FakeAgentFactory::new()).app();

        let resp = send(&app, post_json("/plan", json!({"tenant_id": "u1"}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "query is required");

        let resp = send(
            &app,
            post_json("/plan", json!({"tenant_id": "nobody", "query": "hi"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let msg = body_json(resp).await["error"].as_str().unwrap().to_string();
        assert!(msg.contains("Knowledge base not found"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let (app, _dir) = fakes(FakeAgentFactory::new()).app();
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/plan")
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{not json"))
            .unwrap();
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let msg = body_json(resp).await["error"].as_str().unwrap().to_string();
        assert!(msg.starts_with("Invalid request format"));
    }

    #[tokio::test]
    async fn steps_build_on_earlier_results() {
        let agents = FakeAgentFactory::new()
            .reply("found flights")
            .reply("booked hotel");
        let (app, _dir) = fakes(agents).app();
        let session_id = create_session(&app).await;

        let resp = send(&app, post_json("/plan/step", step_body(&session_id, 1, "Find flights"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["execution_result"], "found flights");
        assert_eq!(json["previous_steps_used"], 0);
        assert_eq!(json["step_info"]["step_number"], 1);
        assert_eq!(json["tenant_id"], "u1");

        let resp = send(&app, get(&format!("/plan/session/{session_id}/context/2"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let context = body_json(resp).await["context"].as_str().unwrap().to_string();
        assert!(context.contains("Step 1: Find flights"));
        assert!(context.contains("found flights"));

        let resp = send(&app, post_json("/plan/step", step_body(&session_id, 2, "Book hotel"))).await;
        let json = body_json(resp).await;
        assert_eq!(json["previous_steps_used"], 1);

        let resp = send(&app, get(&format!("/plan/session/{session_id}"))).await;
        let snapshot = body_json(resp).await;
        let steps = snapshot["step_results"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s["status"] == "success"));
    }

    #[tokio::test]
    async fn first_step_has_empty_context() {
        let (app, _dir) = fakes(FakeAgentFactory::new()).app();
        let session_id = create_session(&app).await;

        let resp = send(&app, get(&format!("/plan/session/{session_id}/context/1"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["context"], "");
    }

    #[tokio::test]
    async fn context_rejects_non_integer_step() {
        let (app, _dir) = fakes(FakeAgentFactory::new()).app();
        let session_id = create_session(&app).await;

        let resp = send(&app, get(&format!("/plan/session/{session_id}/context/two"))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "Invalid step number");

        let resp = send(&app, get("/plan/session/missing/context/2")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let agents = FakeAgentFactory::new();
        let fakes = fakes(agents);
        let (app, _dir) = fakes.app();

        let resp = send(&app, post_json("/plan/step", step_body("u1_missing", 1, "x"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let msg = body_json(resp).await["error"].as_str().unwrap().to_string();
        assert!(msg.contains("regenerate the plan"));
        assert_eq!(fakes.agents.created(), 0);
    }

    #[tokio::test]
    async fn failed_step_is_recorded_and_reported() {
        let agents = FakeAgentFactory::new().reply_error("tool crashed");
        let (app, _dir) = fakes(agents).app();
        let session_id = create_session(&app).await;

        let resp = send(&app, post_json("/plan/step", step_body(&session_id, 1, "Find flights"))).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = send(&app, get(&format!("/plan/session/{session_id}"))).await;
        let snapshot = body_json(resp).await;
        assert_eq!(snapshot["step_results"][0]["status"], "failed");
        assert!(
            snapshot["step_results"][0]["execution_result"]
                .as_str()
                .unwrap()
                .contains("tool crashed")
        );
    }
}

//! Planner and step executor driven against in-memory collaborators.

use std::sync::Arc;

use mkb_core::error::ServiceError;
use mkb_core::knowledge::SearchHit;
use mkb_core::llm::{MessageContent, TokenUsage};
use mkb_core::planner::{PlanOrchestrator, PlanRequest, RAW_PLAN_KEY};
use mkb_core::session::{SessionStore, StepStatus};
use mkb_core::step::{StepExecutor, StepRequest};
use mkb_test_utils::{FakeAgentFactory, FakeChatModel, FakeKnowledgeBase};

const PLAN_JSON: &str = r#"{
  "goal_analysis": "A weekend trip",
  "steps": [
    {"step_number": 1, "title": "Find flights", "description": "Search flights", "expected_outcome": "Flight options"},
    {"step_number": 2, "title": "Book hotel", "description": "Pick a hotel", "expected_outcome": "A booking"}
  ]
}"#;

fn hits() -> Vec<SearchHit> {
    vec![SearchHit {
        content: "Direct flights depart daily at 09:00.".to_string(),
        doc_name: "travel.pdf".to_string(),
        ..Default::default()
    }]
}

fn orchestrator(
    kb: FakeKnowledgeBase,
    llm: FakeChatModel,
    store: Arc<SessionStore>,
) -> (PlanOrchestrator, Arc<FakeKnowledgeBase>, Arc<FakeChatModel>) {
    let kb = Arc::new(kb);
    let llm = Arc::new(llm);
    let planner = PlanOrchestrator::new(kb.clone(), llm.clone(), store, "default");
    (planner, kb, llm)
}

fn plan_request(tenant: &str, query: &str) -> PlanRequest {
    PlanRequest {
        tenant_id: tenant.to_string(),
        query: query.to_string(),
        messages: Vec::new(),
    }
}

fn step_request(session_id: &str, step_number: i64, title: &str) -> StepRequest {
    StepRequest {
        tenant_id: "u1".to_string(),
        session_id: session_id.to_string(),
        step_number,
        title: title.to_string(),
        description: format!("{title} description"),
        expected_outcome: format!("{title} outcome"),
    }
}

#[tokio::test]
async fn plan_creates_session_with_parsed_plan() {
    let store = Arc::new(SessionStore::new());
    let usage = TokenUsage {
        prompt_tokens: 120,
        completion_tokens: 40,
        total_tokens: 160,
    };
    let (planner, kb, llm) = orchestrator(
        FakeKnowledgeBase::new().with_tenant("u1").with_hits(hits()),
        FakeChatModel::new(PLAN_JSON).with_usage(usage),
        store.clone(),
    );

    let outcome = planner.plan(plan_request("u1", "plan a trip")).await.unwrap();

    assert!(outcome.session_id.starts_with("u1_"));
    assert_eq!(outcome.plan_text, PLAN_JSON);
    assert_eq!(outcome.usage, Some(usage));
    assert_eq!(outcome.plan["steps"][1]["title"], "Book hotel");

    let session = store.get(&outcome.session_id).await.unwrap();
    assert_eq!(session.tenant_id(), "u1");
    assert_eq!(session.original_query(), "plan a trip");
    assert_eq!(session.plan(), &outcome.plan);
    assert!(session.step_results().await.is_empty());

    let searches = kb.searches();
    assert_eq!(searches.len(), 1);
    assert_eq!(searches[0].collection, "kb_u1");
    assert_eq!(searches[0].resource_id.as_deref(), Some("res-u1"));

    let request = &llm.requests()[0];
    assert_eq!(request.len(), 2);
    assert!(request[0].text().contains("Direct flights depart daily at 09:00."));
    assert_eq!(request[1].content, MessageContent::Text("plan a trip".to_string()));
}

#[tokio::test]
async fn unparseable_plan_is_kept_raw() {
    let store = Arc::new(SessionStore::new());
    let (planner, _, _) = orchestrator(
        FakeKnowledgeBase::new().with_tenant("u1"),
        FakeChatModel::new("First book flights, then a hotel."),
        store.clone(),
    );

    let outcome = planner.plan(plan_request("u1", "plan a trip")).await.unwrap();
    let session = store.get(&outcome.session_id).await.unwrap();
    assert_eq!(
        session.plan()[RAW_PLAN_KEY],
        "First book flights, then a hotel."
    );
}

#[tokio::test]
async fn vision_model_receives_images() {
    let store = Arc::new(SessionStore::new());
    let image_hit = SearchHit {
        content: "Venue map".to_string(),
        image_link: Some("https://img.test/map.png".to_string()),
        ..Default::default()
    };
    let (planner, _, llm) = orchestrator(
        FakeKnowledgeBase::new()
            .with_tenant("u1")
            .with_hits(vec![image_hit]),
        FakeChatModel::new(PLAN_JSON).with_model("doubao-vision-pro"),
        store,
    );

    planner.plan(plan_request("u1", "plan a trip")).await.unwrap();

    let request = &llm.requests()[0];
    assert!(request[0].text().contains("Venue map<img>image 1</img>"));
    match &request[1].content {
        MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
        other => panic!("expected multimodal content, got {other:?}"),
    }
}

#[tokio::test]
async fn plan_validation_makes_no_calls() {
    let store = Arc::new(SessionStore::new());
    let (planner, kb, llm) = orchestrator(
        FakeKnowledgeBase::new().with_tenant("u1"),
        FakeChatModel::new(PLAN_JSON),
        store.clone(),
    );

    let err = planner.plan(plan_request("", "plan a trip")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(ref m) if m == "tenant_id is required"));
    let err = planner.plan(plan_request("u1", "  ")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(ref m) if m == "query is required"));

    assert!(kb.searches().is_empty());
    assert!(llm.requests().is_empty());
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn plan_without_knowledge_base_is_not_found() {
    let store = Arc::new(SessionStore::new());
    let (planner, kb, llm) = orchestrator(
        FakeKnowledgeBase::new(),
        FakeChatModel::new(PLAN_JSON),
        store.clone(),
    );

    let err = planner.plan(plan_request("u1", "plan a trip")).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    assert!(kb.searches().is_empty());
    assert!(llm.requests().is_empty());
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn plan_upstream_failures_create_no_session() {
    let store = Arc::new(SessionStore::new());

    let (planner, _, _) = orchestrator(
        FakeKnowledgeBase::new().failing_lookup(),
        FakeChatModel::new(PLAN_JSON),
        store.clone(),
    );
    let err = planner.plan(plan_request("u1", "q")).await.unwrap_err();
    assert!(err.to_string().starts_with("failed to check knowledge base"));

    let (planner, _, llm) = orchestrator(
        FakeKnowledgeBase::new().with_tenant("u1").failing_search(),
        FakeChatModel::new(PLAN_JSON),
        store.clone(),
    );
    let err = planner.plan(plan_request("u1", "q")).await.unwrap_err();
    assert!(err.to_string().starts_with("knowledge base search failed"));
    assert!(llm.requests().is_empty());

    let (planner, _, _) = orchestrator(
        FakeKnowledgeBase::new().with_tenant("u1"),
        FakeChatModel::new(PLAN_JSON).failing(),
        store.clone(),
    );
    let err = planner.plan(plan_request("u1", "q")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Upstream { .. }));
    assert!(err.to_string().starts_with("plan generation failed"));

    assert!(store.is_empty().await);
}

#[tokio::test]
async fn planner_advertises_agent_tools() {
    let store = Arc::new(SessionStore::new());
    let agents = FakeAgentFactory::new().with_tools(&["maps: Route and POI lookup"]);
    let kb = Arc::new(FakeKnowledgeBase::new().with_tenant("u1"));
    let llm = Arc::new(FakeChatModel::new(PLAN_JSON));
    let planner = PlanOrchestrator::new(kb, llm.clone(), store, "default")
        .with_tool_summaries(mkb_core::agent::AgentFactory::tool_summaries(&agents));

    planner.plan(plan_request("u1", "q")).await.unwrap();
    assert!(llm.requests()[0][0].text().contains("- maps: Route and POI lookup"));
}

#[tokio::test]
async fn steps_build_on_previous_results() {
    let store = Arc::new(SessionStore::new());
    let (planner, _, _) = orchestrator(
        FakeKnowledgeBase::new().with_tenant("u1"),
        FakeChatModel::new(PLAN_JSON),
        store.clone(),
    );
    let session_id = planner
        .plan(plan_request("u1", "plan a trip"))
        .await
        .unwrap()
        .session_id;

    let agents = Arc::new(
        FakeAgentFactory::new()
            .reply("found flights")
            .reply("booked the Harbour Hotel"),
    );
    let executor = StepExecutor::new(store.clone(), agents.clone());

    let first = executor
        .execute(step_request(&session_id, 1, "Find flights"))
        .await
        .unwrap();
    assert_eq!(first.execution_result, "found flights");
    assert_eq!(first.previous_steps_used, 0);
    assert_eq!(first.step_info.title, "Find flights");

    let second = executor
        .execute(step_request(&session_id, 2, "Book hotel"))
        .await
        .unwrap();
    assert_eq!(second.previous_steps_used, 1);
    assert_eq!(second.session_id, session_id);

    let prompts = agents.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("found flights"));
    assert!(prompts[1].contains("Step 2: Book hotel"));
    assert!(prompts[1].contains("found flights"));
    assert_eq!(agents.created(), 2);

    let session = store.get(&session_id).await.unwrap();
    let results = session.step_results().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == StepStatus::Success));
}

#[tokio::test]
async fn failed_step_is_recorded_and_retry_replaces_it() {
    let store = Arc::new(SessionStore::new());
    let session = store
        .create("u1", "plan a trip", serde_json::json!({"steps": []}))
        .await;
    let agents = Arc::new(
        FakeAgentFactory::new()
            .reply_error("tool timed out")
            .reply("found flights"),
    );
    let executor = StepExecutor::new(store.clone(), agents);

    let err = executor
        .execute(step_request(session.id(), 1, "Find flights"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Upstream { .. }));

    let results = session.step_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, StepStatus::Failed);
    assert!(results[0].execution_result.contains("tool timed out"));

    executor
        .execute(step_request(session.id(), 1, "Find flights"))
        .await
        .unwrap();
    let results = session.step_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, StepStatus::Success);
    assert_eq!(results[0].execution_result, "found flights");
}

#[tokio::test]
async fn agent_init_failure_is_recorded() {
    let store = Arc::new(SessionStore::new());
    let session = store.create("u1", "q", serde_json::json!({})).await;
    let executor = StepExecutor::new(store.clone(), Arc::new(FakeAgentFactory::new().failing_init()));

    let err = executor
        .execute(step_request(session.id(), 1, "Find flights"))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("failed to initialize agent"));

    let results = session.step_results().await;
    assert_eq!(results[0].status, StepStatus::Failed);
    assert!(results[0].execution_result.starts_with("Failed to initialize agent:"));
}

#[tokio::test]
async fn empty_agent_output_still_succeeds() {
    let store = Arc::new(SessionStore::new());
    let session = store.create("u1", "q", serde_json::json!({})).await;
    let executor = StepExecutor::new(store.clone(), Arc::new(FakeAgentFactory::new().reply("")));

    let outcome = executor
        .execute(step_request(session.id(), 1, "Quiet step"))
        .await
        .unwrap();
    assert_eq!(outcome.execution_result, "");
    let results = session.step_results().await;
    assert_eq!(results[0].status, StepStatus::Success);
    assert_eq!(results[0].execution_result, "");
}

#[tokio::test]
async fn unknown_session_is_not_found_and_untouched() {
    let store = Arc::new(SessionStore::new());
    let agents = Arc::new(FakeAgentFactory::new());
    let executor = StepExecutor::new(store.clone(), agents.clone());

    let err = executor
        .execute(step_request("u1_missing", 1, "Find flights"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    assert_eq!(agents.created(), 0);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn step_requires_tenant_and_session() {
    let store = Arc::new(SessionStore::new());
    let executor = StepExecutor::new(store, Arc::new(FakeAgentFactory::new()));

    let mut request = step_request("u1_x", 1, "t");
    request.tenant_id.clear();
    assert!(matches!(
        executor.execute(request).await,
        Err(ServiceError::Validation(_))
    ));

    let request = step_request("", 1, "t");
    assert!(matches!(
        executor.execute(request).await,
        Err(ServiceError::Validation(_))
    ));
}

#[tokio::test]
async fn trip_scenario_context_and_filtering() {
    let store = Arc::new(SessionStore::new());
    let session = store
        .create("u1", "plan a trip", serde_json::json!({}))
        .await;
    let agents = Arc::new(
        FakeAgentFactory::new()
            .reply("found flights")
            .reply_error("hotel search failed"),
    );
    let executor = StepExecutor::new(store.clone(), agents);

    executor
        .execute(step_request(session.id(), 1, "Find flights"))
        .await
        .unwrap();
    let context = session.render_context(2).await;
    assert!(context.contains("found flights"));
    assert_eq!(context.matches("## Step").count(), 1);

    executor
        .execute(step_request(session.id(), 2, "Book hotel"))
        .await
        .unwrap_err();
    let previous = session.previous_successful_steps(3).await;
    assert_eq!(previous.len(), 1);
    assert_eq!(previous[0].step_number, 1);
}

#[tokio::test]
async fn reported_step_count_matches_rendered_context() {
    let store = Arc::new(SessionStore::new());
    let (planner, _, _) = orchestrator(
        FakeKnowledgeBase::new().with_tenant("u1"),
        FakeChatModel::new(PLAN_JSON),
        store.clone(),
    );
    let session_id = planner
        .plan(plan_request("u1", "plan a trip"))
        .await
        .unwrap()
        .session_id;

    let agents = Arc::new(
        FakeAgentFactory::new()
            .reply("found flights")
            .reply_error("hotel site down")
            .reply("rented a car"),
    );
    let executor = StepExecutor::new(store.clone(), agents.clone());

    executor
        .execute(step_request(&session_id, 1, "Find flights"))
        .await
        .unwrap();
    executor
        .execute(step_request(&session_id, 2, "Book hotel"))
        .await
        .unwrap_err();
    let third = executor
        .execute(step_request(&session_id, 3, "Rent car"))
        .await
        .unwrap();

    let prompts = agents.prompts();
    let last = prompts.last().unwrap();
    assert_eq!(third.previous_steps_used, 1);
    assert_eq!(last.matches("## Step ").count(), third.previous_steps_used);
    assert!(last.contains("## Step 1: Find flights"));
    assert!(!last.contains("hotel site down"));
}

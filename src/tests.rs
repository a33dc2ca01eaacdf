use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tempfile::tempdir;
use tower::ServiceExt;

use crate::app::*;
use crate::chat::*;
use crate::cli::*;
use crate::config::*;
use crate::error::{HistoryStoreError, MemoryStoreError};
use crate::history::*;
use crate::llm::ChatRole;
use crate::llm::scripted::{ScriptedLlm, ScriptedResponse};
use crate::memory::*;
use crate::orchestrator::*;
use crate::server::*;
use crate::specialist::tests::{FakeConnector, registry, settings};
use crate::specialist::*;

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".strategist/config.toml".to_string(),
        provider: Provider::Auto,
        model: None,
        base_url: None,
        user_id: DEFAULT_USER_ID.to_string(),
        session_id: "test-session".to_string(),
        capability_config: DEFAULT_CAPABILITY_CONFIG.to_string(),
        activation_policy: ActivationPolicy::Partial,
        orchestrator_instruction: None,
        memory_backend: MemoryBackend::Memory,
        memory_db_url: "sqlite://.strategist/test-memories.db".to_string(),
        memory_limit: 3,
        memory_failure_policy: MemoryFailurePolicy::Degrade,
        history_db_url: "sqlite://.strategist/test-history.db".to_string(),
        history_window: 10,
        turn_timeout_secs: 5,
        specialist_timeout_secs: 5,
        max_tool_rounds: 4,
        show_sensitive_config: false,
    }
}

async fn build_app(
    cfg: RuntimeConfig,
    names: &[&str],
    model: Arc<ScriptedLlm>,
    memory_store: Arc<dyn MemoryStore>,
) -> (AppContext, Arc<FakeConnector>) {
    let connector = Arc::new(FakeConnector::default());
    let capabilities = registry(names);
    let specialists = activate_specialists(
        &capabilities,
        connector.as_ref(),
        model.clone(),
        settings(),
        ActivationPolicy::Partial,
    )
    .await
    .expect("activation should succeed");

    let app = AppContext::assemble(
        cfg,
        Provider::Compatible,
        "scripted".to_string(),
        capabilities,
        specialists,
        model,
        memory_store,
    );
    (app, connector)
}

/// Fails the `fail_on`-th append (1-based); every other call is delegated.
struct FlakyHistoryStore {
    inner: InMemoryHistoryStore,
    appends: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl HistoryStore for FlakyHistoryStore {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn append(
        &self,
        session_id: &str,
        payload: MessagePayload,
    ) -> Result<StoredMessage, HistoryStoreError> {
        if self.appends.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(HistoryStoreError::Store {
                session_id: session_id.to_string(),
                reason: "disk full".to_string(),
            });
        }
        self.inner.append(session_id, payload).await
    }

    async fn recent(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, HistoryStoreError> {
        self.inner.recent(session_id, limit).await
    }
}

/// Search always fails; adds still land in the wrapped store.
struct SearchFailingMemoryStore {
    inner: InMemoryMemoryStore,
}

#[async_trait]
impl MemoryStore for SearchFailingMemoryStore {
    fn backend_name(&self) -> &'static str {
        "search-failing"
    }

    async fn search(
        &self,
        _query: &str,
        _user_id: &str,
        _limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryStoreError> {
        Err(MemoryStoreError::Unavailable("index offline".to_string()))
    }

    async fn add(&self, messages: &[MemoryMessage], user_id: &str) -> Result<(), MemoryStoreError> {
        self.inner.add(messages, user_id).await
    }
}

fn agent_request(token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(AGENT_ROUTE)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

fn agent_body(query: &str, request_id: &str) -> Value {
    json!({
        "query": query,
        "user_id": "founder-1",
        "request_id": request_id,
        "session_id": "session-42"
    })
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    serde_json::from_slice(&bytes).expect("body should be json")
}

#[tokio::test]
async fn orchestrator_delegates_to_specialist_and_uses_its_result() {
    let model = Arc::new(ScriptedLlm::new(vec![
        ScriptedResponse::tool_call(
            "c1",
            "use_github_agent",
            json!({"query": "count open issues"}),
        ),
        ScriptedResponse::text("3 open issues"),
        ScriptedResponse::deltas(&["GitHub reports ", "3 open issues."]),
    ]));
    let (app, _) = build_app(
        base_cfg(),
        &["github", "slack"],
        model.clone(),
        Arc::new(InMemoryMemoryStore::new()),
    )
    .await;

    assert_eq!(
        app.orchestrator.tool_names(),
        vec!["use_github_agent", "use_slack_agent"]
    );

    let outcome = app
        .orchestrator
        .run_turn(
            TurnRequest {
                user_id: "founder-1",
                query: "How many issues are open?",
                history: &[],
            },
            None,
        )
        .await
        .expect("turn should succeed");

    assert_eq!(outcome.text, "GitHub reports 3 open issues.");
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].tool, "use_github_agent");
    assert!(outcome.tool_calls[0].succeeded);

    let requests = model.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[1].messages.last().map(|m| m.content.as_str()),
        Some("count open issues")
    );
    let tool_message = requests[2]
        .messages
        .iter()
        .find(|message| message.role == ChatRole::Tool)
        .expect("tool result should be sent back to the orchestrator");
    let result: Value = serde_json::from_str(&tool_message.content).expect("tool result json");
    assert_eq!(result, json!({"result": "3 open issues"}));
    assert_eq!(model.remaining(), 0);

    app.shutdown().await;
}

#[tokio::test]
async fn unreachable_specialist_is_reported_to_the_model_not_the_user() {
    let model = Arc::new(ScriptedLlm::new(vec![
        ScriptedResponse::tool_call("c1", "use_github_agent", json!({"query": "list repos"})),
        ScriptedResponse::text("GitHub is unavailable right now."),
    ]));
    let (app, connector) = build_app(
        base_cfg(),
        &["github"],
        model.clone(),
        Arc::new(InMemoryMemoryStore::new()),
    )
    .await;
    connector.backends.lock().expect("backends lock")["github"]
        .alive
        .store(false, Ordering::SeqCst);

    let outcome = app
        .orchestrator
        .run_turn(
            TurnRequest {
                user_id: "founder-1",
                query: "Which repos do we have?",
                history: &[],
            },
            None,
        )
        .await
        .expect("turn should still complete");

    assert_eq!(outcome.text, "GitHub is unavailable right now.");
    assert!(!outcome.tool_calls[0].succeeded);
    let requests = model.requests();
    let tool_message = requests[1]
        .messages
        .iter()
        .find(|message| message.role == ChatRole::Tool)
        .expect("tool error should be sent back");
    assert!(tool_message.content.contains("error"));
}

#[tokio::test]
async fn shutdown_releases_every_specialist_once() {
    let model = Arc::new(ScriptedLlm::default());
    let (app, connector) = build_app(
        base_cfg(),
        &["brave", "github"],
        model,
        Arc::new(InMemoryMemoryStore::new()),
    )
    .await;

    app.shutdown().await;
    app.shutdown().await;

    let backends = connector.backends.lock().expect("backends lock");
    for backend in backends.values() {
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
    }
    assert!(app.specialists.iter().all(|specialist| specialist.is_released()));
}

#[tokio::test]
async fn memory_context_is_capped_and_scoped_to_the_user() {
    let store = Arc::new(InMemoryMemoryStore::new());
    for text in [
        "pricing starts at 49 dollars",
        "pricing tiers are basic and pro",
        "pricing discount for annual plans",
        "pricing review every quarter",
    ] {
        store
            .add(
                &[MemoryMessage {
                    role: MessageRole::User,
                    content: text.to_string(),
                }],
                "founder-1",
            )
            .await
            .expect("add");
    }
    store
        .add(
            &[MemoryMessage {
                role: MessageRole::User,
                content: "competitor pricing is secret".to_string(),
            }],
            "someone-else",
        )
        .await
        .expect("add");

    let model = Arc::new(ScriptedLlm::new(vec![ScriptedResponse::text("Noted.")]));
    let (app, _) = build_app(base_cfg(), &[], model.clone(), store.clone()).await;

    let mut outcome = app
        .orchestrator
        .run_turn(
            TurnRequest {
                user_id: "founder-1",
                query: "What is our pricing?",
                history: &[],
            },
            None,
        )
        .await
        .expect("turn should succeed");

    assert_eq!(outcome.memories.len(), 3);
    assert!(outcome.memories.iter().all(|memory| !memory.contains("competitor")));

    let system = &model.requests()[0].messages[0];
    assert_eq!(system.role, ChatRole::System);
    assert!(system.content.contains("User Memories:\n- pricing"));
    assert!(!system.content.contains("competitor"));

    app.orchestrator
        .commit_turn("founder-1", "What is our pricing?", &mut outcome)
        .await;
    let committed = store
        .search("pricing", "founder-1", 10)
        .await
        .expect("search");
    assert!(committed.iter().any(|record| record.memory == "What is our pricing?"));
}

#[tokio::test]
async fn chat_turn_failure_prints_error_and_keeps_history() {
    let model = Arc::new(ScriptedLlm::new(vec![
        ScriptedResponse::text("Focus on retention."),
        ScriptedResponse::Fail("upstream unavailable".to_string()),
    ]));
    let (app, _) = build_app(
        base_cfg(),
        &[],
        model,
        Arc::new(InMemoryMemoryStore::new()),
    )
    .await;
    let mut session = ChatSession::new("founder-1");

    let mut out = Vec::new();
    let ok = session
        .submit(&app.orchestrator, "What should we prioritise?", &mut out)
        .await
        .expect("write");
    assert!(ok);
    assert_eq!(session.history().len(), 2);
    let printed = String::from_utf8(out).expect("utf8");
    assert!(printed.contains("[Assistant]"));
    assert!(printed.contains("Focus on retention."));

    let mut out = Vec::new();
    let ok = session
        .submit(&app.orchestrator, "And after that?", &mut out)
        .await
        .expect("write");
    assert!(!ok);
    assert_eq!(session.history().len(), 2);
    let printed = String::from_utf8(out).expect("utf8");
    assert!(printed.contains("[Error]"));
    assert!(printed.contains("upstream unavailable"));
}

#[tokio::test]
async fn chat_history_is_replayed_on_the_next_turn() {
    let model = Arc::new(ScriptedLlm::new(vec![
        ScriptedResponse::text("Target SMBs."),
        ScriptedResponse::text("Start with agencies."),
    ]));
    let (app, _) = build_app(
        base_cfg(),
        &[],
        model.clone(),
        Arc::new(DisabledMemoryStore),
    )
    .await;
    let mut session = ChatSession::new("founder-1");

    let mut sink = Vec::new();
    session
        .submit(&app.orchestrator, "Who is our market?", &mut sink)
        .await
        .expect("write");
    session
        .submit(&app.orchestrator, "Which segment first?", &mut sink)
        .await
        .expect("write");

    let second = &model.requests()[1].messages;
    let contents = second.iter().map(|m| m.content.as_str()).collect::<Vec<&str>>();
    assert_eq!(
        &contents[1..],
        ["Who is our market?", "Target SMBs.", "Which segment first?"]
    );
    assert!(matches!(
        parse_chat_input("Goodbye"),
        ParsedChatInput::Command(ChatCommand::Exit)
    ));
}

#[tokio::test]
async fn endpoint_requires_configured_token() {
    let model = Arc::new(ScriptedLlm::default());
    let (app, _) = build_app(
        base_cfg(),
        &[],
        model,
        Arc::new(DisabledMemoryStore),
    )
    .await;
    let app = Arc::new(app);
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());

    let unconfigured = build_server_router(Arc::new(ServerState::new(
        app.clone(),
        history.clone(),
        None,
    )));
    let response = unconfigured
        .oneshot(agent_request(Some("anything"), agent_body("hi", "r-0")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response_json(response).await,
        json!({"error": "API_BEARER_TOKEN not set"})
    );

    let router = build_server_router(Arc::new(ServerState::new(
        app.clone(),
        history.clone(),
        Some("s3cret".to_string()),
    )));
    for token in [None, Some("wrong")] {
        let response = router
            .clone()
            .oneshot(agent_request(token, agent_body("hi", "r-1")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response_json(response).await,
            json!({"error": "Invalid authentication token"})
        );
    }

    let stored = history.recent("session-42", 10).await.expect("recent");
    assert!(stored.is_empty());
}

#[tokio::test]
async fn endpoint_persists_exchange_and_replays_history() {
    let dir = tempdir().expect("tempdir");
    let mut cfg = base_cfg();
    cfg.history_db_url = format!("sqlite://{}", dir.path().join("history.db").display());

    let model = Arc::new(ScriptedLlm::new(vec![
        ScriptedResponse::text("Raise prices by 10%."),
        ScriptedResponse::text("Announce it next month."),
    ]));
    let history = build_history_store(&cfg).await.expect("history store");
    let (app, _) = build_app(cfg, &[], model.clone(), Arc::new(DisabledMemoryStore)).await;
    let router = build_server_router(Arc::new(ServerState::new(
        Arc::new(app),
        history.clone(),
        Some("s3cret".to_string()),
    )));

    let response = router
        .clone()
        .oneshot(agent_request(
            Some("s3cret"),
            agent_body("How do we grow revenue?", "r-1"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await, json!({"success": true}));

    let response = router
        .oneshot(agent_request(Some("s3cret"), agent_body("When?", "r-2")))
        .await
        .expect("response");
    assert_eq!(response_json(response).await, json!({"success": true}));

    let stored = history.recent("session-42", 10).await.expect("recent");
    let kinds = stored
        .iter()
        .map(|message| message.payload.kind)
        .collect::<Vec<MessageKind>>();
    assert_eq!(
        kinds,
        vec![MessageKind::Human, MessageKind::Ai, MessageKind::Human, MessageKind::Ai]
    );
    assert_eq!(stored[1].payload.content, "Raise prices by 10%.");
    assert_eq!(stored[1].payload.data, Some(json!({"request_id": "r-1"})));
    assert_eq!(stored[3].payload.data, Some(json!({"request_id": "r-2"})));

    let second = &model.requests()[1].messages;
    let contents = second.iter().map(|m| m.content.as_str()).collect::<Vec<&str>>();
    assert_eq!(
        &contents[1..],
        ["How do we grow revenue?", "Raise prices by 10%.", "When?"]
    );
}

#[tokio::test]
async fn endpoint_failure_stores_apology_and_reports_unsuccessful() {
    let model = Arc::new(ScriptedLlm::new(vec![ScriptedResponse::Fail(
        "model overloaded".to_string(),
    )]));
    let (app, _) = build_app(
        base_cfg(),
        &[],
        model,
        Arc::new(DisabledMemoryStore),
    )
    .await;
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let router = build_server_router(Arc::new(ServerState::new(
        Arc::new(app),
        history.clone(),
        Some("s3cret".to_string()),
    )));

    let response = router
        .oneshot(agent_request(Some("s3cret"), agent_body("Plan Q3", "r-9")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await, json!({"success": false}));

    let stored = history.recent("session-42", 10).await.expect("recent");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].payload.kind, MessageKind::Human);
    assert_eq!(stored[1].payload.content, ERROR_REPLY);
    let data = stored[1].payload.data.as_ref().expect("annotation data");
    assert_eq!(data["request_id"], "r-9");
    assert!(
        data["error"]
            .as_str()
            .is_some_and(|error| error.contains("model overloaded"))
    );
}

#[tokio::test]
async fn endpoint_rejects_blank_query() {
    let (app, _) = build_app(
        base_cfg(),
        &[],
        Arc::new(ScriptedLlm::default()),
        Arc::new(DisabledMemoryStore),
    )
    .await;
    let router = build_server_router(Arc::new(ServerState::new(
        Arc::new(app),
        Arc::new(InMemoryHistoryStore::new()),
        Some("s3cret".to_string()),
    )));

    let response = router
        .oneshot(agent_request(Some("s3cret"), agent_body("   ", "r-3")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[test]
fn profile_values_apply_below_cli_flags() {
    let profiles: ProfilesFile = toml::from_str(
        r#"
        [profiles.ops]
        memory_limit = 5
        history_window = 4
        capability_config = "ops_mcp.json"
        "#,
    )
    .expect("profiles should parse");

    let cli = <Cli as clap::Parser>::parse_from([
        "strategist",
        "--profile",
        "ops",
        "--memory-limit",
        "2",
    ]);
    let cfg = resolve_runtime_config(&cli, &profiles).expect("config should resolve");
    assert_eq!(cfg.memory_limit, 2);
    assert_eq!(cfg.history_window, 4);
    assert_eq!(cfg.capability_config, "ops_mcp.json");
}

#[tokio::test]
async fn failed_history_append_leaves_memory_uncommitted() {
    let memory = Arc::new(InMemoryMemoryStore::new());
    let model = Arc::new(ScriptedLlm::new(vec![ScriptedResponse::text(
        "Raise prices quietly",
    )]));
    let (app, _) = build_app(base_cfg(), &[], model, memory.clone()).await;
    let history = Arc::new(FlakyHistoryStore {
        inner: InMemoryHistoryStore::new(),
        appends: AtomicUsize::new(0),
        fail_on: 2,
    });
    let state = ServerState::new(Arc::new(app), history.clone(), Some("s3cret".to_string()));

    let request: AgentRequest =
        serde_json::from_value(agent_body("pricing strategy", "r-5")).expect("request");
    assert!(!process_agent_request(&state, &request).await);

    let stored = history.recent("session-42", 10).await.expect("recent");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].payload.kind, MessageKind::Human);
    assert_eq!(stored[1].payload.content, ERROR_REPLY);

    for query in ["pricing", "prices"] {
        let committed = memory.search(query, "founder-1", 10).await.expect("search");
        assert!(committed.is_empty(), "query {query:?} found {committed:?}");
    }
}

#[tokio::test]
async fn chat_commits_memory_only_for_successful_turns() {
    let memory = Arc::new(InMemoryMemoryStore::new());
    let model = Arc::new(ScriptedLlm::new(vec![
        ScriptedResponse::text("Bundle onboarding with pricing."),
        ScriptedResponse::Fail("upstream unavailable".to_string()),
    ]));
    let (app, _) = build_app(base_cfg(), &[], model, memory.clone()).await;
    let mut session = ChatSession::new("founder-1");

    let mut sink = Vec::new();
    session
        .submit(&app.orchestrator, "How should pricing work?", &mut sink)
        .await
        .expect("write");
    session
        .submit(&app.orchestrator, "Revisit pricing tiers", &mut sink)
        .await
        .expect("write");

    let committed = memory
        .search("pricing", "founder-1", 10)
        .await
        .expect("search")
        .into_iter()
        .map(|record| record.memory)
        .collect::<Vec<String>>();
    assert_eq!(committed.len(), 2);
    assert!(committed.contains(&"How should pricing work?".to_string()));
    assert!(committed.contains(&"Bundle onboarding with pricing.".to_string()));
}

#[tokio::test]
async fn turns_on_one_session_run_one_at_a_time() {
    let model = Arc::new(ScriptedLlm::new(vec![
        ScriptedResponse::Delayed(Duration::from_millis(50), "First answer.".to_string()),
        ScriptedResponse::text("Second answer."),
    ]));
    let (app, _) = build_app(base_cfg(), &[], model.clone(), Arc::new(DisabledMemoryStore)).await;
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let state = ServerState::new(Arc::new(app), history.clone(), Some("s3cret".to_string()));

    let first: AgentRequest =
        serde_json::from_value(agent_body("Where do we expand?", "r-1")).expect("request");
    let second: AgentRequest =
        serde_json::from_value(agent_body("How fast?", "r-2")).expect("request");
    let (a, b) = tokio::join!(
        process_agent_request(&state, &first),
        process_agent_request(&state, &second)
    );
    assert!(a && b);

    let stored = history.recent("session-42", 10).await.expect("recent");
    let kinds = stored
        .iter()
        .map(|message| message.payload.kind)
        .collect::<Vec<MessageKind>>();
    assert_eq!(
        kinds,
        vec![MessageKind::Human, MessageKind::Ai, MessageKind::Human, MessageKind::Ai]
    );

    let later = model.requests()[1]
        .messages
        .iter()
        .map(|message| message.content.clone())
        .collect::<Vec<String>>();
    assert!(later.contains(&stored[0].payload.content));
    assert!(later.contains(&stored[1].payload.content));
    assert_eq!(state.active_sessions().await, 0);
}

#[tokio::test]
async fn strict_memory_policy_fails_the_request_without_committing() {
    let mut cfg = base_cfg();
    cfg.memory_failure_policy = MemoryFailurePolicy::Fail;
    let memory = Arc::new(SearchFailingMemoryStore {
        inner: InMemoryMemoryStore::new(),
    });
    let model = Arc::new(ScriptedLlm::new(vec![ScriptedResponse::text("unused")]));
    let (app, _) = build_app(cfg, &[], model.clone(), memory.clone()).await;
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let router = build_server_router(Arc::new(ServerState::new(
        Arc::new(app),
        history.clone(),
        Some("s3cret".to_string()),
    )));

    let response = router
        .oneshot(agent_request(Some("s3cret"), agent_body("pricing plan", "r-7")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await, json!({"success": false}));

    let stored = history.recent("session-42", 10).await.expect("recent");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].payload.content, ERROR_REPLY);
    let data = stored[1].payload.data.as_ref().expect("annotation data");
    assert_eq!(data["request_id"], "r-7");
    assert!(
        data["error"]
            .as_str()
            .is_some_and(|error| error.contains("index offline"))
    );

    assert_eq!(model.remaining(), 1);
    let committed = memory
        .inner
        .search("pricing", "founder-1", 10)
        .await
        .expect("search");
    assert!(committed.is_empty());
}

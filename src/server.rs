use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::app::AppContext;
use crate::config::RuntimeConfig;
use crate::history::{HistoryStore, Message, MessagePayload, build_history_store};
use crate::orchestrator::TurnRequest;

pub const AUTH_TOKEN_ENV: &str = "API_BEARER_TOKEN";
pub const AGENT_ROUTE: &str = "/api/business-strategist";
pub const ERROR_REPLY: &str =
    "I apologize, but I encountered an error processing your request.";

pub struct ServerState {
    pub app: Arc<AppContext>,
    pub history: Arc<dyn HistoryStore>,
    pub history_window: usize,
    pub auth_token: Option<String>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServerState {
    pub fn new(
        app: Arc<AppContext>,
        history: Arc<dyn HistoryStore>,
        auth_token: Option<String>,
    ) -> Self {
        let history_window = app.cfg.history_window;
        Self {
            app,
            history,
            history_window,
            auth_token,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Sessions with a turn running or waiting.
    pub async fn active_sessions(&self) -> usize {
        self.session_locks.lock().await.len()
    }

    async fn forget_idle_lock(&self, session_id: &str) {
        let mut locks = self.session_locks.lock().await;
        if locks
            .get(session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(session_id);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentRequest {
    pub query: String,
    pub user_id: String,
    pub request_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub specialists: Vec<String>,
    pub active_sessions: usize,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// 500 when no token is configured, 401 when the bearer credential is
/// missing or does not match.
pub fn verify_bearer_token(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{AUTH_TOKEN_ENV} not set"),
        ));
    };

    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .unwrap_or_default();

    if provided.is_empty() || provided != expected {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "Invalid authentication token",
        ));
    }
    Ok(())
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        profile: state.app.cfg.profile.clone(),
        specialists: state.app.specialists.names(),
        active_sessions: state.active_sessions().await,
    })
}

pub async fn handle_agent_request(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<AgentRequest>, JsonRejection>,
) -> ApiResult<AgentResponse> {
    verify_bearer_token(state.auth_token.as_deref(), &headers)?;
    let Json(request) =
        body.map_err(|rejection| api_error(rejection.status(), rejection.body_text()))?;

    if request.query.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "query cannot be empty"));
    }
    if request.session_id.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "session_id cannot be empty"));
    }

    let success = process_agent_request(&state, &request).await;
    Ok(Json(AgentResponse { success }))
}

/// Turns on the same session run one at a time so each sees the previous
/// turn's stored messages.
pub async fn process_agent_request(state: &ServerState, request: &AgentRequest) -> bool {
    let started_at = Instant::now();
    let lock = state.session_lock(&request.session_id).await;
    let guard = lock.lock().await;

    let outcome = run_agent_request(state, request).await;
    drop(guard);
    drop(lock);
    state.forget_idle_lock(&request.session_id).await;

    match outcome {
        Ok(()) => {
            tracing::info!(
                session_id = %request.session_id,
                request_id = %request.request_id,
                latency_ms = started_at.elapsed().as_millis() as u64,
                "Request completed"
            );
            true
        }
        Err(err) => {
            let error = format!("{err:#}");
            tracing::error!(
                session_id = %request.session_id,
                request_id = %request.request_id,
                error = %error,
                "Request failed"
            );
            let annotation = MessagePayload::ai(
                ERROR_REPLY,
                json!({ "error": error, "request_id": request.request_id }),
            );
            if let Err(store_err) = state.history.append(&request.session_id, annotation).await {
                tracing::error!(
                    session_id = %request.session_id,
                    error = %store_err,
                    "Failed to store error annotation"
                );
            }
            false
        }
    }
}

async fn run_agent_request(state: &ServerState, request: &AgentRequest) -> Result<()> {
    let recent = state
        .history
        .recent(&request.session_id, state.history_window)
        .await?;
    let history = recent.iter().map(Message::from).collect::<Vec<Message>>();

    state
        .history
        .append(&request.session_id, MessagePayload::human(request.query.clone()))
        .await?;

    let orchestrator = &state.app.orchestrator;
    let mut outcome = orchestrator
        .run_turn(
            TurnRequest {
                user_id: &request.user_id,
                query: &request.query,
                history: &history,
            },
            None,
        )
        .await?;

    state
        .history
        .append(
            &request.session_id,
            MessagePayload::ai(
                outcome.text.clone(),
                json!({ "request_id": request.request_id }),
            ),
        )
        .await?;
    orchestrator
        .commit_turn(&request.user_id, &request.query, &mut outcome)
        .await;
    Ok(())
}

pub fn build_server_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_server_health))
        .route(AGENT_ROUTE, post(handle_agent_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn auth_token_from_env() -> Option<String> {
    std::env::var(AUTH_TOKEN_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub async fn run_server(cfg: RuntimeConfig, host: String, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;
    let history = build_history_store(&cfg).await?;
    let auth_token = auth_token_from_env();
    if auth_token.is_none() {
        tracing::warn!("{AUTH_TOKEN_ENV} is not set; every request will be rejected");
    }

    let app = Arc::new(AppContext::start(cfg).await?);
    let state = Arc::new(ServerState::new(app.clone(), history, auth_token));

    println!(
        "Server listening on http://{} (health: /healthz, agent: {})",
        addr, AGENT_ROUTE
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    let served = axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed");

    app.shutdown().await;
    served
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}

//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST   /v1/query`              Run a query, optionally in an existing session
//! - `GET    /v1/sessions`           List live sessions
//! - `POST   /v1/sessions`           Create an empty session
//! - `GET    /v1/sessions/{id}`      Session metadata and history
//! - `DELETE /v1/sessions/{id}`      Delete a session (idempotent)
//! - `GET    /v1/tools`              Aggregated tools from ready servers
//! - `GET    /v1/servers`            Tool-server connection statuses
//! - `POST   /v1/servers/reconnect`  Connect pending servers, or one with `?server=`
//! - `GET    /v1/status`             Uptime and counts

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use switchboard_config::ToolServersConfig;
use switchboard_core::error::{InferenceError, QueryError, SessionError, ToolServerError};
use switchboard_core::message::{Metadata, SessionId};
use switchboard_core::tool::ToolDescriptor;
use switchboard_orchestrator::{
    QueryOrchestrator, QueryOutcome, QueryRequest, Runtime, SessionView, runtime,
};
use switchboard_servers::{ConnectReport, ConnectionState, ServerStatus};
use switchboard_session::SessionSummary;

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiState {
    pub orchestrator: Arc<QueryOrchestrator>,
    pub tool_servers: ToolServersConfig,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl ApiState {
    pub fn from_runtime(runtime: &Runtime) -> Self {
        Self {
            orchestrator: runtime.orchestrator.clone(),
            tool_servers: runtime.config.tool_servers.clone(),
            start_time: chrono::Utc::now(),
        }
    }
}

pub type SharedApiState = Arc<ApiState>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/query", post(query_handler))
        .route("/sessions", get(list_sessions_handler).post(create_session_handler))
        .route(
            "/sessions/{id}",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route("/tools", get(list_tools_handler))
        .route("/servers", get(list_servers_handler))
        .route("/servers/reconnect", post(reconnect_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
struct QueryBody {
    query: String,
    /// Existing session to continue (omit to start a new one).
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Deserialize)]
struct ReconnectParams {
    server: Option<String>,
}

#[derive(Serialize)]
struct ToolDto {
    qualified_name: String,
    server_id: String,
    name: String,
    description: String,
    schema: serde_json::Value,
}

impl From<ToolDescriptor> for ToolDto {
    fn from(tool: ToolDescriptor) -> Self {
        Self {
            qualified_name: tool.qualified_name(),
            server_id: tool.server_id,
            name: tool.name,
            description: tool.description,
            schema: tool.schema,
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum ReconnectResponse {
    All(ConnectReport),
    One(ServerStatus),
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_secs: i64,
    sessions: usize,
    servers_total: usize,
    servers_ready: usize,
    tools: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn query_error(err: QueryError) -> ApiError {
    let status = match &err {
        QueryError::SessionExpiredOrUnknown(_) => StatusCode::NOT_FOUND,
        QueryError::Inference(InferenceError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        QueryError::Inference(_) => StatusCode::BAD_GATEWAY,
        QueryError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        QueryError::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
        QueryError::Session(SessionError::TurnOrder(_)) => StatusCode::CONFLICT,
    };
    api_error(status, err)
}

fn tool_server_error(err: ToolServerError) -> ApiError {
    let status = match &err {
        ToolServerError::UnknownServer(_) => StatusCode::NOT_FOUND,
        ToolServerError::NoServersAvailable { .. } | ToolServerError::ServerUnreachable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::BAD_GATEWAY,
    };
    api_error(status, err)
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn query_handler(
    State(state): State<SharedApiState>,
    Json(payload): Json<QueryBody>,
) -> Result<Json<QueryOutcome>, ApiError> {
    if payload.query.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "query must not be empty"));
    }
    info!(session_id = ?payload.session_id, "v1/query request");

    let mut request = QueryRequest::new(payload.query).with_metadata(payload.metadata);
    if let Some(id) = payload.session_id {
        request = request.in_session(SessionId(id));
    }

    let outcome = state.orchestrator.query(request).await.map_err(|e| {
        warn!(error = %e, "Query failed");
        query_error(e)
    })?;
    Ok(Json(outcome))
}

async fn list_sessions_handler(State(state): State<SharedApiState>) -> Json<Vec<SessionSummary>> {
    Json(state.orchestrator.list_sessions().await)
}

async fn create_session_handler(
    State(state): State<SharedApiState>,
    body: Option<Json<CreateSessionBody>>,
) -> (StatusCode, Json<SessionSummary>) {
    let metadata = body.map(|Json(b)| b.metadata).unwrap_or_default();
    let summary = state.orchestrator.create_session(metadata).await;
    (StatusCode::CREATED, Json(summary))
}

async fn get_session_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    state
        .orchestrator
        .lookup_session(&SessionId(id))
        .await
        .map(Json)
        .map_err(query_error)
}

async fn delete_session_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> StatusCode {
    state.orchestrator.delete_session(&SessionId(id)).await;
    StatusCode::NO_CONTENT
}

async fn list_tools_handler(State(state): State<SharedApiState>) -> Json<Vec<ToolDto>> {
    let tools = state.orchestrator.registry().aggregated_tools().await;
    Json(tools.into_iter().map(ToolDto::from).collect())
}

async fn list_servers_handler(State(state): State<SharedApiState>) -> Json<Vec<ServerStatus>> {
    Json(state.orchestrator.registry().statuses().await)
}

async fn reconnect_handler(
    State(state): State<SharedApiState>,
    Query(params): Query<ReconnectParams>,
) -> Result<Json<ReconnectResponse>, ApiError> {
    let registry = state.orchestrator.registry();
    let policy = runtime::retry_policy(&state.tool_servers);

    match params.server {
        Some(server_id) => {
            info!(server_id = %server_id, "v1/servers/reconnect request");
            let status = registry
                .reconnect(&server_id, policy)
                .await
                .map_err(tool_server_error)?;
            Ok(Json(ReconnectResponse::One(status)))
        }
        None => {
            let endpoints = runtime::endpoints(&state.tool_servers);
            let report = registry
                .connect_all(&endpoints, policy)
                .await
                .map_err(tool_server_error)?;
            Ok(Json(ReconnectResponse::All(report)))
        }
    }
}

async fn status_handler(State(state): State<SharedApiState>) -> Json<StatusResponse> {
    let registry = state.orchestrator.registry();
    let statuses = registry.statuses().await;
    let servers_ready = statuses
        .iter()
        .filter(|s| s.state == ConnectionState::Ready)
        .count();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (chrono::Utc::now() - state.start_time).num_seconds(),
        sessions: state.orchestrator.sessions().len().await,
        servers_total: statuses.len(),
        servers_ready,
        tools: registry.aggregated_tools().await.len(),
    })
}

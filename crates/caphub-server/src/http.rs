//! The `/api/cap` HTTP surface.
//!
//! Success responses are `{ "success": true, "data": ... }`; errors are
//! `{ "success": false, "error": { code, message, details } }` with the
//! taxonomy code emitted verbatim.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use caphub::{
    AgentPatch, AgentSpec, AgentStatus, DiscoveryCriteria, ErrorCode, Hub, InterruptFilter,
    InterruptPriority, InterruptResponse, InterruptStatus, Message, MessageMetadata, Role,
    RunInput, ThreadStatus,
};
use caphub_contract::storage::MessageQuery;
use caphub_contract::HubError;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::sse::run_event_stream;

/// Shared transport state.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

/// Transport error wrapper mapping taxonomy codes to HTTP statuses.
pub struct ApiError(pub HubError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.code {
            ErrorCode::ValidInput | ErrorCode::ValidSchema | ErrorCode::ValidLifecycleTransition => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::CapAgentNotFound
            | ErrorCode::CapThreadNotFound
            | ErrorCode::CapRunNotFound
            | ErrorCode::CapInterruptNotFound => StatusCode::NOT_FOUND,
            ErrorCode::CapRunTimeout => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::Conflict | ErrorCode::CapThreadClosed => StatusCode::CONFLICT,
            ErrorCode::CapInterruptExpired => StatusCode::GONE,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::CapAgentNotReady | ErrorCode::CapAgentUnhealthy => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.0.code.as_str(),
                "message": self.0.message,
                "details": self.0.context,
            }
        }));
        (self.status(), body).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl From<caphub::AgentRegistryError> for ApiError {
    fn from(err: caphub::AgentRegistryError) -> Self {
        Self(err.into())
    }
}

impl From<caphub::ThreadServiceError> for ApiError {
    fn from(err: caphub::ThreadServiceError) -> Self {
        Self(err.into())
    }
}

impl From<caphub::InterruptServiceError> for ApiError {
    fn from(err: caphub::InterruptServiceError) -> Self {
        Self(err.into())
    }
}

fn ok<T: serde::Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/cap/agents", get(list_agents).post(register_agent))
        .route("/api/cap/agents/discover", post(discover_agents))
        .route(
            "/api/cap/agents/:id",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route("/api/cap/agents/:id/health", get(agent_health))
        .route("/api/cap/threads", post(create_thread))
        .route("/api/cap/threads/:id", get(get_thread).put(update_thread))
        .route(
            "/api/cap/threads/:id/messages",
            get(list_messages).post(append_message),
        )
        .route("/api/cap/threads/:id/close", post(close_thread))
        .route("/api/cap/runs", post(submit_run))
        .route("/api/cap/runs/:id", get(get_run))
        .route("/api/cap/runs/:id/cancel", post(cancel_run))
        .route("/api/cap/runs/:id/stream", get(stream_run))
        .route("/api/cap/interrupts", get(list_interrupts))
        .route("/api/cap/interrupts/:id", get(get_interrupt))
        .route("/api/cap/interrupts/:id/resolve", post(resolve_interrupt))
        .with_state(state)
}

// --- agents ---

#[derive(Debug, Deserialize)]
struct AgentListParams {
    #[serde(default)]
    system: Option<String>,
    #[serde(default, rename = "type")]
    agent_type: Option<String>,
    #[serde(default)]
    status: Option<AgentStatus>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn list_agents(
    State(st): State<AppState>,
    Query(params): Query<AgentListParams>,
) -> Result<Json<Value>, ApiError> {
    let criteria = DiscoveryCriteria {
        system: params.system,
        agent_type: params.agent_type,
        status: params.status,
        limit: params.limit,
        offset: params.offset,
        ..Default::default()
    };
    Ok(ok(st.hub.registry().discover(&criteria).await))
}

async fn register_agent(
    State(st): State<AppState>,
    Json(spec): Json<AgentSpec>,
) -> Result<Response, ApiError> {
    let agent = st.hub.registry().register(spec).await?;
    Ok((StatusCode::CREATED, ok(agent)).into_response())
}

async fn get_agent(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(ok(st.hub.registry().get(&id).await?))
}

async fn update_agent(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<AgentPatch>,
) -> Result<Json<Value>, ApiError> {
    Ok(ok(st.hub.registry().update(&id, patch).await?))
}

async fn delete_agent(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    st.hub.registry().delete(&id).await?;
    Ok(ok(json!({ "deleted": id })))
}

async fn agent_health(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(ok(st.hub.registry().health(&id).await?))
}

async fn discover_agents(
    State(st): State<AppState>,
    Json(criteria): Json<DiscoveryCriteria>,
) -> Result<Json<Value>, ApiError> {
    Ok(ok(st.hub.registry().discover(&criteria).await))
}

// --- threads ---

#[derive(Debug, Deserialize)]
struct MessageBody {
    role: Role,
    content: String,
    #[serde(default)]
    metadata: Option<MessageMetadata>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

impl From<MessageBody> for Message {
    fn from(body: MessageBody) -> Self {
        let mut message = Message::new(body.role, body.content);
        message.metadata = body.metadata;
        message.idempotency_key = body.idempotency_key;
        message
    }
}

#[derive(Debug, Deserialize)]
struct CreateThreadBody {
    agent_id: String,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    #[serde(default)]
    initial_messages: Vec<MessageBody>,
}

async fn create_thread(
    State(st): State<AppState>,
    Json(body): Json<CreateThreadBody>,
) -> Result<Response, ApiError> {
    let messages = body.initial_messages.into_iter().map(Message::from).collect();
    let thread = st
        .hub
        .threads()
        .create(&body.agent_id, body.metadata, messages)
        .await?;
    Ok((StatusCode::CREATED, ok(thread)).into_response())
}

async fn get_thread(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(ok(st.hub.threads().get(&id).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateThreadBody {
    #[serde(default)]
    status: Option<ThreadStatus>,
    #[serde(default)]
    metadata: Option<HashMap<String, Value>>,
}

async fn update_thread(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateThreadBody>,
) -> Result<Json<Value>, ApiError> {
    if body.status.is_none() && body.metadata.is_none() {
        return Err(ApiError(HubError::validation(
            "update requires status or metadata",
        )));
    }
    if let Some(metadata) = body.metadata {
        st.hub.threads().update_metadata(&id, metadata).await?;
    }
    let thread = match body.status {
        Some(status) => st.hub.threads().update_status(&id, status).await?,
        None => st.hub.threads().get(&id).await?,
    };
    Ok(ok(thread))
}

#[derive(Debug, Deserialize)]
struct MessageListParams {
    #[serde(default)]
    after_seq: Option<u64>,
    #[serde(default)]
    before_seq: Option<u64>,
    #[serde(default = "default_message_limit")]
    limit: usize,
    #[serde(default)]
    reverse: bool,
    #[serde(default)]
    role: Option<Role>,
}

fn default_message_limit() -> usize {
    50
}

async fn list_messages(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<MessageListParams>,
) -> Result<Json<Value>, ApiError> {
    let query = MessageQuery {
        after_seq: params.after_seq,
        before_seq: params.before_seq,
        limit: params.limit,
        reverse: params.reverse,
        role: params.role,
    };
    Ok(ok(st.hub.threads().list_messages(&id, &query).await?))
}

async fn append_message(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Result<Response, ApiError> {
    let message = st.hub.threads().append(&id, Message::from(body)).await?;
    Ok((StatusCode::CREATED, ok(message)).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct CloseThreadBody {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
}

async fn close_thread(
    State(st): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CloseThreadBody>>,
) -> Result<Json<Value>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let thread = st
        .hub
        .threads()
        .close(&id, body.summary, body.resolution)
        .await?;
    Ok(ok(thread))
}

// --- runs ---

async fn submit_run(
    State(st): State<AppState>,
    Json(input): Json<RunInput>,
) -> Result<Response, ApiError> {
    let run = st.hub.executor().submit(input).await?;
    Ok((StatusCode::CREATED, ok(run)).into_response())
}

async fn get_run(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(ok(st.hub.executor().get_run(&id).await?))
}

#[derive(Debug, Deserialize, Default)]
struct CancelRunBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_run(
    State(st): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CancelRunBody>>,
) -> Result<Json<Value>, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    Ok(ok(st.hub.executor().cancel(&id, reason).await?))
}

async fn stream_run(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    // Subscribe before snapshotting so no terminal event is missed.
    let subscription = st.hub.bus().subscribe_run(&id);
    let run = st.hub.executor().get_run(&id).await?;
    Ok(run_event_stream(run, subscription))
}

// --- interrupts ---

#[derive(Debug, Deserialize)]
struct InterruptListParams {
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    status: Option<InterruptStatus>,
    #[serde(default)]
    priority: Option<InterruptPriority>,
}

async fn list_interrupts(
    State(st): State<AppState>,
    Query(params): Query<InterruptListParams>,
) -> Result<Json<Value>, ApiError> {
    let filter = InterruptFilter {
        run_id: params.run_id,
        agent_id: params.agent_id,
        status: params.status,
        priority: params.priority,
    };
    Ok(ok(st.hub.interrupts().list(&filter).await))
}

async fn get_interrupt(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(ok(st.hub.interrupts().get(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ResolveInterruptBody {
    response: Value,
    #[serde(default)]
    responded_by: Option<String>,
}

async fn resolve_interrupt(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveInterruptBody>,
) -> Result<Json<Value>, ApiError> {
    let mut response = InterruptResponse::new(body.response);
    response.responded_by = body.responded_by;
    let interrupt = st.hub.interrupts().resolve(&id, response).await?;
    Ok(ok(interrupt))
}

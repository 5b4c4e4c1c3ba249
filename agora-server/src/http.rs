//! Agora HTTP API
//!
//! Axum server exposing chat (streamed over SSE), conversation history, and
//! knowledge base management.
//!
//! Architecture: each JSON endpoint has a thin axum handler that delegates to an
//! inner function returning `(StatusCode, Value)`. The inner functions are
//! directly testable without axum dispatch machinery. The chat send endpoint is
//! the exception: it answers with `text/event-stream` once the turn has started.
//!
//! Endpoints:
//! - GET    /health                              - health check with DB status
//! - GET    /version                             - server version info
//! - POST   /api/chat/send                       - send a message, stream the reply
//! - GET    /api/chat/conversations              - list conversations
//! - GET    /api/chat/conversations/:id          - one conversation
//! - PATCH  /api/chat/conversations/:id          - rename
//! - DELETE /api/chat/conversations/:id          - delete with its messages
//! - GET    /api/chat/conversations/:id/messages - message history
//! - GET    /api/knowledge                       - search (`q`, `limit`) or list
//! - POST   /api/knowledge                       - create entry
//! - GET    /api/knowledge/:id                   - one entry
//! - PATCH  /api/knowledge/:id                   - partial update
//! - DELETE /api/knowledge/:id                   - delete

use std::convert::Infallible;
use std::sync::Arc;

use agora_core::completion::CompletionBackend;
use agora_core::db::TableNames;
use agora_core::models::{
    CreateKnowledgeEntry, SearchKnowledgeQuery, SendMessageRequest, UpdateConversationRequest,
    UpdateKnowledgeEntry,
};
use agora_core::{AgoraConfig, AgoraError};
use anyhow::Result;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::subsystems::send::{self, ChatTurn};
use crate::subsystems::{chat, knowledge};

pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub pool: PgPool,
    pub config: AgoraConfig,
    pub tables: TableNames,
    pub completion: Arc<dyn CompletionBackend>,
}

impl HttpState {
    pub fn new(pool: PgPool, config: AgoraConfig, completion: Arc<dyn CompletionBackend>) -> Self {
        let tables = TableNames::from_config(&config.database);
        Self {
            pool,
            config,
            tables,
            completion,
        }
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/api/chat/send", post(send_handler))
        .route("/api/chat/conversations", get(list_conversations_handler))
        .route(
            "/api/chat/conversations/:id",
            get(get_conversation_handler)
                .patch(rename_conversation_handler)
                .delete(delete_conversation_handler),
        )
        .route(
            "/api/chat/conversations/:id/messages",
            get(conversation_messages_handler),
        )
        .route(
            "/api/knowledge",
            get(search_knowledge_handler).post(create_knowledge_handler),
        )
        .route(
            "/api/knowledge/:id",
            get(get_knowledge_handler)
                .patch(update_knowledge_handler)
                .delete(delete_knowledge_handler),
        )
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    pool: PgPool,
    config: AgoraConfig,
    completion: Arc<dyn CompletionBackend>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let state = Arc::new(HttpState::new(pool, config, completion));

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Agora HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Response helpers
// ============================================================================

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }

    fn into_value(self) -> Value {
        json!({ "error": self.error, "status": self.status })
    }
}

pub fn status_for(err: &AgoraError) -> StatusCode {
    match err {
        AgoraError::Validation(_) => StatusCode::BAD_REQUEST,
        AgoraError::NotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a service error to `(status, body)`. Internal details are logged, not returned.
pub fn error_inner(err: &AgoraError) -> (StatusCode, Value) {
    let status = status_for(err);
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "Request failed");
        "Internal server error".to_string()
    } else {
        err.to_string()
    };
    (status, ErrorResponse::new(message).into_value())
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, Value) {
    (StatusCode::BAD_REQUEST, ErrorResponse::new(msg).into_value())
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// 204 carries no body; everything else is JSON.
fn respond((status, body): (StatusCode, Value)) -> Response {
    if status == StatusCode::NO_CONTENT {
        status.into_response()
    } else {
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check: queries DB and returns (status_code, json_body).
pub async fn health_inner(pool: &PgPool) -> (StatusCode, Value) {
    let pg_ver = match agora_core::db::health_check(pool).await {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                }),
            );
        }
    };

    let search_trigger = agora_core::db::check_search_trigger(pool)
        .await
        .unwrap_or(false);

    (
        StatusCode::OK,
        json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "postgresql": pg_ver,
            "searchTrigger": search_trigger,
        }),
    )
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "agora/1",
    })
}

pub async fn list_conversations_inner(state: &HttpState) -> (StatusCode, Value) {
    match chat::list_conversations(&state.pool, &state.tables).await {
        Ok(conversations) => (StatusCode::OK, json!({ "conversations": conversations })),
        Err(e) => error_inner(&e),
    }
}

pub async fn get_conversation_inner(state: &HttpState, id: Uuid) -> (StatusCode, Value) {
    match chat::get_conversation(&state.pool, &state.tables, id).await {
        Ok(conversation) => (StatusCode::OK, to_value(&conversation)),
        Err(e) => error_inner(&e),
    }
}

pub async fn rename_conversation_inner(
    state: &HttpState,
    id: Uuid,
    req: UpdateConversationRequest,
) -> (StatusCode, Value) {
    match chat::rename_conversation(&state.pool, &state.tables, id, &req).await {
        Ok(conversation) => (StatusCode::OK, to_value(&conversation)),
        Err(e) => error_inner(&e),
    }
}

pub async fn delete_conversation_inner(state: &HttpState, id: Uuid) -> (StatusCode, Value) {
    match chat::delete_conversation(&state.pool, &state.tables, id).await {
        Ok(()) => (StatusCode::NO_CONTENT, Value::Null),
        Err(e) => error_inner(&e),
    }
}

pub async fn conversation_messages_inner(state: &HttpState, id: Uuid) -> (StatusCode, Value) {
    match chat::get_conversation_messages(&state.pool, &state.tables, id).await {
        Ok(messages) => (StatusCode::OK, json!({ "messages": messages })),
        Err(e) => error_inner(&e),
    }
}

/// Search when `q` is present and non-empty, otherwise list every entry.
pub async fn search_knowledge_inner(
    pool: &PgPool,
    query: SearchKnowledgeQuery,
) -> (StatusCode, Value) {
    let result = match query.validate() {
        Ok(Some((q, limit))) => knowledge::search_entries(pool, &q, limit).await,
        Ok(None) => knowledge::list_entries(pool).await,
        Err(e) => return error_inner(&e),
    };
    match result {
        Ok(entries) => (StatusCode::OK, json!({ "entries": entries })),
        Err(e) => error_inner(&e),
    }
}

pub async fn create_knowledge_inner(
    pool: &PgPool,
    req: CreateKnowledgeEntry,
) -> (StatusCode, Value) {
    match knowledge::create_entry(pool, &req).await {
        Ok(entry) => (StatusCode::CREATED, to_value(&entry)),
        Err(e) => error_inner(&e),
    }
}

pub async fn get_knowledge_inner(pool: &PgPool, id: Uuid) -> (StatusCode, Value) {
    match knowledge::get_entry(pool, id).await {
        Ok(entry) => (StatusCode::OK, to_value(&entry)),
        Err(e) => error_inner(&e),
    }
}

pub async fn update_knowledge_inner(
    pool: &PgPool,
    id: Uuid,
    req: UpdateKnowledgeEntry,
) -> (StatusCode, Value) {
    match knowledge::update_entry(pool, id, &req).await {
        Ok(entry) => (StatusCode::OK, to_value(&entry)),
        Err(e) => error_inner(&e),
    }
}

pub async fn delete_knowledge_inner(pool: &PgPool, id: Uuid) -> (StatusCode, Value) {
    match knowledge::delete_entry(pool, id).await {
        Ok(()) => (StatusCode::NO_CONTENT, Value::Null),
        Err(e) => error_inner(&e),
    }
}

/// Start a chat turn. Errors here still get a JSON body and a real status code.
pub async fn send_inner(
    state: &HttpState,
    req: SendMessageRequest,
) -> std::result::Result<ChatTurn, (StatusCode, Value)> {
    send::start_chat_turn(
        &state.pool,
        &state.tables,
        state.completion.as_ref(),
        &state.config,
        req,
    )
    .await
    .map_err(|e| error_inner(&e))
}

/// Wrap a started turn as an SSE response, one JSON frame per `data:` line.
pub fn sse_response(turn: ChatTurn) -> Response {
    let frames = turn
        .relay
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(Event::default().data(frame.to_json().to_string())));

    (
        [(CONVERSATION_ID_HEADER, turn.conversation_id.to_string())],
        Sse::new(frames).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

// ============================================================================
// Axum handler wrappers (thin: delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn send_handler(
    State(state): State<Arc<HttpState>>,
    payload: std::result::Result<Json<SendMessageRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return respond(bad_request(rejection.body_text())),
    };
    match send_inner(&state, req).await {
        Ok(turn) => sse_response(turn),
        Err(err) => respond(err),
    }
}

pub async fn list_conversations_handler(State(state): State<Arc<HttpState>>) -> Response {
    respond(list_conversations_inner(&state).await)
}

pub async fn get_conversation_handler(
    State(state): State<Arc<HttpState>>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
) -> Response {
    match id {
        Ok(Path(id)) => respond(get_conversation_inner(&state, id).await),
        Err(rejection) => respond(bad_request(rejection.body_text())),
    }
}

pub async fn rename_conversation_handler(
    State(state): State<Arc<HttpState>>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
    payload: std::result::Result<Json<UpdateConversationRequest>, JsonRejection>,
) -> Response {
    match (id, payload) {
        (Ok(Path(id)), Ok(Json(req))) => respond(rename_conversation_inner(&state, id, req).await),
        (Err(rejection), _) => respond(bad_request(rejection.body_text())),
        (_, Err(rejection)) => respond(bad_request(rejection.body_text())),
    }
}

pub async fn delete_conversation_handler(
    State(state): State<Arc<HttpState>>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
) -> Response {
    match id {
        Ok(Path(id)) => respond(delete_conversation_inner(&state, id).await),
        Err(rejection) => respond(bad_request(rejection.body_text())),
    }
}

pub async fn conversation_messages_handler(
    State(state): State<Arc<HttpState>>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
) -> Response {
    match id {
        Ok(Path(id)) => respond(conversation_messages_inner(&state, id).await),
        Err(rejection) => respond(bad_request(rejection.body_text())),
    }
}

pub async fn search_knowledge_handler(
    State(state): State<Arc<HttpState>>,
    query: std::result::Result<Query<SearchKnowledgeQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(query)) => respond(search_knowledge_inner(&state.pool, query).await),
        Err(rejection) => respond(bad_request(rejection.body_text())),
    }
}

pub async fn create_knowledge_handler(
    State(state): State<Arc<HttpState>>,
    payload: std::result::Result<Json<CreateKnowledgeEntry>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(req)) => respond(create_knowledge_inner(&state.pool, req).await),
        Err(rejection) => respond(bad_request(rejection.body_text())),
    }
}

pub async fn get_knowledge_handler(
    State(state): State<Arc<HttpState>>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
) -> Response {
    match id {
        Ok(Path(id)) => respond(get_knowledge_inner(&state.pool, id).await),
        Err(rejection) => respond(bad_request(rejection.body_text())),
    }
}

pub async fn update_knowledge_handler(
    State(state): State<Arc<HttpState>>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
    payload: std::result::Result<Json<UpdateKnowledgeEntry>, JsonRejection>,
) -> Response {
    match (id, payload) {
        (Ok(Path(id)), Ok(Json(req))) => respond(update_knowledge_inner(&state.pool, id, req).await),
        (Err(rejection), _) => respond(bad_request(rejection.body_text())),
        (_, Err(rejection)) => respond(bad_request(rejection.body_text())),
    }
}

pub async fn delete_knowledge_handler(
    State(state): State<Arc<HttpState>>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
) -> Response {
    match id {
        Ok(Path(id)) => respond(delete_knowledge_inner(&state.pool, id).await),
        Err(rejection) => respond(bad_request(rejection.body_text())),
    }
}

// ============================================================================
// Unit Tests: validation paths never touch the database
// ============================================================================

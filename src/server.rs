//! HTTP JSON API.
//!
//! A thin layer over [`ChatEngine`], [`KnowledgeBase`], and
//! [`ConversationStore`]. Every handler either answers directly from shared
//! state or hands off to one of those services.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/chat` | Answer the last message of a conversation and store the turn |
//! | `POST` | `/api/edit-message` | Edit a user message and regenerate its reply |
//! | `POST` | `/api/refresh-embeddings` | Re-read the folder and rebuild the index now |
//! | `GET`  | `/api/test-files` | List the files currently in the document cache, with its generation |
//! | `GET`  | `/api/conversations` | All stored conversations, keyed by id |
//! | `POST` | `/api/conversations` | Create an empty conversation |
//! | `DELETE` | `/api/conversations/{id}` | Delete a conversation |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "conversationId is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//! A chat turn that fails upstream is not an error: its reply is one of the
//! fallback messages from [`crate::synthesis`].
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser front end can
//! be served from anywhere.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::conversations::{ConversationLocks, ConversationMap, ConversationStore, StoreError};
use crate::knowledge::KnowledgeBase;
use crate::models::Conversation;
use crate::llm::{ChatBackend, OllamaChat};
use crate::synthesis::ChatEngine;

/// Shared state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<ChatEngine>,
    store: Arc<ConversationStore>,
    locks: Arc<ConversationLocks>,
}

impl AppState {
    pub fn new(engine: Arc<ChatEngine>, store: Arc<ConversationStore>) -> Self {
        Self {
            engine,
            store,
            locks: Arc::new(ConversationLocks::new()),
        }
    }

    fn knowledge(&self) -> &KnowledgeBase {
        self.engine.knowledge()
    }
}

/// Builds the API router over the given state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/api/edit-message", post(handle_edit_message))
        .route("/api/refresh-embeddings", post(handle_refresh))
        .route("/api/test-files", get(handle_test_files))
        .route(
            "/api/conversations",
            get(handle_list_conversations).post(handle_create_conversation),
        )
        .route("/api/conversations/{id}", delete(handle_delete_conversation))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server and the background refresher, and runs until
/// Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_until(config, shutdown_signal()).await
}

/// Like [`run_server`], but shuts down gracefully when `shutdown` resolves.
///
/// The refresher is stopped after the last in-flight request finishes.
pub async fn run_server_until(
    config: &Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let knowledge = Arc::new(KnowledgeBase::from_config(config)?);
    let backend: Arc<dyn ChatBackend> = Arc::new(OllamaChat::new(&config.model)?);
    let engine = Arc::new(ChatEngine::new(knowledge.clone(), backend, config));
    let store = Arc::new(ConversationStore::new(&config.conversations.path));

    let refresher = knowledge
        .clone()
        .spawn_refresher(config.files.refresh_interval());

    let app = router(AppState::new(engine, store));
    let listener = match tokio::net::TcpListener::bind(&config.server.bind).await {
        Ok(l) => l,
        Err(e) => {
            refresher.stop().await;
            return Err(e.into());
        }
    };
    info!(
        bind = %config.server.bind,
        model = %config.model.model,
        folder = %config.files.folder.display(),
        "server listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    refresher.stop().await;
    info!("server stopped");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Machine-readable code plus a human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => not_found("Conversation not found"),
            StoreError::NotEditable(index) => bad_request(format!(
                "Invalid message index {}: not a user message followed by an assistant reply",
                index
            )),
            other => {
                error!(error = %other, "conversation store failure");
                internal(other.to_string())
            }
        }
    }
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatBody {
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    #[serde(default)]
    messages: Vec<IncomingMessage>,
}

/// A message as sent by the client; only the content is used.
#[derive(Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct ChatResponse {
    content: String,
}

/// Handler for `POST /api/chat`.
///
/// The last message is the question. The turn holds the conversation's lock
/// until its reply is stored, so concurrent turns of one conversation are
/// answered and stored in arrival order.
async fn handle_chat(
    State(state): State<AppState>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let Json(body) = body.map_err(|e| bad_request(format!("Invalid conversation data: {}", e)))?;

    let conversation_id = body
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| bad_request("Invalid conversation data: conversationId is required"))?;
    let question = body
        .messages
        .last()
        .map(|m| m.content.clone())
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| bad_request("Invalid conversation data: messages must not be empty"))?;

    let _turn = state.locks.lock(&conversation_id).await;
    if state.store.get(&conversation_id).await.is_none() {
        return Err(not_found("Conversation not found"));
    }

    let reply = state.engine.answer_turn(&question).await;
    info!(
        conversation = %conversation_id,
        retrieval = reply.retrieval_kind,
        negotiation_attempts = reply.attempts,
        "chat turn answered"
    );

    state
        .store
        .append_turn(&conversation_id, &question, &reply.content)
        .await?;

    Ok(Json(ChatResponse {
        content: reply.content,
    }))
}

// ============ POST /api/edit-message ============

#[derive(Deserialize)]
struct EditBody {
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    #[serde(rename = "messageIndex")]
    message_index: Option<usize>,
    #[serde(rename = "newContent")]
    new_content: Option<String>,
}

#[derive(Serialize)]
struct EditResponse {
    content: String,
    conversation: Conversation,
}

/// Handler for `POST /api/edit-message`.
///
/// Replaces a user message, drops everything after its reply, and asks the
/// model again with the history up to the edited message. Holds the
/// conversation's turn lock like a chat turn.
async fn handle_edit_message(
    State(state): State<AppState>,
    body: Result<Json<EditBody>, JsonRejection>,
) -> Result<Json<EditResponse>, AppError> {
    let Json(body) = body.map_err(|e| bad_request(format!("Missing data: {}", e)))?;
    let (Some(id), Some(index), Some(content)) = (
        body.conversation_id.filter(|id| !id.trim().is_empty()),
        body.message_index,
        body.new_content.filter(|c| !c.trim().is_empty()),
    ) else {
        return Err(bad_request(
            "Missing data: conversationId, messageIndex, and newContent are required",
        ));
    };

    let _turn = state.locks.lock(&id).await;
    let conversation = state
        .store
        .get(&id)
        .await
        .ok_or_else(|| not_found("Conversation not found"))?;
    let history = conversation
        .history_with_edit(index, &content)
        .ok_or(StoreError::NotEditable(index))?;

    let reply = state.engine.regenerate(&history).await;
    info!(conversation = %id, index, "message edited, reply regenerated");
    let conversation = state.store.rewrite_turn(&id, index, &content, &reply).await?;

    Ok(Json(EditResponse {
        content: reply,
        conversation,
    }))
}

// ============ POST /api/refresh-embeddings ============

#[derive(Serialize)]
struct RefreshResponse {
    status: String,
    files: usize,
    chunks: usize,
}

async fn handle_refresh(State(state): State<AppState>) -> Result<Json<RefreshResponse>, AppError> {
    let summary = state.knowledge().trigger_refresh().await.map_err(|e| {
        error!(error = %e, "manual refresh failed");
        internal(format!("refresh failed: {:#}", e))
    })?;
    Ok(Json(RefreshResponse {
        status: "Embeddings refreshed".to_string(),
        files: summary.files,
        chunks: summary.chunks,
    }))
}

// ============ GET /api/test-files ============

#[derive(Serialize)]
struct FilesResponse {
    file_count: usize,
    files: Vec<String>,
    generation: u64,
    refreshed_at: Option<DateTime<Utc>>,
}

async fn handle_test_files(State(state): State<AppState>) -> Json<FilesResponse> {
    let snapshot = state.knowledge().cache().snapshot();
    let files = snapshot.paths();
    Json(FilesResponse {
        file_count: files.len(),
        files,
        generation: snapshot.generation,
        refreshed_at: snapshot.refreshed_at,
    })
}

// ============ /api/conversations ============

async fn handle_list_conversations(State(state): State<AppState>) -> Json<ConversationMap> {
    Json(state.store.list().await)
}

#[derive(Serialize)]
struct CreatedResponse {
    id: String,
}

async fn handle_create_conversation(
    State(state): State<AppState>,
) -> Result<Json<CreatedResponse>, AppError> {
    let id = state.store.create().await?;
    Ok(Json(CreatedResponse { id }))
}

#[derive(Serialize)]
struct DeletedResponse {
    status: String,
}

async fn handle_delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, AppError> {
    if !state.store.delete(&id).await? {
        return Err(not_found("Conversation not found"));
    }
    Ok(Json(DeletedResponse {
        status: "deleted".to_string(),
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

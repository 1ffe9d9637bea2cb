//! Thread and message endpoints.
//!
//! Posting a message runs the full question pipeline synchronously: the
//! user message is stored, the pipeline produces exactly one tagged
//! outcome, and the server reply (with pipeline metadata) is stored and
//! returned. Semantic failures (rejection, clarification, execution
//! errors) are 200s; only transport-level pipeline failures are 500s, and
//! those store no server message.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Local;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::store::{Message, Sender, Thread, TokenUsage};
use crate::AppState;

/// Create the threads router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/threads", get(list_threads).post(create_thread))
        .route("/api/threads/{id}", get(get_thread))
        .route(
            "/api/threads/{id}/messages",
            get(get_messages).post(create_message),
        )
        .route("/api/threads/{id}/tokens", get(get_tokens))
        .route("/api/threads/{id}/databases", get(get_databases))
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Thread not found"})),
    )
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
}

fn internal_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": "I encountered an issue processing your question. Please try again."
        })),
    )
}

/// List all threads, newest first.
async fn list_threads(State(state): State<AppState>) -> Json<Vec<Thread>> {
    Json(state.store.list_threads().await)
}

/// Create-thread request body.
#[derive(Debug, Default, Deserialize)]
struct CreateThreadRequest {
    name: Option<String>,
}

/// Create a new thread, generating a name when none is given.
async fn create_thread(
    State(state): State<AppState>,
    body: Option<Json<CreateThreadRequest>>,
) -> (StatusCode, Json<Thread>) {
    let name = body
        .and_then(|Json(req)| req.name)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(random_thread_name);

    let thread = state.store.create_thread(&name).await;
    (StatusCode::CREATED, Json(thread))
}

/// Fetch one thread.
async fn get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Thread>, ApiError> {
    state
        .store
        .get_thread(&id)
        .await
        .map(Json)
        .ok_or_else(not_found)
}

/// All messages of a thread, in insertion order.
async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    if state.store.get_thread(&id).await.is_none() {
        return Err(not_found());
    }
    let messages = state.store.get_messages(&id).await.map_err(|_| not_found())?;
    Ok(Json(messages))
}

/// Create-message request body.
#[derive(Debug, Deserialize)]
struct CreateMessageRequest {
    content: Option<String>,
}

/// Message exchange response: the stored user message and the pipeline's
/// reply.
#[derive(Debug, Serialize)]
struct MessageExchangeResponse {
    user_message: Message,
    server_message: Message,
}

/// Post a question and run the pipeline.
async fn create_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<MessageExchangeResponse>), ApiError> {
    if state.store.get_thread(&id).await.is_none() {
        return Err(not_found());
    }

    let content = body
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| bad_request("Content is required"))?;

    // History is captured before this turn's user message is appended.
    let history = state.store.get_messages(&id).await.map_err(|_| not_found())?;

    let user_message = state
        .store
        .add_message(&id, Sender::User, &content, None)
        .await
        .map_err(|_| not_found())?;

    let report = match state
        .orchestrator
        .process_turn(&id, &content, &history)
        .await
    {
        Ok(report) => report,
        Err(e) => {
            // Transport-level failure: no partial server reply is stored.
            tracing::error!(thread_id = %id, error = %e, "Pipeline failed");
            return Err(internal_error());
        }
    };

    let metadata = serde_json::json!({
        "result": report.outcome,
        "plan": report.plan,
        "step_results": report.step_results,
        "stages": report.stages,
        "pipeline_time_ms": report.pipeline_time_ms,
    });

    let server_message = state
        .store
        .add_message(&id, Sender::Server, report.outcome.message(), Some(metadata))
        .await
        .map_err(|_| not_found())?;

    Ok((
        StatusCode::CREATED,
        Json(MessageExchangeResponse {
            user_message,
            server_message,
        }),
    ))
}

/// Token usage response.
#[derive(Debug, Serialize)]
struct TokenUsageResponse {
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
    calls: u64,
}

impl From<TokenUsage> for TokenUsageResponse {
    fn from(usage: TokenUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            calls: usage.call_count,
        }
    }
}

/// A thread's aggregated token usage.
async fn get_tokens(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TokenUsageResponse>, ApiError> {
    let usage = state
        .store
        .get_token_usage(&id)
        .await
        .map_err(|_| not_found())?;
    Ok(Json(usage.into()))
}

/// Used-databases response.
#[derive(Debug, Serialize)]
struct UsedDatabasesResponse {
    databases: Vec<String>,
}

/// The databases a thread has consulted, sorted.
async fn get_databases(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UsedDatabasesResponse>, ApiError> {
    let databases = state
        .store
        .get_used_databases(&id)
        .await
        .map_err(|_| not_found())?;
    Ok(Json(UsedDatabasesResponse { databases }))
}

/// Generate a display name like "Swift Thread 14:32".
fn random_thread_name() -> String {
    const ADJECTIVES: [&str; 8] = [
        "Quick", "Happy", "Bright", "Swift", "Cool", "Smart", "Nice", "Fun",
    ];
    const NOUNS: [&str; 5] = ["Chat", "Talk", "Thread", "Discussion", "Conversation"];

    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"Quick");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"Chat");
    format!("{adjective} {noun} {}", Local::now().format("%H:%M"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_thread_names_have_three_parts() {
        let name = random_thread_name();
        let parts: Vec<&str> = name.split(' ').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[2].contains(':'));
    }
}
